//! Anything that can own and drive a conversation: flows and agents

use crate::conversation::Conversation;
use crate::error::{FlowError, Result};
use crate::message::{Message, MessageList};
use crate::property::{resolve_values, Property, ResolveError, Values};
use crate::status::ExecutionStatus;
use async_trait::async_trait;

#[async_trait]
pub trait Component: Send + Sync {
    /// Stable identifier; conversations remember which component started them
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn input_descriptors(&self) -> &[Property];

    fn output_descriptors(&self) -> &[Property];

    /// Whether `execute` can return before finishing
    fn might_yield(&self) -> bool;

    /// Start a conversation with its own message list
    fn start_conversation(&self, inputs: Values, messages: Vec<Message>) -> Result<Conversation> {
        self.start_conversation_with(inputs, MessageList::new(messages))
    }

    /// Start a conversation on an existing (possibly shared) message list
    fn start_conversation_with(
        &self,
        inputs: Values,
        messages: MessageList,
    ) -> Result<Conversation> {
        let inputs = resolve_values(self.input_descriptors(), &inputs).map_err(|e| match e {
            ResolveError::Missing(name) => FlowError::MissingInput(format!(
                "input `{name}` of `{}` has no value and no default",
                self.name()
            )),
            ResolveError::Type(e) => FlowError::Type(e),
        })?;
        Ok(Conversation::new(self.id(), self.name(), inputs, messages))
    }

    /// Drive the conversation to its next suspension point or to the end
    async fn execute(&self, conversation: &mut Conversation) -> Result<ExecutionStatus>;
}
