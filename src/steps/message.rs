//! Message steps: talk to the user, wait for the user

use crate::error::{FlowError, Result};
use crate::message::{Message, MessageRole};
use crate::property::{Property, Values};
use crate::status::Suspension;
use crate::step::{Step, StepContext, StepResult};
use crate::template;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const OUTPUT_MESSAGE: &str = "output_message";
pub const USER_PROVIDED_INPUT: &str = "user_provided_input";

fn template_inputs(template: &str) -> Vec<Property> {
    template::variables(template)
        .into_iter()
        .map(Property::string)
        .collect()
}

fn render(step: &StepContext<'_>, template: &str, inputs: &Values) -> Result<String> {
    template::render(template, inputs).map_err(|e| FlowError::step(step.step_name(), e))
}

/// Renders a template and appends it to the conversation
pub struct OutputMessageStep {
    template: String,
    role: MessageRole,
    internal: bool,
    inputs: Vec<Property>,
    outputs: Vec<Property>,
}

impl OutputMessageStep {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        Self {
            inputs: template_inputs(&template),
            outputs: vec![Property::string(OUTPUT_MESSAGE)],
            template,
            role: MessageRole::Agent,
            internal: false,
        }
    }

    #[must_use]
    pub fn role(mut self, role: MessageRole) -> Self {
        self.role = role;
        self
    }

    /// Keep the message out of `visible_messages`
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

#[async_trait]
impl Step for OutputMessageStep {
    fn kind(&self) -> &'static str {
        "output_message"
    }

    fn input_descriptors(&self) -> &[Property] {
        &self.inputs
    }

    fn output_descriptors(&self) -> &[Property] {
        &self.outputs
    }

    async fn invoke(&self, inputs: Values, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let text = render(ctx, &self.template, &inputs)?;
        let mut message = match self.role {
            MessageRole::User => Message::user(&text),
            MessageRole::Agent => Message::agent(&text),
            MessageRole::System => Message::system(&text),
        };
        message.internal = self.internal;
        ctx.append_message(message);
        Ok(StepResult::next(
            [(OUTPUT_MESSAGE.to_string(), Value::String(text))].into(),
        ))
    }
}

#[derive(Serialize, Deserialize)]
struct AwaitingReply {
    /// Message count when the step suspended
    after: usize,
}

/// Optionally posts a prompt, then waits for the user's reply
pub struct InputMessageStep {
    prompt: Option<String>,
    inputs: Vec<Property>,
    outputs: Vec<Property>,
}

impl InputMessageStep {
    pub fn new() -> Self {
        Self {
            prompt: None,
            inputs: Vec::new(),
            outputs: vec![Property::string(USER_PROVIDED_INPUT)],
        }
    }

    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            inputs: template_inputs(&prompt),
            prompt: Some(prompt),
            outputs: vec![Property::string(USER_PROVIDED_INPUT)],
        }
    }
}

impl Default for InputMessageStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for InputMessageStep {
    fn kind(&self) -> &'static str {
        "input_message"
    }

    fn input_descriptors(&self) -> &[Property] {
        &self.inputs
    }

    fn output_descriptors(&self) -> &[Property] {
        &self.outputs
    }

    fn might_yield(&self) -> bool {
        true
    }

    async fn invoke(&self, inputs: Values, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        match ctx.state::<AwaitingReply>()? {
            None => {
                let message = match &self.prompt {
                    Some(prompt) => {
                        let message = Message::agent(render(ctx, prompt, &inputs)?);
                        ctx.append_message(message.clone());
                        Some(message)
                    }
                    None => None,
                };
                let after = ctx.messages().len();
                ctx.set_state(&AwaitingReply { after })?;
                Ok(StepResult::yielding(Suspension::UserMessage { message }))
            }
            Some(AwaitingReply { after }) => {
                let reply = ctx
                    .messages()
                    .since(after)
                    .into_iter()
                    .find(Message::is_user_text)
                    .ok_or_else(|| {
                        FlowError::MissingInput(format!(
                            "step `{}` is waiting for a user message",
                            ctx.step_name()
                        ))
                    })?;
                ctx.clear_state();
                Ok(StepResult::next(
                    [(
                        USER_PROVIDED_INPUT.to_string(),
                        Value::String(reply.text().to_string()),
                    )]
                    .into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::flow::Flow;
    use crate::status::ExecutionStatus;
    use serde_json::json;
    use std::sync::Arc;

    fn echo_flow() -> Flow {
        let ask = InputMessageStep::with_prompt("What is your name, {{title}}?");
        let reply = OutputMessageStep::new("Hello {{user_provided_input}}");
        Flow::sequence(
            "echo",
            vec![
                ("ask", Arc::new(ask) as Arc<dyn Step>),
                ("reply", Arc::new(reply) as Arc<dyn Step>),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_input_then_output() {
        let flow = echo_flow();
        assert_eq!(flow.inputs().len(), 1);
        let mut conv = flow
            .start_conversation([("title".to_string(), json!("captain"))].into(), vec![])
            .unwrap();

        let status = flow.execute(&mut conv).await.unwrap();
        let ExecutionStatus::UserMessageRequest { message: Some(prompt) } = status else {
            panic!("expected a user message request, got {status:?}");
        };
        assert_eq!(prompt.text(), "What is your name, captain?");
        assert_eq!(conv.cursor(), Some("ask"));

        conv.append_user_message("Ada");
        let status = flow.execute(&mut conv).await.unwrap();
        assert!(status.is_finished());
        let outputs = status.output_values().unwrap();
        assert_eq!(outputs["output_message"], json!("Hello Ada"));
        assert_eq!(outputs["user_provided_input"], json!("Ada"));
        assert_eq!(conv.visible_messages().last().unwrap().text(), "Hello Ada");
    }

    #[tokio::test]
    async fn test_resume_without_reply_is_missing_input() {
        let flow = echo_flow();
        let mut conv = flow
            .start_conversation([("title".to_string(), json!("doc"))].into(), vec![])
            .unwrap();
        flow.execute(&mut conv).await.unwrap();
        let err = flow.execute(&mut conv).await.unwrap_err();
        assert!(matches!(err, FlowError::MissingInput(_)));

        conv.append_user_message("Grace");
        assert!(flow.execute(&mut conv).await.unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_internal_output_is_hidden() {
        let flow = Flow::sequence(
            "note",
            vec![(
                "note",
                Arc::new(OutputMessageStep::new("bookkeeping").internal()) as Arc<dyn Step>,
            )],
        )
        .unwrap();
        let mut conv = flow.start_conversation(Values::new(), vec![]).unwrap();
        flow.execute(&mut conv).await.unwrap();
        assert_eq!(conv.message_history().len(), 1);
        assert!(conv.visible_messages().is_empty());
    }
}
