//! Per-instance execution state
//!
//! A [`Conversation`] is created by [`Component::start_conversation`] and is
//! the only mutable state of an execution: messages, the step cursor, values
//! produced so far, per-step scratch state and the sub-conversations of
//! wrapping steps. Flows, steps and agents themselves are immutable.

use crate::component::Component;
use crate::error::{FlowError, Result};
use crate::interrupt::{ExecutionInterrupt, InterruptContext};
use crate::llm::TokenUsage;
use crate::message::{Message, MessageList, MessageRole};
use crate::property::Values;
use crate::status::ExecutionStatus;
use crate::tool::ToolResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Caller's answer to a tool confirmation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ConfirmationDecision {
    Confirmed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified_args: Option<Value>,
    },
    Rejected {
        reason: String,
    },
}

/// Outcome of driving a sub-conversation
pub(crate) struct SubRun {
    pub status: ExecutionStatus,
    pub final_message: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProducedOutputs {
    seq: u64,
    values: Values,
}

#[derive(Serialize, Deserialize)]
pub struct Conversation {
    id: String,
    component_id: String,
    component_name: String,
    messages: MessageList,
    #[serde(default)]
    shares_parent_messages: bool,
    /// Parent message count at the last suspension of an isolated sub-conversation
    #[serde(default)]
    parent_marker: Option<usize>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    history: Vec<String>,
    #[serde(default)]
    inputs: Values,
    #[serde(default)]
    produced: BTreeMap<String, ProducedOutputs>,
    #[serde(default)]
    next_seq: u64,
    #[serde(default)]
    step_state: BTreeMap<String, Value>,
    #[serde(default)]
    sub_conversations: BTreeMap<String, Conversation>,
    #[serde(default)]
    confirmations: BTreeMap<String, ConfirmationDecision>,
    #[serde(default)]
    token_usage: TokenUsage,
    #[serde(default)]
    finished: bool,
    /// Usage of the enclosing conversations, for token interrupts
    #[serde(skip)]
    usage_offset: TokenUsage,
    #[serde(skip)]
    interrupts: Vec<Arc<dyn ExecutionInterrupt>>,
}

impl Conversation {
    pub(crate) fn new(
        component_id: &str,
        component_name: &str,
        inputs: Values,
        messages: MessageList,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            component_id: component_id.to_string(),
            component_name: component_name.to_string(),
            messages,
            shares_parent_messages: false,
            parent_marker: None,
            cursor: None,
            history: Vec::new(),
            inputs,
            produced: BTreeMap::new(),
            next_seq: 0,
            step_state: BTreeMap::new(),
            sub_conversations: BTreeMap::new(),
            confirmations: BTreeMap::new(),
            token_usage: TokenUsage::default(),
            finished: false,
            usage_offset: TokenUsage::default(),
            interrupts: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn inputs(&self) -> &Values {
        &self.inputs
    }

    pub fn messages(&self) -> &MessageList {
        &self.messages
    }

    /// Every message, including internal ones
    pub fn message_history(&self) -> Vec<Message> {
        self.messages.to_vec()
    }

    /// Messages meant for the user
    pub fn visible_messages(&self) -> Vec<Message> {
        self.messages.to_vec().into_iter().filter(|m| !m.internal).collect()
    }

    pub fn append_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn append_user_message(&mut self, text: impl Into<String>) {
        self.append_message(Message::user(text));
    }

    pub fn append_agent_message(&mut self, text: impl Into<String>) {
        self.append_message(Message::agent(text));
    }

    pub fn append_tool_result(&mut self, result: ToolResult) {
        self.append_message(Message::tool_result(result));
    }

    /// Approve a pending tool call, optionally replacing its arguments
    pub fn confirm_tool_execution(
        &mut self,
        request_id: impl Into<String>,
        modified_args: Option<Value>,
    ) {
        self.confirmations
            .insert(request_id.into(), ConfirmationDecision::Confirmed { modified_args });
    }

    /// Refuse a pending tool call; the reason becomes its result
    pub fn reject_tool_execution(
        &mut self,
        request_id: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.confirmations.insert(
            request_id.into(),
            ConfirmationDecision::Rejected {
                reason: reason.into(),
            },
        );
    }

    /// Step the next `execute` resumes at
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Steps completed so far, in order
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Tokens used by this conversation and its sub-conversations
    pub fn token_usage(&self) -> TokenUsage {
        self.token_usage
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn sub_conversation(&self, key: &str) -> Option<&Conversation> {
        self.sub_conversations.get(key)
    }

    pub fn sub_conversation_count(&self) -> usize {
        self.sub_conversations.len()
    }

    #[must_use]
    pub fn with_interrupts(mut self, interrupts: Vec<Arc<dyn ExecutionInterrupt>>) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub fn add_interrupt(&mut self, interrupt: Arc<dyn ExecutionInterrupt>) {
        self.interrupts.push(interrupt);
    }

    /// Serialize the whole conversation tree. Interrupts are not included.
    pub fn snapshot(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rebuild a conversation from [`snapshot`](Self::snapshot) output.
    ///
    /// Sub-conversations that shared their parent's message list share it
    /// again.
    pub fn restore(snapshot: &str) -> Result<Self> {
        let mut conversation: Conversation = serde_json::from_str(snapshot)?;
        conversation.relink_shared_messages();
        Ok(conversation)
    }

    fn relink_shared_messages(&mut self) {
        for sub in self.sub_conversations.values_mut() {
            if sub.shares_parent_messages {
                sub.messages = self.messages.clone();
            }
            sub.relink_shared_messages();
        }
    }

    pub(crate) fn check_executable(&self, component_id: &str) -> Result<()> {
        if self.component_id != component_id {
            return Err(FlowError::IdentityMismatch {
                expected: component_id.to_string(),
                actual: self.component_id.clone(),
            });
        }
        if self.finished {
            return Err(FlowError::ConversationFinished(self.id.clone()));
        }
        Ok(())
    }

    pub(crate) fn check_interrupts(&self) -> Option<String> {
        if self.interrupts.is_empty() {
            return None;
        }
        let ctx = InterruptContext {
            conversation_id: &self.id,
            token_usage: self.total_token_usage(),
        };
        self.interrupts.iter().find_map(|i| i.check(&ctx))
    }

    pub(crate) fn interrupts(&self) -> Vec<Arc<dyn ExecutionInterrupt>> {
        self.interrupts.clone()
    }

    pub(crate) fn add_token_usage(&mut self, usage: TokenUsage) {
        self.token_usage += usage;
    }

    fn total_token_usage(&self) -> TokenUsage {
        let mut total = self.usage_offset;
        total += self.token_usage;
        total
    }

    pub(crate) fn set_cursor(&mut self, step: Option<String>) {
        self.cursor = step;
    }

    pub(crate) fn push_history(&mut self, step: &str) {
        self.history.push(step.to_string());
    }

    pub(crate) fn finish(&mut self) {
        self.finished = true;
        self.cursor = None;
        self.step_state.clear();
        self.sub_conversations.clear();
    }

    pub(crate) fn record_outputs(&mut self, step: &str, values: Values) {
        self.next_seq += 1;
        self.produced.insert(
            step.to_string(),
            ProducedOutputs {
                seq: self.next_seq,
                values,
            },
        );
    }

    /// Output `name` of `step`, with the sequence number it was produced at
    pub(crate) fn output_of(&self, step: &str, name: &str) -> Option<(u64, &Value)> {
        self.produced
            .get(step)
            .and_then(|p| p.values.get(name).map(|v| (p.seq, v)))
    }

    /// Most recently produced value named `name`, with its producing step
    pub(crate) fn latest_output(&self, name: &str) -> Option<(&str, &Value)> {
        self.produced
            .iter()
            .filter_map(|(step, p)| p.values.get(name).map(|v| (p.seq, step.as_str(), v)))
            .max_by_key(|(seq, _, _)| *seq)
            .map(|(_, step, v)| (step, v))
    }

    pub(crate) fn step_state(&self, key: &str) -> Option<&Value> {
        self.step_state.get(key)
    }

    pub(crate) fn set_step_state(&mut self, key: &str, state: Value) {
        self.step_state.insert(key.to_string(), state);
    }

    pub(crate) fn clear_step_state(&mut self, key: &str) {
        self.step_state.remove(key);
    }

    pub(crate) fn confirmation(&self, request_id: &str) -> Option<&ConfirmationDecision> {
        self.confirmations.get(request_id)
    }

    pub(crate) fn take_confirmation(&mut self, request_id: &str) -> Option<ConfirmationDecision> {
        self.confirmations.remove(request_id)
    }

    /// Tool result with the given request id, if the caller appended one
    pub(crate) fn find_tool_result(&self, request_id: &str) -> Option<ToolResult> {
        self.messages.find_map(|m| {
            m.as_tool_result()
                .filter(|r| r.id == request_id)
                .cloned()
        })
    }

    /// Start or resume the sub-conversation stored under `key` and drive it.
    ///
    /// A new sub-conversation either shares this conversation's message list
    /// or starts from `seed`. An isolated one receives every message appended
    /// here since it last suspended. The sub-conversation is dropped once it
    /// finishes or fails, and kept for resumption otherwise.
    pub(crate) async fn run_sub_conversation(
        &mut self,
        key: &str,
        component: &dyn Component,
        inputs: Values,
        seed: Vec<Message>,
        share_messages: bool,
    ) -> Result<ExecutionStatus> {
        self.drive_sub_conversation(key, component, inputs, seed, share_messages)
            .await
            .map(|run| run.status)
    }

    /// Same as [`run_sub_conversation`](Self::run_sub_conversation), also
    /// returning the last agent message of a sub-conversation that finished.
    pub(crate) async fn drive_sub_conversation(
        &mut self,
        key: &str,
        component: &dyn Component,
        inputs: Values,
        seed: Vec<Message>,
        share_messages: bool,
    ) -> Result<SubRun> {
        let mut sub = match self.sub_conversations.remove(key) {
            Some(mut sub) => {
                if let Some(marker) = sub.parent_marker.take() {
                    for message in self.messages.since(marker) {
                        sub.messages.push(message);
                    }
                }
                sub
            }
            None => {
                let mut sub = if share_messages {
                    let sub = component.start_conversation_with(inputs, self.messages.clone())?;
                    for message in seed {
                        sub.messages.push(message);
                    }
                    sub
                } else {
                    component.start_conversation(inputs, seed)?
                };
                sub.shares_parent_messages = share_messages;
                tracing::debug!(
                    conversation_id = %self.id,
                    sub_conversation_id = %sub.id,
                    key,
                    shared = share_messages,
                    "Started sub-conversation"
                );
                sub
            }
        };

        sub.confirmations.append(&mut self.confirmations);
        sub.interrupts = self.interrupts.clone();
        let before = sub.token_usage;
        sub.usage_offset = self.total_token_usage();
        sub.usage_offset.input_tokens =
            sub.usage_offset.input_tokens.saturating_sub(before.input_tokens);
        sub.usage_offset.output_tokens =
            sub.usage_offset.output_tokens.saturating_sub(before.output_tokens);

        let result = component.execute(&mut sub).await;

        self.token_usage += TokenUsage {
            input_tokens: sub.token_usage.input_tokens.saturating_sub(before.input_tokens),
            output_tokens: sub.token_usage.output_tokens.saturating_sub(before.output_tokens),
        };

        let status = match result {
            Ok(status) => status,
            Err(e) if e.is_protocol_error() => {
                // still resumable once the caller supplies what is missing
                if !sub.shares_parent_messages {
                    sub.parent_marker = Some(self.messages.len());
                }
                self.sub_conversations.insert(key.to_string(), sub);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if status.is_finished() {
            let final_message = sub
                .messages
                .to_vec()
                .into_iter()
                .rev()
                .find(|m| m.role == MessageRole::Agent && !m.internal && !m.text().is_empty());
            return Ok(SubRun {
                status,
                final_message,
            });
        }
        if !sub.shares_parent_messages {
            sub.parent_marker = Some(self.messages.len());
        }
        self.sub_conversations.insert(key.to_string(), sub);
        Ok(SubRun {
            status,
            final_message: None,
        })
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("component", &self.component_name)
            .field("cursor", &self.cursor)
            .field("messages", &self.messages.len())
            .field("sub_conversations", &self.sub_conversations.keys().collect::<Vec<_>>())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::SoftTokenLimitInterrupt;
    use serde_json::json;
    use std::io::{Read, Write};

    fn conversation() -> Conversation {
        Conversation::new("flow-1", "greeter", Values::new(), MessageList::default())
    }

    #[test]
    fn test_identity_and_finished_checks() {
        let mut conv = conversation();
        assert!(conv.check_executable("flow-1").is_ok());
        assert!(matches!(
            conv.check_executable("flow-2"),
            Err(FlowError::IdentityMismatch { .. })
        ));
        conv.finish();
        assert!(matches!(
            conv.check_executable("flow-1"),
            Err(FlowError::ConversationFinished(_))
        ));
    }

    #[test]
    fn test_visible_messages_skip_internal() {
        let mut conv = conversation();
        conv.append_user_message("hi");
        conv.append_message(Message::system("reminder").internal());
        conv.append_agent_message("hello");
        assert_eq!(conv.message_history().len(), 3);
        let visible: Vec<_> = conv
            .visible_messages()
            .iter()
            .map(|m| m.text().to_string())
            .collect();
        assert_eq!(visible, vec!["hi", "hello"]);
    }

    #[test]
    fn test_latest_output_wins() {
        let mut conv = conversation();
        conv.record_outputs("a", [("x".to_string(), json!(1))].into());
        conv.record_outputs("b", [("x".to_string(), json!(2))].into());
        assert_eq!(conv.latest_output("x"), Some(("b", &json!(2))));
        conv.record_outputs("a", [("x".to_string(), json!(3))].into());
        assert_eq!(conv.latest_output("x"), Some(("a", &json!(3))));
        assert_eq!(conv.output_of("b", "x").map(|(_, v)| v.clone()), Some(json!(2)));
        assert!(conv.latest_output("y").is_none());
    }

    #[test]
    fn test_confirmation_decisions() {
        let mut conv = conversation();
        conv.confirm_tool_execution("r1", Some(json!({"path": "/tmp"})));
        conv.reject_tool_execution("r2", "not allowed");
        assert!(matches!(
            conv.confirmation("r1"),
            Some(ConfirmationDecision::Confirmed { modified_args: Some(_) })
        ));
        assert_eq!(
            conv.take_confirmation("r2"),
            Some(ConfirmationDecision::Rejected {
                reason: "not allowed".to_string()
            })
        );
        assert!(conv.confirmation("r2").is_none());
    }

    #[test]
    fn test_token_interrupt_sees_usage() {
        let mut conv =
            conversation().with_interrupts(vec![Arc::new(SoftTokenLimitInterrupt::new(10))]);
        assert!(conv.check_interrupts().is_none());
        conv.add_token_usage(TokenUsage {
            input_tokens: 6,
            output_tokens: 4,
        });
        assert!(conv.check_interrupts().is_some());
    }

    #[test]
    fn test_snapshot_relinks_shared_sub_conversations() {
        let mut parent = conversation();
        parent.append_user_message("hello");
        let mut shared =
            Conversation::new("inner", "inner", Values::new(), parent.messages.clone());
        shared.shares_parent_messages = true;
        shared.cursor = Some("ask".to_string());
        parent.sub_conversations.insert("step:flow".to_string(), shared);
        let isolated = Conversation::new("other", "other", Values::new(), MessageList::default());
        parent.sub_conversations.insert("step:other".to_string(), isolated);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(parent.snapshot().unwrap().as_bytes()).unwrap();
        let mut json = String::new();
        file.reopen().unwrap().read_to_string(&mut json).unwrap();

        let mut restored = Conversation::restore(&json).unwrap();
        assert_eq!(restored.id(), parent.id());
        let sub = restored.sub_conversation("step:flow").unwrap();
        assert_eq!(sub.cursor(), Some("ask"));
        assert!(sub.messages().is_shared_with(restored.messages()));
        assert!(!restored
            .sub_conversation("step:other")
            .unwrap()
            .messages()
            .is_shared_with(restored.messages()));

        restored.append_agent_message("visible in the sub-conversation too");
        assert_eq!(restored.sub_conversation("step:flow").unwrap().messages().len(), 2);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        assert!(matches!(Conversation::restore("{not json"), Err(FlowError::Snapshot(_))));
    }
}
