//! Step execution contract
//!
//! A step is a stateless unit of work with typed inputs and outputs. Whatever
//! it must remember between invocations (for example while suspended) lives
//! in its conversation slot, reached through [`StepContext`].

use crate::component::Component;
use crate::conversation::Conversation;
use crate::error::{FlowError, Result};
use crate::message::{Message, MessageList};
use crate::property::{Property, Values};
use crate::status::{ExecutionStatus, Suspension};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Branch taken by steps with a single outgoing transition
pub const BRANCH_NEXT: &str = "next";
/// Fallback transition for branch names without their own edge
pub const BRANCH_DEFAULT: &str = "default";
/// Re-invoke the same step; needs no explicit edge
pub const BRANCH_SELF: &str = "self";
pub const BRANCH_FAILURE: &str = "failure";

#[derive(Debug, Clone, PartialEq)]
pub enum StepMode {
    Passthrough,
    /// Stop here; the step is invoked again on resumption
    Yielding(Suspension),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub outputs: Values,
    pub branch: String,
    pub mode: StepMode,
}

impl StepResult {
    /// Outputs and the `next` branch
    pub fn next(outputs: Values) -> Self {
        Self::branch(outputs, BRANCH_NEXT)
    }

    pub fn branch(outputs: Values, branch: impl Into<String>) -> Self {
        Self {
            outputs,
            branch: branch.into(),
            mode: StepMode::Passthrough,
        }
    }

    pub fn yielding(suspension: Suspension) -> Self {
        Self {
            outputs: Values::new(),
            branch: BRANCH_NEXT.to_string(),
            mode: StepMode::Yielding(suspension),
        }
    }

    /// Yield with whatever a sub-conversation stopped on
    pub(crate) fn from_inner_status(status: ExecutionStatus) -> Option<Self> {
        status.into_suspension().map(Self::yielding)
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    /// Kind name used in logs and errors
    fn kind(&self) -> &'static str;

    fn input_descriptors(&self) -> &[Property];

    fn output_descriptors(&self) -> &[Property];

    fn branches(&self) -> Vec<String> {
        vec![BRANCH_NEXT.to_string()]
    }

    fn might_yield(&self) -> bool {
        false
    }

    /// Reaching this step finishes the flow
    fn is_terminal(&self) -> bool {
        false
    }

    async fn invoke(&self, inputs: Values, ctx: &mut StepContext<'_>) -> Result<StepResult>;
}

/// A step's view of its conversation during one invocation
pub struct StepContext<'a> {
    conversation: &'a mut Conversation,
    step_name: &'a str,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(conversation: &'a mut Conversation, step_name: &'a str) -> Self {
        Self {
            conversation,
            step_name,
        }
    }

    pub fn step_name(&self) -> &str {
        self.step_name
    }

    pub fn conversation(&self) -> &Conversation {
        &*self.conversation
    }

    pub(crate) fn conversation_mut(&mut self) -> &mut Conversation {
        &mut *self.conversation
    }

    pub fn messages(&self) -> &MessageList {
        self.conversation.messages()
    }

    pub fn append_message(&mut self, message: Message) {
        self.conversation.append_message(message);
    }

    /// This step's saved state, if any
    pub fn state<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.conversation
            .step_state(self.step_name)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| FlowError::step(self.step_name, format!("corrupt step state: {e}")))
    }

    pub fn set_state<T: Serialize>(&mut self, state: &T) -> Result<()> {
        let value = serde_json::to_value(state)
            .map_err(|e| FlowError::step(self.step_name, format!("cannot save step state: {e}")))?;
        self.conversation.set_step_state(self.step_name, value);
        Ok(())
    }

    pub fn clear_state(&mut self) {
        self.conversation.clear_step_state(self.step_name);
    }

    /// Drive the sub-conversation in this step's slot `slot`
    pub async fn run_sub_conversation(
        &mut self,
        slot: &str,
        component: &dyn Component,
        inputs: Values,
        share_messages: bool,
    ) -> Result<ExecutionStatus> {
        let key = self.sub_key(slot);
        self.conversation
            .run_sub_conversation(&key, component, inputs, Vec::new(), share_messages)
            .await
    }

    fn sub_key(&self, slot: &str) -> String {
        format!("{}:{slot}", self.step_name)
    }
}

/// Check that step outputs use distinct names
pub(crate) fn ensure_unique_names(component: &str, properties: &[Property]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    match properties.iter().find(|p| !seen.insert(p.name.as_str())) {
        Some(dup) => Err(FlowError::invalid_step(
            component,
            format!("`{}` is declared twice", dup.name),
        )),
        None => Ok(()),
    }
}
