//! LLM-driven agent
//!
//! An [`Agent`] repeatedly asks its model what to do next, runs the tool
//! calls it gets back and stops when the model talks to the user, submits
//! its outputs, ends the conversation or runs out of iterations. It is a
//! [`Component`], so it can be driven directly, run as a flow step, or be
//! exposed to another agent as a tool.

mod builder;
mod executor;

pub use builder::AgentBuilder;
pub use executor::{END_CONVERSATION_TOOL, SUBMIT_OUTPUT_TOOL};

use crate::component::Component;
use crate::conversation::Conversation;
use crate::error::Result;
use crate::events::{self, Event};
use crate::llm::LlmService;
use crate::property::Property;
use crate::status::ExecutionStatus;
use crate::tool::Tool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What the agent does when the model answers with plain text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerInputMode {
    /// Show the text to the user and wait for a reply
    #[default]
    Always,
    /// Never wait for the user; remind the model to use its tools instead
    Never,
}

pub struct Agent {
    id: String,
    name: String,
    description: String,
    llm: Arc<dyn LlmService>,
    tools: Vec<Tool>,
    instruction: String,
    inputs: Vec<Property>,
    outputs: Vec<Property>,
    caller_input_mode: CallerInputMode,
    can_finish_conversation: bool,
    max_iterations: usize,
    raise_exceptions: bool,
    stream: bool,
}

impl Agent {
    pub fn builder(name: impl Into<String>, llm: Arc<dyn LlmService>) -> AgentBuilder {
        AgentBuilder::new(name, llm)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn inputs(&self) -> &[Property] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Property] {
        &self.outputs
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn caller_input_mode(&self) -> CallerInputMode {
        self.caller_input_mode
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Whether executing the agent can stop before it finishes.
    ///
    /// Running out of iterations always hands the turn to the user; that
    /// safety bound is not counted here. An agent reported as non-yielding
    /// can therefore still stop with a user message request once it reaches
    /// [`max_iterations`](Self::max_iterations). Where no caller can answer,
    /// as in a parallel [`MapStep`](crate::steps::MapStep) or a pooled tool
    /// batch, that run fails with a step error instead.
    pub fn might_yield(&self) -> bool {
        self.caller_input_mode == CallerInputMode::Always
            || self.tools.iter().any(Tool::might_yield)
            || (self.can_finish_conversation && self.outputs.iter().any(|p| !p.has_default()))
    }

    /// The model may finish on its own through `submit_output`
    fn offers_submit(&self) -> bool {
        !self.outputs.is_empty()
            && (self.can_finish_conversation || self.caller_input_mode == CallerInputMode::Never)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("model", &self.llm.model_id())
            .field("tools", &self.tools)
            .field("caller_input_mode", &self.caller_input_mode)
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Component for Agent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn input_descriptors(&self) -> &[Property] {
        &self.inputs
    }

    fn output_descriptors(&self) -> &[Property] {
        &self.outputs
    }

    fn might_yield(&self) -> bool {
        Agent::might_yield(self)
    }

    async fn execute(&self, conversation: &mut Conversation) -> Result<ExecutionStatus> {
        conversation.check_executable(&self.id)?;
        tracing::info!(conversation_id = %conversation.id(), agent = %self.name, "Executing agent");
        events::emit(Event::ExecutionStarted {
            conversation_id: conversation.id().to_string(),
            component: self.name.clone(),
        });
        let result = executor::run(self, conversation).await;
        match &result {
            Ok(status) => {
                tracing::info!(
                    conversation_id = %conversation.id(),
                    agent = %self.name,
                    status = status.kind(),
                    "Agent execution returned"
                );
                events::emit(Event::ExecutionFinished {
                    conversation_id: conversation.id().to_string(),
                    component: self.name.clone(),
                    status: status.kind(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation.id(),
                    agent = %self.name,
                    error = %e,
                    "Agent execution failed"
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod tests;
