//! Engine error types

use crate::llm::LlmError;
use crate::property::TypeError;
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T, E = FlowError> = std::result::Result<T, E>;

/// Errors surfaced by flow, step and agent execution
#[derive(Debug, Error)]
pub enum FlowError {
    /// Malformed graph, detected at build time
    #[error("Invalid flow: {0}")]
    InvalidFlow(String),

    /// Invalid step or agent parameters, detected at build time
    #[error("Invalid configuration for {component}: {message}")]
    InvalidStep { component: String, message: String },

    /// Execution resumed without the input the previous suspension asked for
    #[error("Missing required input: {0}")]
    MissingInput(String),

    /// Conversation started by a different component
    #[error("Conversation belongs to component {actual}, cannot be executed by {expected}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Conversation {0} has already finished")]
    ConversationFinished(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    /// A tool invocation failed
    #[error("Tool `{tool}` failed: {message}")]
    Tool { tool: String, message: String },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("The worker pool is not initialized, call init_worker_pool first")]
    WorkerPoolUninitialized,

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// A step failed while running
    #[error("Step `{step}` failed: {message}")]
    Step { step: String, message: String },
}

impl FlowError {
    pub fn invalid_step(component: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::InvalidStep {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Step {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Caller-misuse errors that must never be absorbed into a tool result
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            FlowError::MissingInput(_)
                | FlowError::IdentityMismatch { .. }
                | FlowError::ConversationFinished(_)
        )
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Snapshot(e.to_string())
    }
}
