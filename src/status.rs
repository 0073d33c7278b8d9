//! Outcome of one `execute` call

use crate::message::Message;
use crate::property::Values;
use crate::tool::ToolRequest;

/// Result of driving a conversation to its next suspension point or to the end.
///
/// Created per execution call and never persisted; the conversation carries
/// everything needed to resume.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    /// Waiting for the user to append a message
    UserMessageRequest {
        /// Last agent message shown to the user, if any
        message: Option<Message>,
    },
    /// Waiting for the caller to execute client tools and append their results
    ToolRequest { tool_requests: Vec<ToolRequest> },
    /// Waiting for the caller to confirm or reject these tool calls
    ToolConfirmation { tool_requests: Vec<ToolRequest> },
    /// Execution reached its end
    Finished {
        output_values: Values,
        complete_step_name: Option<String>,
    },
    /// An execution interrupt fired; executing again resumes at the same point
    Interrupted { reason: String },
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, ExecutionStatus::Finished { .. })
    }

    /// Suspended waiting for the caller
    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::UserMessageRequest { .. }
                | ExecutionStatus::ToolRequest { .. }
                | ExecutionStatus::ToolConfirmation { .. }
        )
    }

    pub fn output_values(&self) -> Option<&Values> {
        match self {
            ExecutionStatus::Finished { output_values, .. } => Some(output_values),
            _ => None,
        }
    }

    /// Every non-finished status, as a suspension a wrapping step can yield
    pub fn into_suspension(self) -> Option<Suspension> {
        match self {
            ExecutionStatus::UserMessageRequest { message } => {
                Some(Suspension::UserMessage { message })
            }
            ExecutionStatus::ToolRequest { tool_requests } => {
                Some(Suspension::ToolRequests(tool_requests))
            }
            ExecutionStatus::ToolConfirmation { tool_requests } => {
                Some(Suspension::ToolConfirmation(tool_requests))
            }
            ExecutionStatus::Interrupted { reason } => Some(Suspension::Interrupted { reason }),
            ExecutionStatus::Finished { .. } => None,
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionStatus::UserMessageRequest { .. } => "user_message_request",
            ExecutionStatus::ToolRequest { .. } => "tool_request",
            ExecutionStatus::ToolConfirmation { .. } => "tool_confirmation",
            ExecutionStatus::Finished { .. } => "finished",
            ExecutionStatus::Interrupted { .. } => "interrupted",
        }
    }
}

/// Why a step yielded
#[derive(Debug, Clone, PartialEq)]
pub enum Suspension {
    UserMessage { message: Option<Message> },
    ToolRequests(Vec<ToolRequest>),
    ToolConfirmation(Vec<ToolRequest>),
    Interrupted { reason: String },
}

impl From<Suspension> for ExecutionStatus {
    fn from(suspension: Suspension) -> Self {
        match suspension {
            Suspension::UserMessage { message } => ExecutionStatus::UserMessageRequest { message },
            Suspension::ToolRequests(tool_requests) => {
                ExecutionStatus::ToolRequest { tool_requests }
            }
            Suspension::ToolConfirmation(tool_requests) => {
                ExecutionStatus::ToolConfirmation { tool_requests }
            }
            Suspension::Interrupted { reason } => ExecutionStatus::Interrupted { reason },
        }
    }
}
