//! Flowloom: typed flows and LLM agents with resumable conversations
//!
//! A [`Flow`] is a graph of [`Step`]s; an [`Agent`] is a bounded tool-calling
//! loop over an [`LlmService`]. Both are [`Component`]s: start a
//! [`Conversation`], call `execute`, and answer whatever the returned
//! [`ExecutionStatus`] asks for before executing again.

pub mod agent;
pub mod component;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod flow;
pub mod interrupt;
pub mod llm;
pub mod message;
pub mod pool;
pub mod property;
pub mod status;
pub mod step;
pub mod steps;
pub mod template;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, AgentBuilder, CallerInputMode};
pub use component::Component;
pub use config::EngineConfig;
pub use conversation::Conversation;
pub use error::{FlowError, Result};
pub use events::{register_event_listeners, Event, EventListener, ListenerGuard};
pub use flow::{Flow, FlowBuilder, FlowNode};
pub use interrupt::{
    CancellationInterrupt, ExecutionInterrupt, SoftTimeoutInterrupt, SoftTokenLimitInterrupt,
};
pub use llm::{LlmError, LlmService};
pub use message::{Message, MessageRole};
pub use pool::{current_worker_id, init_worker_pool, shutdown_worker_pool, worker_pool};
pub use property::{Property, PropertyType, Values};
pub use status::ExecutionStatus;
pub use step::{Step, StepContext, StepResult};
pub use tool::{AgentTool, ClientTool, FlowTool, ServerTool, Tool, ToolRequest, ToolResult};
