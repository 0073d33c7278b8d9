//! Tools available to agents and tool steps
//!
//! A tool is either executed by the caller ([`ClientTool`]), in-process
//! ([`ServerTool`]), or by running a nested component ([`FlowTool`],
//! [`AgentTool`]).

pub(crate) mod exec;
mod server;
pub mod stream;

pub use server::{ServerTool, ServerToolBuilder, TOOL_OUTPUT};
pub use stream::{
    max_stream_chunks, reset_max_stream_chunks, set_max_stream_chunks, ToolOutputStream,
};

use crate::agent::Agent;
use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::llm::ToolDefinition;
use crate::property::{object_schema, Property};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// A request to invoke a tool, correlated to its result by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            args,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// The outcome of a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(id: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            content,
            is_error: false,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: Value::String(message.into()),
            is_error: true,
        }
    }

    /// Content rendered as text for the model
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Failure of an in-process tool
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    /// Output that cannot be copied across a step boundary
    #[error("tool output cannot be duplicated: {0}")]
    NonDuplicable(String),
}

/// A tool the caller must execute; the engine never runs it
#[derive(Debug, Clone)]
pub struct ClientTool {
    pub name: String,
    pub description: String,
    pub inputs: Vec<Property>,
    pub output: Option<Property>,
    /// Server the caller forwards requests of this tool to
    pub remote: Option<RemoteToolConfig>,
}

impl ClientTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        inputs: Vec<Property>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            inputs,
            output: None,
            remote: None,
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: Property) -> Self {
        self.output = Some(output);
        self
    }
}

/// A flow exposed to an agent as a tool
#[derive(Clone)]
pub struct FlowTool {
    pub name: String,
    pub description: String,
    pub flow: Arc<Flow>,
}

impl FlowTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, flow: Arc<Flow>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            flow,
        }
    }
}

/// Argument carrying the task given to an agent used as a tool
pub const AGENT_TOOL_REQUEST_ARG: &str = "request";

/// An agent exposed to another agent as a tool
#[derive(Clone)]
pub struct AgentTool {
    pub agent: Arc<Agent>,
}

impl AgentTool {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    fn inputs(&self) -> Vec<Property> {
        let mut inputs = vec![Property::string(AGENT_TOOL_REQUEST_ARG)
            .with_description("What the agent should do")
            .with_default("")];
        inputs.extend(self.agent.inputs().iter().cloned());
        inputs
    }
}

/// Tool capability set
#[derive(Clone)]
pub enum Tool {
    Client(ClientTool),
    Server(ServerTool),
    Flow(FlowTool),
    Agent(AgentTool),
}

impl Tool {
    pub fn name(&self) -> &str {
        match self {
            Tool::Client(t) => &t.name,
            Tool::Server(t) => t.name(),
            Tool::Flow(t) => &t.name,
            Tool::Agent(t) => t.agent.name(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Tool::Client(t) => &t.description,
            Tool::Server(t) => t.description(),
            Tool::Flow(t) => &t.description,
            Tool::Agent(t) => t.agent.description(),
        }
    }

    pub fn input_descriptors(&self) -> Vec<Property> {
        match self {
            Tool::Client(t) => t.inputs.clone(),
            Tool::Server(t) => t.inputs().to_vec(),
            Tool::Flow(t) => t.flow.inputs().to_vec(),
            Tool::Agent(t) => t.inputs(),
        }
    }

    /// Client tools are executed by the caller, never in-process
    pub fn is_client(&self) -> bool {
        matches!(self, Tool::Client(_))
    }

    pub fn requires_confirmation(&self) -> bool {
        match self {
            Tool::Server(t) => t.requires_confirmation(),
            _ => false,
        }
    }

    /// Whether running this tool in-process can suspend
    pub fn might_yield(&self) -> bool {
        match self {
            Tool::Client(_) => true,
            Tool::Server(t) => t.requires_confirmation(),
            Tool::Flow(t) => t.flow.might_yield(),
            Tool::Agent(t) => t.agent.might_yield(),
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: object_schema(&self.input_descriptors()),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Tool::Client(_) => "client",
            Tool::Server(_) => "server",
            Tool::Flow(_) => "flow",
            Tool::Agent(_) => "agent",
        };
        f.debug_struct("Tool")
            .field("kind", &kind)
            .field("name", &self.name())
            .finish()
    }
}

impl From<ClientTool> for Tool {
    fn from(t: ClientTool) -> Self {
        Tool::Client(t)
    }
}

impl From<ServerTool> for Tool {
    fn from(t: ServerTool) -> Self {
        Tool::Server(t)
    }
}

impl From<FlowTool> for Tool {
    fn from(t: FlowTool) -> Self {
        Tool::Flow(t)
    }
}

impl From<AgentTool> for Tool {
    fn from(t: AgentTool) -> Self {
        Tool::Agent(t)
    }
}

/// Connection settings for a tool served by a remote process.
///
/// The transport itself is provided outside this crate; the engine only
/// validates the configuration and treats such tools as client tools.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RemoteToolConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Headers whose values must never be logged or persisted
    #[serde(default, skip_serializing)]
    pub sensitive_headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for RemoteToolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteToolConfig")
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("sensitive_headers", &self.sensitive_headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RemoteToolConfig {
    pub fn new(
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        sensitive_headers: BTreeMap<String, String>,
    ) -> Result<Self> {
        let config = Self {
            url: url.into(),
            headers,
            sensitive_headers,
        };
        config.validate()?;
        Ok(config)
    }

    /// Header names are case-insensitive; a name may not appear in both maps
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(FlowError::invalid_step("remote tool", "url must not be empty"));
        }
        let mut overlapping: Vec<&str> = self
            .headers
            .keys()
            .filter(|name| {
                self.sensitive_headers
                    .keys()
                    .any(|sensitive| sensitive.eq_ignore_ascii_case(name))
            })
            .map(String::as_str)
            .collect();
        if overlapping.is_empty() {
            return Ok(());
        }
        overlapping.sort_unstable();
        Err(FlowError::invalid_step(
            "remote tool",
            format!(
                "headers declared both as regular and sensitive: {}",
                overlapping.join(", ")
            ),
        ))
    }

    /// Client tool standing for a remote tool of this server
    pub fn client_tool(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        inputs: Vec<Property>,
    ) -> Result<ClientTool> {
        self.validate()?;
        let name = name.into();
        tracing::debug!(tool = %name, url = %self.url, "Registering remote tool");
        let mut tool = ClientTool::new(name, description, inputs);
        tool.remote = Some(self.clone());
        Ok(tool)
    }
}
