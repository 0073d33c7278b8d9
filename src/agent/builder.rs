use super::executor::{END_CONVERSATION_TOOL, SUBMIT_OUTPUT_TOOL};
use super::{Agent, CallerInputMode};
use crate::error::{FlowError, Result};
use crate::llm::LlmService;
use crate::property::Property;
use crate::step::ensure_unique_names;
use crate::tool::{ClientTool, Tool};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

pub struct AgentBuilder {
    id: Option<String>,
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

impl AgentBuilder {
    pub(super) fn new(name: impl Into<String>, llm: Arc<dyn LlmService>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            llm,
            tools: Vec::new(),
            instruction: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            caller_input_mode: CallerInputMode::Always,
            can_finish_conversation: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            raise_exceptions: false,
            stream: false,
        }
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Shown to other agents when this one is used as a tool
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// System instruction; `{{ name }}` placeholders are filled from the
    /// agent inputs
    #[must_use]
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: impl Into<Tool>) -> Self {
        self.tools.push(tool.into());
        self
    }

    #[must_use]
    pub fn input(mut self, input: Property) -> Self {
        self.inputs.push(input);
        self
    }

    #[must_use]
    pub fn output(mut self, output: Property) -> Self {
        self.outputs.push(output);
        self
    }

    #[must_use]
    pub fn caller_input_mode(mut self, mode: CallerInputMode) -> Self {
        self.caller_input_mode = mode;
        self
    }

    #[must_use]
    pub fn can_finish_conversation(mut self, can_finish: bool) -> Self {
        self.can_finish_conversation = can_finish;
        self
    }

    #[must_use]
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Fail the execution on the first failing tool call instead of
    /// reporting the failure to the model
    #[must_use]
    pub fn raise_exceptions(mut self, raise: bool) -> Self {
        self.raise_exceptions = raise;
        self
    }

    /// Use the streaming generation endpoint
    #[must_use]
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let invalid = |message: String| FlowError::invalid_step(&self.name, message);
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations must be at least 1".to_string()));
        }
        ensure_unique_names(&self.name, &self.inputs)?;
        ensure_unique_names(&self.name, &self.outputs)?;

        let mut names = BTreeSet::new();
        for tool in &self.tools {
            let name = tool.name();
            if name == SUBMIT_OUTPUT_TOOL || name == END_CONVERSATION_TOOL {
                return Err(invalid(format!("tool `{name}` clashes with a built-in tool")));
            }
            if !names.insert(name) {
                return Err(invalid(format!("tool `{name}` is registered twice")));
            }
            if let Tool::Client(ClientTool {
                remote: Some(remote),
                ..
            }) = tool
            {
                remote.validate()?;
            }
        }
        for template_var in crate::template::variables(&self.instruction) {
            if !self.inputs.iter().any(|p| p.name == template_var) {
                return Err(invalid(format!(
                    "instruction uses `{template_var}`, which is not an input"
                )));
            }
        }

        if self.max_iterations == 1 && !self.can_finish_conversation {
            tracing::warn!(
                agent = %self.name,
                "max_iterations is 1 and the agent cannot finish the conversation; \
                 it will hand over after a single model call"
            );
        }

        Ok(Agent {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: self.name,
            description: self.description,
            llm: self.llm,
            tools: self.tools,
            instruction: self.instruction,
            inputs: self.inputs,
            outputs: self.outputs,
            caller_input_mode: self.caller_input_mode,
            can_finish_conversation: self.can_finish_conversation,
            max_iterations: self.max_iterations,
            raise_exceptions: self.raise_exceptions,
            stream: self.stream,
        })
    }
}
