//! Running a single tool as a flow step

use crate::conversation::ConfirmationDecision;
use crate::error::{FlowError, Result};
use crate::events::{self, Event};
use crate::message::Message;
use crate::property::{cast, Property, Values};
use crate::status::Suspension;
use crate::step::{Step, StepContext, StepResult};
use crate::tool::exec::{self, NestedRun};
use crate::tool::{Tool, ToolRequest, TOOL_OUTPUT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize)]
#[serde(tag = "waiting_for", rename_all = "snake_case")]
enum Pending {
    Confirmation { request: ToolRequest },
    Result { request: ToolRequest },
    Nested { request: ToolRequest },
}

/// Calls one tool with the step inputs as arguments and outputs its result
/// as `tool_output`.
///
/// Client tools suspend the flow with a tool request; tools that need
/// confirmation suspend it first with a confirmation request. A rejected
/// confirmation fails the step.
pub struct ToolExecutionStep {
    tool: Tool,
    inputs: Vec<Property>,
    outputs: Vec<Property>,
}

impl ToolExecutionStep {
    pub fn new(tool: impl Into<Tool>) -> Self {
        let tool = tool.into();
        let output = match &tool {
            Tool::Server(t) => t.output().renamed(TOOL_OUTPUT),
            Tool::Client(t) => t
                .output
                .as_ref()
                .map_or_else(|| Property::any(TOOL_OUTPUT), |p| p.renamed(TOOL_OUTPUT)),
            Tool::Flow(t) => Property::object(TOOL_OUTPUT, t.flow.outputs().to_vec()),
            Tool::Agent(t) if t.agent.outputs().is_empty() => Property::string(TOOL_OUTPUT),
            Tool::Agent(t) => Property::object(TOOL_OUTPUT, t.agent.outputs().to_vec()),
        };
        Self {
            inputs: tool.input_descriptors(),
            outputs: vec![output],
            tool,
        }
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    fn finished(&self, value: Value) -> Result<StepResult> {
        let output = &self.outputs[0];
        let value = if output.is_any() {
            value
        } else {
            cast(&value, output)?
        };
        Ok(StepResult::next([(TOOL_OUTPUT.to_string(), value)].into()))
    }

    fn missing(&self, ctx: &StepContext<'_>, what: &str) -> FlowError {
        FlowError::MissingInput(format!(
            "step `{}` is waiting for {what} of tool `{}`",
            ctx.step_name(),
            self.tool.name()
        ))
    }

    /// Run an in-process tool; flow and agent tools may suspend
    async fn run(&self, request: ToolRequest, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let key = format!("{}:tool", ctx.step_name());
        let outcome = exec::run_nested(&self.tool, &request, ctx.conversation_mut(), &key).await;
        let is_error = match &outcome {
            Ok(NestedRun::Suspended(_)) => None,
            Ok(NestedRun::Done(_)) => Some(false),
            Err(_) => Some(true),
        };
        if let Some(is_error) = is_error {
            ctx.clear_state();
            events::emit(Event::ToolFinished {
                request_id: request.id.clone(),
                tool: request.name.clone(),
                is_error,
            });
        }
        match outcome? {
            NestedRun::Done(value) => self.finished(value),
            NestedRun::Suspended(status) => {
                ctx.set_state(&Pending::Nested { request })?;
                Ok(StepResult::from_inner_status(status)
                    .unwrap_or_else(|| StepResult::next(Values::new())))
            }
        }
    }

    async fn start(&self, request: ToolRequest, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        events::emit(Event::ToolStarted {
            request_id: request.id.clone(),
            tool: request.name.clone(),
        });
        if !self.tool.is_client() {
            return self.run(request, ctx).await;
        }
        ctx.append_message(Message::tool_requests("", vec![request.clone()]));
        ctx.set_state(&Pending::Result {
            request: request.clone(),
        })?;
        Ok(StepResult::yielding(Suspension::ToolRequests(vec![request])))
    }
}

#[async_trait]
impl Step for ToolExecutionStep {
    fn kind(&self) -> &'static str {
        "tool_execution"
    }

    fn input_descriptors(&self) -> &[Property] {
        &self.inputs
    }

    fn output_descriptors(&self) -> &[Property] {
        &self.outputs
    }

    fn might_yield(&self) -> bool {
        self.tool.might_yield()
    }

    async fn invoke(&self, inputs: Values, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        match ctx.state::<Pending>()? {
            None => {
                let args = Value::Object(inputs.into_iter().collect());
                let request = ToolRequest::new(self.tool.name(), args);
                if self.tool.requires_confirmation() {
                    tracing::debug!(
                        step = ctx.step_name(),
                        tool = self.tool.name(),
                        "Tool call needs confirmation"
                    );
                    ctx.set_state(&Pending::Confirmation {
                        request: request.clone(),
                    })?;
                    return Ok(StepResult::yielding(Suspension::ToolConfirmation(vec![request])));
                }
                self.start(request, ctx).await
            }
            Some(Pending::Confirmation { mut request }) => {
                let decision = ctx
                    .conversation_mut()
                    .take_confirmation(&request.id)
                    .ok_or_else(|| self.missing(ctx, "a confirmation"))?;
                ctx.clear_state();
                match decision {
                    ConfirmationDecision::Rejected { reason } => {
                        tracing::info!(
                            step = ctx.step_name(),
                            tool = self.tool.name(),
                            %reason,
                            "Tool call rejected"
                        );
                        Err(FlowError::tool(self.tool.name(), format!("rejected: {reason}")))
                    }
                    ConfirmationDecision::Confirmed { modified_args } => {
                        if let Some(args) = modified_args {
                            request.args = args;
                        }
                        self.start(request, ctx).await
                    }
                }
            }
            Some(Pending::Result { request }) => {
                let result = ctx
                    .conversation()
                    .find_tool_result(&request.id)
                    .ok_or_else(|| self.missing(ctx, "the result"))?;
                ctx.clear_state();
                events::emit(Event::ToolFinished {
                    request_id: request.id.clone(),
                    tool: request.name.clone(),
                    is_error: result.is_error,
                });
                if result.is_error {
                    return Err(FlowError::tool(self.tool.name(), result.content_text()));
                }
                self.finished(result.content)
            }
            Some(Pending::Nested { request }) => self.run(request, ctx).await,
        }
    }
}
