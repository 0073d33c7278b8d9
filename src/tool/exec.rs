//! Running tools in-process, either inside a conversation or detached on a
//! worker

use super::{Tool, ToolError, ToolRequest, AGENT_TOOL_REQUEST_ARG};
use crate::component::Component;
use crate::conversation::Conversation;
use crate::error::{FlowError, Result};
use crate::interrupt::ExecutionInterrupt;
use crate::llm::TokenUsage;
use crate::message::Message;
use crate::property::{TypeError, Values};
use crate::status::ExecutionStatus;
use serde_json::Value;
use std::sync::Arc;

/// Outcome of a tool that runs through a sub-conversation
pub(crate) enum NestedRun {
    Done(Value),
    Suspended(ExecutionStatus),
}

pub(crate) fn tool_failure(tool: &str, error: ToolError) -> FlowError {
    match error {
        ToolError::Failed(message) => FlowError::tool(tool, message),
        ToolError::NonDuplicable(reason) => FlowError::Type(TypeError {
            value: format!("output of `{tool}`"),
            from: "tool output".to_string(),
            to: "json".to_string(),
            reason,
        }),
    }
}

pub(crate) fn args_to_values(args: &Value) -> Values {
    match args {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Values::new(),
    }
}

/// Split agent-tool arguments into the task message and the agent inputs
fn agent_start(args: &Value) -> (Values, Vec<Message>) {
    let mut inputs = args_to_values(args);
    let seed = match inputs.remove(AGENT_TOOL_REQUEST_ARG) {
        Some(Value::String(text)) if !text.is_empty() => vec![Message::user(text)],
        Some(Value::String(_)) | Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![Message::user(other.to_string())],
    };
    (inputs, seed)
}

fn finished_value(tool: &Tool, output_values: Values, final_message: Option<Message>) -> Value {
    let agent_without_outputs = matches!(tool, Tool::Agent(t) if t.agent.outputs().is_empty());
    if agent_without_outputs {
        return Value::String(final_message.map(|m| m.text().to_string()).unwrap_or_default());
    }
    Value::Object(output_values.into_iter().collect())
}

/// Run a server tool directly
pub(crate) async fn invoke_server(tool: &Tool, args: &Value) -> Result<Value> {
    match tool {
        Tool::Server(server) => server
            .invoke(args)
            .await
            .map_err(|e| tool_failure(server.name(), e)),
        other => Err(FlowError::tool(other.name(), "not an in-process tool")),
    }
}

/// Run a flow or agent tool in the sub-conversation stored under `key`
pub(crate) async fn run_nested(
    tool: &Tool,
    request: &ToolRequest,
    conversation: &mut Conversation,
    key: &str,
) -> Result<NestedRun> {
    let (component, inputs, seed): (&dyn Component, Values, Vec<Message>) = match tool {
        Tool::Flow(t) => (t.flow.as_ref(), args_to_values(&request.args), Vec::new()),
        Tool::Agent(t) => {
            let (inputs, seed) = agent_start(&request.args);
            (t.agent.as_ref(), inputs, seed)
        }
        Tool::Server(_) => return invoke_server(tool, &request.args).await.map(NestedRun::Done),
        Tool::Client(t) => {
            return Err(FlowError::tool(&t.name, "client tools run on the caller side"));
        }
    };
    let run = conversation
        .drive_sub_conversation(key, component, inputs, seed, false)
        .await?;
    match run.status {
        ExecutionStatus::Finished { output_values, .. } => {
            Ok(NestedRun::Done(finished_value(tool, output_values, run.final_message)))
        }
        status => Ok(NestedRun::Suspended(status)),
    }
}

/// Run a tool that cannot yield outside any conversation, as pool work
pub(crate) async fn run_detached(
    tool: Tool,
    request: ToolRequest,
    interrupts: Vec<Arc<dyn ExecutionInterrupt>>,
) -> (Result<Value>, TokenUsage) {
    let (component, inputs, seed): (&dyn Component, Values, Vec<Message>) = match &tool {
        Tool::Flow(t) => (t.flow.as_ref(), args_to_values(&request.args), Vec::new()),
        Tool::Agent(t) => {
            let (inputs, seed) = agent_start(&request.args);
            (t.agent.as_ref(), inputs, seed)
        }
        Tool::Server(_) | Tool::Client(_) => {
            return (invoke_server(&tool, &request.args).await, TokenUsage::default());
        }
    };
    let mut conversation = match component.start_conversation(inputs, seed) {
        Ok(conversation) => conversation.with_interrupts(interrupts),
        Err(e) => return (Err(e), TokenUsage::default()),
    };
    let status = component.execute(&mut conversation).await;
    let usage = conversation.token_usage();
    let value = match status {
        Ok(ExecutionStatus::Finished { output_values, .. }) => {
            let final_message = conversation
                .visible_messages()
                .into_iter()
                .rev()
                .find(|m| m.role == crate::message::MessageRole::Agent && !m.text().is_empty());
            Ok(finished_value(&tool, output_values, final_message))
        }
        Ok(other) => Err(FlowError::tool(
            tool.name(),
            format!("stopped with {} while running without a conversation", other.kind()),
        )),
        Err(e) => Err(e),
    };
    (value, usage)
}
