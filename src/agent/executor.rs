//! The agent's tool-calling loop
//!
//! Everything the loop must remember across suspensions lives in an
//! [`AgentState`] stored in the conversation's step-state slot. A tool batch
//! is processed in request order; every request gets exactly one
//! [`ToolResult`] in the message history, whatever happens to the others.

use super::{Agent, CallerInputMode};
use crate::conversation::{ConfirmationDecision, Conversation};
use crate::error::{FlowError, Result};
use crate::events::{self, Event};
use crate::llm::{collect_stream, LlmCompletion, Prompt, ToolDefinition};
use crate::message::Message;
use crate::pool;
use crate::property::{object_schema, resolve_values, ResolveError, Values};
use crate::status::ExecutionStatus;
use crate::template;
use crate::tool::exec::{self, NestedRun};
use crate::tool::{Tool, ToolRequest, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const SUBMIT_OUTPUT_TOOL: &str = "submit_output";
pub const END_CONVERSATION_TOOL: &str = "end_conversation";

const STATE_KEY: &str = "agent";
const NO_TOOL_CALL_REMINDER: &str =
    "No one will read plain text replies. Keep working with the available tools.";
const SKIPPED: &str = "Not executed: the conversation ended in the same batch";

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentState {
    iteration: usize,
    #[serde(default)]
    pending: Option<Pending>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "waiting_for", rename_all = "snake_case")]
enum Pending {
    /// A user message appended after `after` messages
    UserMessage { after: usize },
    /// A decision for each of `awaiting`
    Confirmation { batch: Batch, awaiting: Vec<String> },
    /// The flow or agent tool at `batch.next`
    Nested { batch: Batch },
    /// Results of these client tool calls
    ClientTools { requests: Vec<ToolRequest> },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Termination {
    Submitted(Values),
    End,
}

/// A tool batch being worked through
#[derive(Debug, Serialize, Deserialize)]
struct Batch {
    requests: Vec<ToolRequest>,
    /// Reasons of rejected confirmations, by request id
    #[serde(default)]
    rejected: BTreeMap<String, String>,
    next: usize,
    #[serde(default)]
    client_requests: Vec<ToolRequest>,
    /// Tool name and message of the first failed call
    #[serde(default)]
    failure: Option<(String, String)>,
    #[serde(default)]
    termination: Option<Termination>,
    /// The first failure itself, while it has not crossed a suspension
    #[serde(skip)]
    first_error: Option<FlowError>,
}

impl Batch {
    fn new(requests: Vec<ToolRequest>) -> Self {
        Self {
            requests,
            rejected: BTreeMap::new(),
            next: 0,
            client_requests: Vec::new(),
            failure: None,
            termination: None,
            first_error: None,
        }
    }

    fn capture(&mut self, tool: &str, error: FlowError) {
        if self.failure.is_none() {
            self.failure = Some((tool.to_string(), error.to_string()));
            self.first_error = Some(error);
        }
    }

    fn into_error(self) -> Option<FlowError> {
        let (tool, message) = self.failure?;
        Some(self.first_error.unwrap_or_else(|| FlowError::tool(tool, message)))
    }
}

/// How one request of a batch gets handled
enum Dispatch<'a> {
    Rejected(String),
    Submit,
    End,
    Unknown,
    Client,
    InProcess(&'a Tool),
}

fn load_state(conversation: &Conversation) -> Result<AgentState> {
    conversation
        .step_state(STATE_KEY)
        .map(|v| serde_json::from_value(v.clone()))
        .transpose()
        .map(Option::unwrap_or_default)
        .map_err(|e| {
            FlowError::step(
                conversation.component_name(),
                format!("corrupt agent state: {e}"),
            )
        })
}

fn save_state(conversation: &mut Conversation, state: &AgentState) -> Result<()> {
    let value = serde_json::to_value(state)
        .map_err(|e| {
                FlowError::step(
                    conversation.component_name(),
                    format!("cannot save agent state: {e}"),
                )
            })?;
    conversation.set_step_state(STATE_KEY, value);
    Ok(())
}

fn missing(conversation: &Conversation, what: &str) -> FlowError {
    FlowError::MissingInput(format!(
        "agent `{}` is waiting for {what}",
        conversation.component_name()
    ))
}

pub(super) async fn run(agent: &Agent, conversation: &mut Conversation) -> Result<ExecutionStatus> {
    let mut state = load_state(conversation)?;

    if let Some(pending) = state.pending.take() {
        if let Some(status) = resume(agent, conversation, &mut state, pending).await? {
            return Ok(status);
        }
    }

    loop {
        if state.iteration >= agent.max_iterations {
            tracing::info!(
                conversation_id = %conversation.id(),
                agent = %agent.name,
                iteration = state.iteration,
                "Iteration limit reached, handing over to the user"
            );
            return hand_over(conversation, &mut state, None);
        }
        if let Some(reason) = conversation.check_interrupts() {
            save_state(conversation, &state)?;
            tracing::info!(conversation_id = %conversation.id(), %reason, "Agent interrupted");
            return Ok(ExecutionStatus::Interrupted { reason });
        }

        let completion = generate(agent, conversation).await?;
        state.iteration += 1;
        let message = completion.message;

        if !message.has_tool_calls() {
            let reply = Message::agent(&message.text);
            conversation.append_message(reply.clone());
            match agent.caller_input_mode {
                CallerInputMode::Always => return hand_over(conversation, &mut state, Some(reply)),
                CallerInputMode::Never => {
                    tracing::debug!(
                        conversation_id = %conversation.id(),
                        iteration = state.iteration,
                        "Plain text without a user to read it"
                    );
                    conversation.append_message(Message::system(NO_TOOL_CALL_REMINDER).internal());
                    continue;
                }
            }
        }

        conversation.append_message(Message::tool_requests(
            &message.text,
            message.tool_requests.clone(),
        ));
        let batch = Batch::new(message.tool_requests);
        let gated: Vec<ToolRequest> = batch
            .requests
            .iter()
            .filter(|r| find_tool(agent, &r.name).is_some_and(Tool::requires_confirmation))
            .cloned()
            .collect();
        if !gated.is_empty() {
            tracing::debug!(
                conversation_id = %conversation.id(),
                calls = gated.len(),
                "Tool calls need confirmation"
            );
            state.pending = Some(Pending::Confirmation {
                batch,
                awaiting: gated.iter().map(|r| r.id.clone()).collect(),
            });
            save_state(conversation, &state)?;
            return Ok(ExecutionStatus::ToolConfirmation { tool_requests: gated });
        }
        if let Some(status) = process_batch(agent, conversation, &mut state, batch).await? {
            return Ok(status);
        }
    }
}

/// Apply the caller's input for a pending suspension.
///
/// Returns a status when the execution stops again before the loop resumes.
async fn resume(
    agent: &Agent,
    conversation: &mut Conversation,
    state: &mut AgentState,
    pending: Pending,
) -> Result<Option<ExecutionStatus>> {
    match pending {
        Pending::UserMessage { after } => {
            if !conversation.messages().since(after).iter().any(Message::is_user_text) {
                state.pending = Some(Pending::UserMessage { after });
                return Err(missing(conversation, "a user message"));
            }
            state.iteration = 0;
            Ok(None)
        }
        Pending::Confirmation { mut batch, awaiting } => {
            if awaiting.iter().any(|id| conversation.confirmation(id).is_none()) {
                state.pending = Some(Pending::Confirmation { batch, awaiting });
                return Err(missing(conversation, "a decision on every tool confirmation"));
            }
            for id in &awaiting {
                match conversation.take_confirmation(id) {
                    Some(ConfirmationDecision::Confirmed { modified_args }) => {
                        if let (Some(args), Some(request)) =
                            (modified_args, batch.requests.iter_mut().find(|r| &r.id == id))
                        {
                            request.args = args;
                        }
                    }
                    Some(ConfirmationDecision::Rejected { reason }) => {
                        batch.rejected.insert(id.clone(), reason);
                    }
                    None => {}
                }
            }
            process_batch(agent, conversation, state, batch).await
        }
        Pending::Nested { batch } => process_batch(agent, conversation, state, batch).await,
        Pending::ClientTools { requests } => {
            if let Some(request) = requests
                .iter()
                .find(|r| conversation.find_tool_result(&r.id).is_none())
            {
                let what = format!("the result of `{}` ({})", request.name, request.id);
                state.pending = Some(Pending::ClientTools { requests });
                return Err(missing(conversation, &what));
            }
            Ok(None)
        }
    }
}

fn hand_over(
    conversation: &mut Conversation,
    state: &mut AgentState,
    message: Option<Message>,
) -> Result<ExecutionStatus> {
    state.pending = Some(Pending::UserMessage {
        after: conversation.messages().len(),
    });
    save_state(conversation, state)?;
    Ok(ExecutionStatus::UserMessageRequest { message })
}

fn finish(conversation: &mut Conversation, output_values: Values) -> ExecutionStatus {
    conversation.finish();
    ExecutionStatus::Finished {
        output_values,
        complete_step_name: None,
    }
}

fn find_tool<'a>(agent: &'a Agent, name: &str) -> Option<&'a Tool> {
    agent.tools.iter().find(|t| t.name() == name)
}

fn dispatch<'a>(agent: &'a Agent, batch: &Batch, request: &ToolRequest) -> Dispatch<'a> {
    if let Some(reason) = batch.rejected.get(&request.id) {
        return Dispatch::Rejected(reason.clone());
    }
    match request.name.as_str() {
        SUBMIT_OUTPUT_TOOL if agent.offers_submit() => Dispatch::Submit,
        END_CONVERSATION_TOOL if agent.can_finish_conversation => Dispatch::End,
        name => match find_tool(agent, name) {
            None => Dispatch::Unknown,
            Some(tool) if tool.is_client() => Dispatch::Client,
            Some(tool) => Dispatch::InProcess(tool),
        },
    }
}

fn system_prompt(agent: &Agent, conversation: &Conversation) -> Result<String> {
    let mut system = template::render(&agent.instruction, conversation.inputs())
        .map_err(|e| FlowError::step(&agent.name, e))?;
    if agent.offers_submit() {
        let names: Vec<&str> = agent.outputs.iter().map(|p| p.name.as_str()).collect();
        system.push_str(&format!(
            "\n\nWhen you are done, call `{SUBMIT_OUTPUT_TOOL}` with: {}.",
            names.join(", ")
        ));
    }
    Ok(system.trim().to_string())
}

fn tool_catalogue(agent: &Agent) -> Vec<ToolDefinition> {
    let mut tools: Vec<ToolDefinition> = agent.tools.iter().map(Tool::definition).collect();
    if agent.offers_submit() {
        tools.push(ToolDefinition {
            name: SUBMIT_OUTPUT_TOOL.to_string(),
            description: "Submit the final outputs of the task. This ends your work.".to_string(),
            input_schema: object_schema(&agent.outputs),
        });
    }
    if agent.can_finish_conversation {
        tools.push(ToolDefinition {
            name: END_CONVERSATION_TOOL.to_string(),
            description: "End the conversation when there is nothing left to do.".to_string(),
            input_schema: object_schema(&[]),
        });
    }
    tools
}

async fn generate(agent: &Agent, conversation: &mut Conversation) -> Result<LlmCompletion> {
    let prompt = Prompt {
        system: system_prompt(agent, conversation)?,
        messages: conversation.message_history(),
        tools: tool_catalogue(agent),
    };
    let model = agent.llm.model_id().to_string();
    events::emit(Event::LlmRequest {
        conversation_id: conversation.id().to_string(),
        model: model.clone(),
        messages: prompt.messages.len(),
    });
    let completion = if agent.stream {
        let chunks = agent.llm.stream_generate(&prompt).await?;
        collect_stream(chunks, |delta| {
            tracing::trace!(chars = delta.len(), "Streamed text");
        })
        .await?
    } else {
        agent.llm.generate(&prompt).await?
    };
    conversation.add_token_usage(completion.usage);
    events::emit(Event::LlmResponse {
        conversation_id: conversation.id().to_string(),
        model,
        usage: completion.usage,
    });
    Ok(completion)
}

/// Work through `batch` from `batch.next`, then decide how the loop goes on.
///
/// `None` means: call the model again.
async fn process_batch(
    agent: &Agent,
    conversation: &mut Conversation,
    state: &mut AgentState,
    mut batch: Batch,
) -> Result<Option<ExecutionStatus>> {
    let mut precomputed = run_on_pool(agent, conversation, &batch).await;

    while batch.next < batch.requests.len() {
        let request = batch.requests[batch.next].clone();
        match dispatch(agent, &batch, &request) {
            Dispatch::Rejected(reason) => {
                conversation.append_tool_result(ToolResult::error(
                    &request.id,
                    format!("Rejected by the user: {reason}"),
                ));
            }
            Dispatch::Submit => submit(agent, conversation, &mut batch, &request),
            Dispatch::End => {
                let ended = ToolResult::success(&request.id, json!("Conversation ended"));
                conversation.append_tool_result(ended);
                batch.termination.get_or_insert(Termination::End);
            }
            Dispatch::Unknown => {
                let error = FlowError::tool(&request.name, "unknown tool");
                conversation.append_tool_result(ToolResult::error(&request.id, error.to_string()));
                batch.capture(&request.name, error);
            }
            Dispatch::Client => batch.client_requests.push(request.clone()),
            Dispatch::InProcess(tool) => {
                let precomputed = precomputed.remove(&batch.next);
                let outcome =
                    call_in_process(agent, conversation, &mut batch, tool, &request, precomputed)
                        .await;
                match outcome {
                    Ok(None) => {}
                    Ok(Some(status)) => {
                        tracing::debug!(
                            conversation_id = %conversation.id(),
                            tool = %request.name,
                            "Nested tool yielded"
                        );
                        state.pending = Some(Pending::Nested { batch });
                        save_state(conversation, state)?;
                        return Ok(Some(status));
                    }
                    Err(error) => {
                        state.pending = Some(Pending::Nested { batch });
                        save_state(conversation, state)?;
                        return Err(error);
                    }
                }
            }
        }
        batch.next += 1;
    }

    settle(agent, conversation, state, batch)
}

/// Run one flow, agent or server tool call and record its result.
///
/// Returns the status of a nested run that suspended. Caller-protocol errors
/// of the nested run are returned instead of being reported to the model.
async fn call_in_process(
    agent: &Agent,
    conversation: &mut Conversation,
    batch: &mut Batch,
    tool: &Tool,
    request: &ToolRequest,
    precomputed: Option<Result<Value>>,
) -> Result<Option<ExecutionStatus>> {
    let outcome = match precomputed {
        Some(result) => result.map(NestedRun::Done),
        None => {
            events::emit(Event::ToolStarted {
                request_id: request.id.clone(),
                tool: request.name.clone(),
            });
            exec::run_nested(tool, request, conversation, &request.id).await
        }
    };
    let error = match outcome {
        Ok(NestedRun::Suspended(status)) => return Ok(Some(status)),
        Ok(NestedRun::Done(value)) => {
            events::emit(Event::ToolFinished {
                request_id: request.id.clone(),
                tool: request.name.clone(),
                is_error: false,
            });
            conversation.append_tool_result(ToolResult::success(&request.id, value));
            return Ok(None);
        }
        Err(error) if error.is_protocol_error() => return Err(error),
        Err(error) => error,
    };
    events::emit(Event::ToolFinished {
        request_id: request.id.clone(),
        tool: request.name.clone(),
        is_error: true,
    });
    if !agent.raise_exceptions {
        tracing::warn!(
            conversation_id = %conversation.id(),
            tool = %request.name,
            error = %error,
            "Tool call failed, reporting the failure to the model"
        );
    }
    conversation.append_tool_result(ToolResult::error(&request.id, error.to_string()));
    batch.capture(&request.name, error);
    Ok(None)
}

/// Run the in-process calls of a fresh batch on the worker pool, when there
/// is a pool, more than one such call, and none of them can suspend.
async fn run_on_pool(
    agent: &Agent,
    conversation: &mut Conversation,
    batch: &Batch,
) -> BTreeMap<usize, Result<Value>> {
    let mut results = BTreeMap::new();
    if batch.next != 0 {
        return results;
    }
    let in_process: Vec<(usize, Tool)> = batch
        .requests
        .iter()
        .enumerate()
        .filter_map(|(i, r)| match dispatch(agent, batch, r) {
            Dispatch::InProcess(tool) => Some((i, tool.clone())),
            _ => None,
        })
        .collect();
    if in_process.len() < 2 || in_process.iter().any(|(_, t)| in_process_might_yield(t)) {
        return results;
    }
    let Some(pool) = pool::worker_pool() else {
        return results;
    };

    tracing::debug!(
        conversation_id = %conversation.id(),
        calls = in_process.len(),
        "Running tool batch on the worker pool"
    );
    let interrupts = conversation.interrupts();
    let mut jobs = Vec::with_capacity(in_process.len());
    let mut indices = Vec::with_capacity(in_process.len());
    for (index, tool) in in_process {
        let request = batch.requests[index].clone();
        events::emit(Event::ToolStarted {
            request_id: request.id.clone(),
            tool: request.name.clone(),
        });
        indices.push(index);
        jobs.push(exec::run_detached(tool, request, interrupts.clone()));
    }
    let outputs = pool.run_all(jobs, None).await;
    for (index, output) in indices.into_iter().zip(outputs) {
        let result = match output {
            Ok((result, usage)) => {
                conversation.add_token_usage(usage);
                result
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation.id(),
                    tool = %batch.requests[index].name,
                    %error,
                    "Pooled tool call did not run"
                );
                Err(error)
            }
        };
        results.insert(index, result);
    }
    results
}

fn in_process_might_yield(tool: &Tool) -> bool {
    match tool {
        Tool::Flow(t) => t.flow.might_yield(),
        Tool::Agent(t) => t.agent.might_yield(),
        Tool::Server(_) | Tool::Client(_) => false,
    }
}

fn submit(
    agent: &Agent,
    conversation: &mut Conversation,
    batch: &mut Batch,
    request: &ToolRequest,
) {
    let provided = exec::args_to_values(&request.args);
    match resolve_values(&agent.outputs, &provided) {
        Ok(values) => {
            conversation
                .append_tool_result(ToolResult::success(&request.id, json!("Outputs submitted")));
            batch.termination = Some(Termination::Submitted(values));
        }
        Err(ResolveError::Missing(name)) => {
            conversation.append_tool_result(ToolResult::error(
                &request.id,
                format!(
                    "Missing required output `{name}`. \
                     Call `{SUBMIT_OUTPUT_TOOL}` again with every required output."
                ),
            ));
        }
        Err(ResolveError::Type(e)) => {
            conversation.append_tool_result(ToolResult::error(
                &request.id,
                format!("Invalid output: {e}"),
            ));
        }
    }
}

/// Decide what follows a fully processed batch
fn settle(
    agent: &Agent,
    conversation: &mut Conversation,
    state: &mut AgentState,
    mut batch: Batch,
) -> Result<Option<ExecutionStatus>> {
    let client_requests = std::mem::take(&mut batch.client_requests);
    let stopping =
        batch.termination.is_some() || (agent.raise_exceptions && batch.failure.is_some());
    if stopping {
        for request in &client_requests {
            conversation.append_tool_result(ToolResult::error(&request.id, SKIPPED));
        }
    }

    if agent.raise_exceptions && batch.failure.is_some() {
        conversation.clear_step_state(STATE_KEY);
        return Err(batch
            .into_error()
            .unwrap_or_else(|| FlowError::tool(&agent.name, "tool call failed")));
    }

    match batch.termination.take() {
        Some(Termination::Submitted(values)) => return Ok(Some(finish(conversation, values))),
        Some(Termination::End) => {
            return match resolve_values(&agent.outputs, &Values::new()) {
                Ok(values) => Ok(Some(finish(conversation, values))),
                Err(_) => {
                    tracing::debug!(
                        conversation_id = %conversation.id(),
                        "Conversation ended without outputs, handing over"
                    );
                    hand_over(conversation, state, None).map(Some)
                }
            };
        }
        None => {}
    }

    if !client_requests.is_empty() {
        state.pending = Some(Pending::ClientTools {
            requests: client_requests.clone(),
        });
        save_state(conversation, state)?;
        return Ok(Some(ExecutionStatus::ToolRequest {
            tool_requests: client_requests,
        }));
    }
    save_state(conversation, state)?;
    Ok(None)
}
