use super::*;
use crate::error::FlowError;
use crate::events::{register_event_listeners, EventListener};
use crate::interrupt::{CancellationInterrupt, ExecutionInterrupt};
use crate::llm::{LlmError, Prompt};
use crate::property::Values;
use crate::testing::{add_tool, failing_tool, global_lock, MockLlm, MOCK_USAGE};
use crate::tool::{AgentTool, ClientTool, ServerTool, ToolRequest, ToolResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn submit(args: Value) -> ToolRequest {
    ToolRequest::new(SUBMIT_OUTPUT_TOOL, args)
}

fn worker(llm: &MockLlm) -> AgentBuilder {
    Agent::builder("worker", Arc::new(llm.clone()))
        .instruction("Do the work")
        .output(Property::integer("result"))
        .caller_input_mode(CallerInputMode::Never)
}

fn tool_names(prompt: &Prompt) -> Vec<&str> {
    prompt.tools.iter().map(|t| t.name.as_str()).collect()
}

fn double_tool() -> ServerTool {
    ServerTool::builder("double")
        .input(Property::integer("x"))
        .output(Property::integer("doubled"))
        .requires_confirmation(true)
        .handler(|args: Values| async move {
            Ok(Value::from(args.get("x").and_then(Value::as_i64).unwrap_or_default() * 2))
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_submit_fills_defaults() {
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![submit(json!({"a": 1}))]);
    let agent = Agent::builder("filler", Arc::new(llm.clone()))
        .output(Property::integer("a"))
        .output(Property::string("b").with_default("nothing"))
        .caller_input_mode(CallerInputMode::Never)
        .build()
        .unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    let outputs = status.output_values().unwrap();
    assert_eq!(outputs["a"], json!(1));
    assert_eq!(outputs["b"], json!("nothing"));
    assert!(conv.is_finished());
    assert_eq!(conv.token_usage(), MOCK_USAGE);

    let prompt = &llm.recorded_prompts()[0];
    assert_eq!(tool_names(prompt), vec![SUBMIT_OUTPUT_TOOL]);
    assert!(prompt.system.contains(SUBMIT_OUTPUT_TOOL));

    let err = agent.execute(&mut conv).await.unwrap_err();
    assert!(matches!(err, FlowError::ConversationFinished(_)));
}

#[tokio::test]
async fn test_incomplete_submission_is_reported_back() {
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![submit(json!({})).with_id("s1")]);
    llm.queue_tool_calls(vec![submit(json!({"result": 7}))]);
    let agent = worker(&llm).build().unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    assert_eq!(status.output_values().unwrap()["result"], json!(7));
    let first = conv.find_tool_result("s1").unwrap();
    assert!(first.is_error);
    assert!(first.content_text().contains("result"));
}

#[tokio::test]
async fn test_failing_call_is_reported_to_the_model() {
    let _guard = global_lock();
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![
        ToolRequest::new("add", json!({"a": 1, "b": 2})).with_id("c1"),
        ToolRequest::new("explode", json!({})).with_id("c2"),
    ]);
    llm.queue_tool_calls(vec![submit(json!({"result": 3}))]);
    let agent = worker(&llm)
        .tool(add_tool())
        .tool(failing_tool("explode", "boom"))
        .build()
        .unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    assert_eq!(status.output_values().unwrap()["result"], json!(3));

    let added = conv.find_tool_result("c1").unwrap();
    assert!(!added.is_error);
    assert_eq!(added.content, json!(3));
    let exploded = conv.find_tool_result("c2").unwrap();
    assert!(exploded.is_error);
    assert!(exploded.content_text().contains("boom"));

    let second = &llm.recorded_prompts()[1];
    assert_eq!(
        second.messages.iter().filter(|m| m.as_tool_result().is_some()).count(),
        2
    );
}

#[tokio::test]
async fn test_raise_exceptions_fails_after_recording_every_result() {
    let _guard = global_lock();
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![
        ToolRequest::new("explode", json!({})).with_id("c1"),
        ToolRequest::new("add", json!({"a": 2, "b": 2})).with_id("c2"),
        ToolRequest::new("lookup", json!({})).with_id("c3"),
    ]);
    let agent = worker(&llm)
        .tool(add_tool())
        .tool(failing_tool("explode", "boom"))
        .tool(ClientTool::new("lookup", "Look something up", vec![]))
        .raise_exceptions(true)
        .build()
        .unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let err = agent.execute(&mut conv).await.unwrap_err();
    assert!(matches!(
        &err,
        FlowError::Tool { tool, message } if tool == "explode" && message == "boom"
    ));
    for id in ["c1", "c2", "c3"] {
        assert!(conv.find_tool_result(id).is_some(), "no result for {id}");
    }
    assert!(conv.find_tool_result("c3").unwrap().is_error);
}

#[tokio::test]
async fn test_unknown_tool_gets_an_error_result() {
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![ToolRequest::new("teleport", json!({})).with_id("u1")]);
    llm.queue_tool_calls(vec![submit(json!({"result": 0}))]);
    let agent = worker(&llm).build().unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    assert!(agent.execute(&mut conv).await.unwrap().is_finished());
    let result = conv.find_tool_result("u1").unwrap();
    assert!(result.is_error);
    assert!(result.content_text().contains("unknown tool"));
}

#[tokio::test]
async fn test_confirmation_applies_modified_args() {
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![ToolRequest::new("double", json!({"x": 1})).with_id("d1")]);
    llm.queue_tool_calls(vec![submit(json!({"result": 42}))]);
    let agent = worker(&llm).tool(double_tool()).build().unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    let ExecutionStatus::ToolConfirmation { tool_requests } = status else {
        panic!("expected a confirmation request");
    };
    assert_eq!(tool_requests[0].id, "d1");

    let err = agent.execute(&mut conv).await.unwrap_err();
    assert!(matches!(err, FlowError::MissingInput(_)));

    conv.confirm_tool_execution("d1", Some(json!({"x": 21})));
    let status = agent.execute(&mut conv).await.unwrap();
    assert!(status.is_finished());
    assert_eq!(conv.find_tool_result("d1").unwrap().content, json!(42));
}

#[tokio::test]
async fn test_rejected_call_is_not_executed() {
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![ToolRequest::new("double", json!({"x": 1})).with_id("d1")]);
    llm.queue_tool_calls(vec![submit(json!({"result": 0}))]);
    let agent = worker(&llm).tool(double_tool()).build().unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    agent.execute(&mut conv).await.unwrap();
    conv.reject_tool_execution("d1", "too risky");
    assert!(agent.execute(&mut conv).await.unwrap().is_finished());

    let result = conv.find_tool_result("d1").unwrap();
    assert!(result.is_error);
    assert!(result.content_text().contains("too risky"));
}

#[tokio::test]
async fn test_client_tool_round_trip() {
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![ToolRequest::new("weather", json!({"city": "Oslo"})).with_id("w1")]);
    llm.queue_tool_calls(vec![submit(json!({"result": 12}))]);
    let agent = worker(&llm)
        .tool(ClientTool::new("weather", "Current temperature", vec![Property::string("city")]))
        .build()
        .unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    let ExecutionStatus::ToolRequest { tool_requests } = status else {
        panic!("expected a client tool request");
    };
    assert_eq!(tool_requests[0].args, json!({"city": "Oslo"}));

    let err = agent.execute(&mut conv).await.unwrap_err();
    assert!(matches!(err, FlowError::MissingInput(_)));

    conv.append_tool_result(ToolResult::success("w1", json!(12)));
    let status = agent.execute(&mut conv).await.unwrap();
    assert_eq!(status.output_values().unwrap()["result"], json!(12));
    let last = llm.recorded_prompts().pop().unwrap();
    let seen = last.messages.last().and_then(|m| m.as_tool_result().cloned()).unwrap();
    assert_eq!(seen.id, "w1");
}

#[tokio::test]
async fn test_agent_used_as_tool() {
    let inner_llm = MockLlm::new();
    inner_llm.queue_tool_calls(vec![submit(json!({"answer": 42}))]);
    let inner = Agent::builder("oracle", Arc::new(inner_llm.clone()))
        .description("Answers questions")
        .output(Property::integer("answer"))
        .caller_input_mode(CallerInputMode::Never)
        .build()
        .unwrap();

    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![
        ToolRequest::new("oracle", json!({"request": "What is six times seven?"})).with_id("n1"),
    ]);
    llm.queue_tool_calls(vec![submit(json!({"result": 42}))]);
    let agent = worker(&llm).tool(AgentTool::new(Arc::new(inner))).build().unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    assert!(agent.execute(&mut conv).await.unwrap().is_finished());
    assert_eq!(conv.find_tool_result("n1").unwrap().content, json!({"answer": 42}));

    let inner_prompt = &inner_llm.recorded_prompts()[0];
    assert_eq!(inner_prompt.messages[0].text(), "What is six times seven?");
    assert!(tool_names(&llm.recorded_prompts()[0]).contains(&"oracle"));
}

#[tokio::test]
async fn test_iteration_limit_hands_over_to_the_user() {
    let llm = MockLlm::new();
    llm.queue_text("thinking");
    llm.queue_text("still thinking");
    llm.queue_tool_calls(vec![submit(json!({"result": 5}))]);
    let agent = worker(&llm).max_iterations(2).build().unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    assert_eq!(status, ExecutionStatus::UserMessageRequest { message: None });
    assert_eq!(llm.recorded_prompts().len(), 2);
    let second = &llm.recorded_prompts()[1];
    assert!(second.messages.iter().any(|m| m.internal));

    conv.append_user_message("Please finish");
    let status = agent.execute(&mut conv).await.unwrap();
    assert_eq!(status.output_values().unwrap()["result"], json!(5));
}

#[tokio::test]
async fn test_plain_text_asks_the_user() {
    let llm = MockLlm::new();
    llm.queue_text("What should I add?");
    let agent = Agent::builder("helper", Arc::new(llm.clone())).build().unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    let ExecutionStatus::UserMessageRequest { message: Some(message) } = status else {
        panic!("expected a question for the user");
    };
    assert_eq!(message.text(), "What should I add?");
    assert!(tool_names(&llm.recorded_prompts()[0]).is_empty());

    let err = agent.execute(&mut conv).await.unwrap_err();
    assert!(matches!(err, FlowError::MissingInput(_)));
}

#[tokio::test]
async fn test_end_conversation() {
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![ToolRequest::new(END_CONVERSATION_TOOL, json!({}))]);
    let agent = Agent::builder("greeter", Arc::new(llm.clone()))
        .can_finish_conversation(true)
        .build()
        .unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    assert_eq!(status.output_values(), Some(&Values::new()));
    assert!(conv.is_finished());
    assert_eq!(tool_names(&llm.recorded_prompts()[0]), vec![END_CONVERSATION_TOOL]);
}

#[tokio::test]
async fn test_end_conversation_without_required_outputs_hands_over() {
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![ToolRequest::new(END_CONVERSATION_TOOL, json!({}))]);
    let agent = Agent::builder("greeter", Arc::new(llm.clone()))
        .output(Property::string("summary"))
        .can_finish_conversation(true)
        .build()
        .unwrap();
    assert!(agent.might_yield());

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    assert_eq!(status, ExecutionStatus::UserMessageRequest { message: None });
    assert!(!conv.is_finished());
}

#[tokio::test]
async fn test_instruction_is_rendered_from_inputs() {
    let llm = MockLlm::new();
    llm.queue_text("Owls are great");
    let agent = Agent::builder("writer", Arc::new(llm.clone()))
        .input(Property::string("topic"))
        .instruction("Write about {{topic}}")
        .stream(true)
        .build()
        .unwrap();

    let inputs = Values::from([("topic".to_string(), json!("owls"))]);
    let mut conv = agent.start_conversation(inputs, vec![]).unwrap();
    let status = agent.execute(&mut conv).await.unwrap();
    assert!(matches!(
        status,
        ExecutionStatus::UserMessageRequest { message: Some(m) } if m.text() == "Owls are great"
    ));
    assert_eq!(llm.recorded_prompts()[0].system, "Write about owls");
}

#[tokio::test]
async fn test_llm_failure_propagates() {
    let llm = MockLlm::new();
    llm.queue_error(LlmError::unavailable("connection reset"));
    let agent = worker(&llm).build().unwrap();
    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let err = agent.execute(&mut conv).await.unwrap_err();
    assert!(matches!(err, FlowError::Llm(_)));
}

#[tokio::test]
async fn test_interrupt_before_model_call() {
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![submit(json!({"result": 1}))]);
    let agent = worker(&llm).build().unwrap();
    let interrupt = CancellationInterrupt::new(CancellationToken::new());
    interrupt.token().cancel();

    let mut conv = agent
        .start_conversation(Values::new(), vec![])
        .unwrap()
        .with_interrupts(vec![Arc::new(interrupt) as Arc<dyn ExecutionInterrupt>]);
    let status = agent.execute(&mut conv).await.unwrap();
    assert!(matches!(status, ExecutionStatus::Interrupted { .. }));
    assert!(llm.recorded_prompts().is_empty());
}

#[tokio::test]
async fn test_model_calls_emit_events() {
    let _guard = global_lock();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener = move |event: &Event| sink.lock().push(event.clone());
    let _listeners = register_event_listeners(vec![Arc::new(listener) as Arc<dyn EventListener>]);

    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![submit(json!({"result": 1}))]);
    let agent = worker(&llm).build().unwrap();
    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    agent.execute(&mut conv).await.unwrap();

    let events: Vec<Event> = seen
        .lock()
        .iter()
        .filter(|e| e.conversation_id() == Some(conv.id()))
        .cloned()
        .collect();
    assert!(matches!(events.first(), Some(Event::ExecutionStarted { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::LlmRequest { model, .. } if model == "mock-model")));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::LlmResponse { usage, .. } if *usage == MOCK_USAGE)));
    assert!(matches!(events.last(), Some(Event::ExecutionFinished { status: "finished", .. })));
}

#[test]
fn test_build_validation() {
    let llm = Arc::new(MockLlm::new());
    let checked = || Agent::builder("checked", llm.clone());

    assert!(checked().max_iterations(0).build().is_err());
    assert!(checked().tool(add_tool()).tool(add_tool()).build().is_err());
    assert!(checked()
        .tool(ClientTool::new(SUBMIT_OUTPUT_TOOL, "", vec![]))
        .build()
        .is_err());
    assert!(checked().instruction("Hello {{name}}").build().is_err());
    assert!(checked()
        .output(Property::string("x"))
        .output(Property::integer("x"))
        .build()
        .is_err());

    let agent = checked()
        .input(Property::string("name"))
        .instruction("Hello {{name}}")
        .build()
        .unwrap();
    assert_eq!(agent.max_iterations(), builder::DEFAULT_MAX_ITERATIONS);
    assert!(!agent.id().is_empty());
    assert!(agent.might_yield());
}

#[test]
fn test_might_yield() {
    let llm = MockLlm::new();
    let quiet = worker(&llm).tool(add_tool()).build().unwrap();
    assert!(!quiet.might_yield());
    let with_client = worker(&llm)
        .tool(ClientTool::new("lookup", "", vec![]))
        .build()
        .unwrap();
    assert!(with_client.might_yield());
}

fn tool_result_ids(conv: &Conversation) -> Vec<String> {
    conv.messages()
        .to_vec()
        .iter()
        .filter_map(|m| m.as_tool_result().map(|r| r.id.clone()))
        .collect()
}

fn worker_id_tool() -> ServerTool {
    ServerTool::builder("worker_id")
        .output(Property::any("worker"))
        .handler(|_args: Values| async move { Ok(json!(crate::pool::current_worker_id())) })
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pooled_batch_records_results_in_request_order() {
    let _guard = global_lock();
    crate::pool::init_worker_pool(2).unwrap();
    for raise in [false, true] {
        let llm = MockLlm::new();
        llm.queue_tool_calls(vec![
            ToolRequest::new("add", json!({"a": 1, "b": 2})).with_id("c1"),
            ToolRequest::new("explode", json!({})).with_id("c2"),
            ToolRequest::new("add", json!({"a": 2, "b": 3})).with_id("c3"),
            ToolRequest::new("worker_id", json!({})).with_id("c4"),
        ]);
        llm.queue_tool_calls(vec![submit(json!({"result": 8}))]);
        let agent = worker(&llm)
            .tool(add_tool())
            .tool(failing_tool("explode", "boom"))
            .tool(worker_id_tool())
            .raise_exceptions(raise)
            .build()
            .unwrap();

        let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
        let outcome = agent.execute(&mut conv).await;

        let ids = tool_result_ids(&conv);
        assert_eq!(ids[..4], ["c1", "c2", "c3", "c4"]);
        assert_eq!(conv.find_tool_result("c1").unwrap().content, json!(3));
        assert!(conv.find_tool_result("c2").unwrap().content_text().contains("boom"));
        assert_eq!(conv.find_tool_result("c3").unwrap().content, json!(5));
        assert!(conv.find_tool_result("c4").unwrap().content.is_u64());
        if raise {
            assert!(matches!(outcome, Err(FlowError::Tool { .. })));
            assert_eq!(ids.len(), 4);
        } else {
            assert_eq!(outcome.unwrap().output_values().unwrap()["result"], json!(8));
        }
    }
    crate::pool::shutdown_worker_pool();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_shutdown_mid_batch_still_answers_every_call() {
    let _guard = global_lock();
    crate::pool::init_worker_pool(1).unwrap();
    let stopper = ServerTool::builder("stopper")
        .output(Property::boolean("stopped"))
        .handler(|_args: Values| async move {
            let stopped = crate::pool::shutdown_worker_pool();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(json!(stopped))
        })
        .build()
        .unwrap();
    let llm = MockLlm::new();
    llm.queue_tool_calls(vec![
        ToolRequest::new("stopper", json!({})).with_id("s1"),
        ToolRequest::new("stopper", json!({})).with_id("s2"),
        ToolRequest::new("stopper", json!({})).with_id("s3"),
    ]);
    llm.queue_tool_calls(vec![submit(json!({"result": 2}))]);
    let agent = worker(&llm).tool(stopper).build().unwrap();

    let mut conv = agent.start_conversation(Values::new(), vec![]).unwrap();
    let status = agent.execute(&mut conv).await;
    crate::pool::shutdown_worker_pool();

    assert_eq!(status.unwrap().output_values().unwrap()["result"], json!(2));
    let results: Vec<ToolResult> = ["s1", "s2", "s3"]
        .iter()
        .map(|id| conv.find_tool_result(id).unwrap())
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_error).count(), 2);
    assert!(results
        .iter()
        .filter(|r| r.is_error)
        .all(|r| r.content_text().contains("worker pool")));
}

#[test]
fn test_build_checks_remote_tool_configs() {
    let llm = MockLlm::new();
    let mut lookup = ClientTool::new("lookup", "Remote lookup", vec![]);
    lookup.remote = Some(crate::tool::RemoteToolConfig {
        url: "https://tools.local".to_string(),
        headers: [("Authorization".to_string(), "x".to_string())].into(),
        sensitive_headers: [("AUTHORIZATION".to_string(), "y".to_string())].into(),
    });
    let err = worker(&llm).tool(lookup).build().unwrap_err();
    assert!(matches!(err, FlowError::InvalidStep { .. }));
}
