//! Flowloom demo: a word-counting flow driven from stdin
//!
//! Settings come from the `FLOWLOOM_*` environment variables, see
//! [`EngineConfig`].

use flowloom::steps::{InputMessageStep, OutputMessageStep, ToolExecutionStep};
use flowloom::tool::ToolError;
use flowloom::{
    Component, EngineConfig, ExecutionStatus, Flow, FlowNode, Property, ServerTool, Values,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Deserialize)]
struct CountArgs {
    text: String,
}

fn build_flow() -> flowloom::Result<Flow> {
    let counter = ServerTool::builder("count_words")
        .description("Count the words of a text")
        .input(Property::string("text"))
        .output(Property::integer("words"))
        .typed_handler(|args: CountArgs| async move {
            Ok::<_, ToolError>(args.text.split_whitespace().count())
        })
        .build()?;

    Flow::builder("word_counter")
        .description("Asks for a sentence and reports how many words it has")
        .step("ask", InputMessageStep::with_prompt("Type a sentence:"))
        .node(
            FlowNode::new("count", Arc::new(ToolExecutionStep::new(counter)))
                .rename_input("text", "user_provided_input"),
        )
        .step("report", OutputMessageStep::new("That is {{tool_output}} words."))
        .transition("ask", "count")
        .transition("count", "report")
        .exit("report")
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_env();
    config.init_tracing();
    config.apply()?;
    tracing::info!(?config, "Engine configured");

    let flow = build_flow()?;
    let mut conversation = flow.start_conversation(Values::new(), vec![])?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match flow.execute(&mut conversation).await? {
            ExecutionStatus::UserMessageRequest { message } => {
                if let Some(message) = message {
                    println!("{}", message.text());
                }
                let Some(line) = lines.next_line().await? else {
                    tracing::info!(conversation_id = %conversation.id(), "Input closed");
                    break;
                };
                conversation.append_user_message(line);
            }
            ExecutionStatus::Finished { output_values, .. } => {
                if let Some(report) = output_values.get("output_message").and_then(|v| v.as_str()) {
                    println!("{report}");
                }
                break;
            }
            other => {
                tracing::warn!(status = other.kind(), "The demo flow cannot answer this status");
                break;
            }
        }
    }

    tracing::info!(
        conversation_id = %conversation.id(),
        tokens = conversation.token_usage().total(),
        "Demo finished"
    );
    Ok(())
}
