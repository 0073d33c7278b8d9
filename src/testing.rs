//! Test doubles shared by the unit tests
//!
//! Process-wide registries (worker pool, stream limit, event listeners) are
//! serialized with [`global_lock`].

use crate::llm::{GeneratedMessage, LlmCompletion, LlmError, LlmService, Prompt, TokenUsage};
use crate::property::{Property, Values};
use crate::tool::{ServerTool, ToolRequest};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

static GLOBAL: Mutex<()> = parking_lot::const_mutex(());

/// Hold while a test touches process-wide state
pub(crate) fn global_lock() -> MutexGuard<'static, ()> {
    GLOBAL.lock()
}

#[derive(Default)]
struct MockState {
    responses: VecDeque<Result<LlmCompletion, LlmError>>,
    prompts: Vec<Prompt>,
}

/// LLM returning queued responses; clones share the queue and the record
#[derive(Clone, Default)]
pub(crate) struct MockLlm {
    state: Arc<Mutex<MockState>>,
}

pub(crate) const MOCK_USAGE: TokenUsage = TokenUsage {
    input_tokens: 10,
    output_tokens: 5,
};

impl MockLlm {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn queue(&self, message: GeneratedMessage) {
        self.state.lock().responses.push_back(Ok(LlmCompletion {
            message,
            usage: MOCK_USAGE,
        }));
    }

    pub(crate) fn queue_text(&self, text: &str) {
        self.queue(GeneratedMessage::text(text));
    }

    pub(crate) fn queue_tool_calls(&self, requests: Vec<ToolRequest>) {
        self.queue(GeneratedMessage::tool_calls(requests));
    }

    pub(crate) fn queue_error(&self, error: LlmError) {
        self.state.lock().responses.push_back(Err(error));
    }

    pub(crate) fn recorded_prompts(&self) -> Vec<Prompt> {
        self.state.lock().prompts.clone()
    }
}

#[async_trait]
impl LlmService for MockLlm {
    async fn generate(&self, prompt: &Prompt) -> Result<LlmCompletion, LlmError> {
        let mut state = self.state.lock();
        state.prompts.push(prompt.clone());
        state
            .responses
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::unavailable("No mock response queued")))
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }
}

/// Server tool returning `args.a + args.b`
pub(crate) fn add_tool() -> ServerTool {
    ServerTool::builder("add")
        .description("Add two integers")
        .input(Property::integer("a"))
        .input(Property::integer("b"))
        .output(Property::integer("sum"))
        .handler(|args: Values| async move {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or_default();
            let b = args.get("b").and_then(Value::as_i64).unwrap_or_default();
            Ok(Value::from(a + b))
        })
        .build()
        .expect("valid tool")
}

/// Server tool that always fails with `message`
pub(crate) fn failing_tool(name: &str, message: &'static str) -> ServerTool {
    ServerTool::builder(name)
        .output(Property::string("never"))
        .handler(move |_args: Values| async move {
            Err(crate::tool::ToolError::Failed(message.to_string()))
        })
        .build()
        .expect("valid tool")
}
