//! Common types for LLM interactions

use crate::message::Message;
use crate::tool::ToolRequest;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Everything the model sees for one generation
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// Tool definition
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A message produced by the model: text, tool calls, or both
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedMessage {
    pub text: String,
    pub tool_requests: Vec<ToolRequest>,
}

impl GeneratedMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_requests: Vec::new(),
        }
    }

    pub fn tool_calls(tool_requests: Vec<ToolRequest>) -> Self {
        Self {
            text: String::new(),
            tool_requests,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_requests.is_empty()
    }
}

/// Result of one generation
#[derive(Debug, Clone, Default)]
pub struct LlmCompletion {
    pub message: GeneratedMessage,
    pub usage: TokenUsage,
}

/// Streaming chunk
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Start,
    Text(String),
    End(LlmCompletion),
}

/// Usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}
