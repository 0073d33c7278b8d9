//! Conversation messages

use crate::tool::{ToolRequest, ToolResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

/// Message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    ToolRequests { text: String, requests: Vec<ToolRequest> },
    ToolResult { result: ToolResult },
}

/// A single entry of a conversation's message list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: MessageContent,
    /// Kept for the model, hidden from `visible_messages`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: MessageContent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            internal: false,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, MessageContent::Text { text: text.into() })
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Agent, MessageContent::Text { text: text.into() })
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, MessageContent::Text { text: text.into() })
    }

    pub fn tool_requests(text: impl Into<String>, requests: Vec<ToolRequest>) -> Self {
        Self::new(
            MessageRole::Agent,
            MessageContent::ToolRequests {
                text: text.into(),
                requests,
            },
        )
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self::new(MessageRole::User, MessageContent::ToolResult { result })
    }

    #[must_use]
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Text of the message, empty for tool results
    pub fn text(&self) -> &str {
        match &self.content {
            MessageContent::Text { text } | MessageContent::ToolRequests { text, .. } => text,
            MessageContent::ToolResult { .. } => "",
        }
    }

    pub fn tool_requests_slice(&self) -> &[ToolRequest] {
        match &self.content {
            MessageContent::ToolRequests { requests, .. } => requests,
            _ => &[],
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResult> {
        match &self.content {
            MessageContent::ToolResult { result } => Some(result),
            _ => None,
        }
    }

    /// A plain message typed by the user
    pub fn is_user_text(&self) -> bool {
        self.role == MessageRole::User && matches!(self.content, MessageContent::Text { .. })
    }
}

/// Append-only message list, shareable between a conversation and its
/// shared sub-conversations.
#[derive(Clone, Default)]
pub struct MessageList(Arc<Mutex<Vec<Message>>>);

impl MessageList {
    pub fn new(messages: Vec<Message>) -> Self {
        Self(Arc::new(Mutex::new(messages)))
    }

    pub fn push(&self, message: Message) {
        self.0.lock().push(message);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Copy of every message
    pub fn to_vec(&self) -> Vec<Message> {
        self.0.lock().clone()
    }

    /// Copy of the messages from index `start` on
    pub fn since(&self, start: usize) -> Vec<Message> {
        self.0.lock().iter().skip(start).cloned().collect()
    }

    pub fn last(&self) -> Option<Message> {
        self.0.lock().last().cloned()
    }

    pub fn find_map<T>(&self, f: impl FnMut(&Message) -> Option<T>) -> Option<T> {
        self.0.lock().iter().find_map(f)
    }

    /// Whether both handles point to the same underlying list
    pub fn is_shared_with(&self, other: &MessageList) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for MessageList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.lock().iter()).finish()
    }
}

impl Serialize for MessageList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.lock().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Message>::deserialize(deserializer).map(MessageList::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shared_list_visible_both_ways() {
        let list = MessageList::default();
        let shared = list.clone();
        shared.push(Message::user("hi"));
        list.push(Message::agent("hello"));
        assert_eq!(list.len(), 2);
        assert_eq!(shared.len(), 2);
        assert!(list.is_shared_with(&shared));
        assert!(!list.is_shared_with(&MessageList::default()));
    }

    #[test]
    fn test_message_serde_tags() {
        let request = ToolRequest::new("search", json!({"q": "rust"}));
        let msg = Message::tool_requests("", vec![request.clone()]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "agent");
        assert_eq!(value["content"]["type"], "tool_requests");
        assert!(value.get("internal").is_none());
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back.tool_requests_slice(), &[request]);
    }

    #[test]
    fn test_text_accessors() {
        assert_eq!(Message::user("question").text(), "question");
        assert!(Message::user("question").is_user_text());
        let result = Message::tool_result(ToolResult::success("1", json!("ok")));
        assert_eq!(result.text(), "");
        assert!(!result.is_user_text());
        assert_eq!(result.as_tool_result().map(|r| r.id.as_str()), Some("1"));
    }
}
