//! Failures of an [`LlmService`](super::LlmService)

use std::fmt;
use thiserror::Error;

/// A generation that produced no usable message
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    /// Model that failed, once known
    pub model: Option<String>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            model: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Unavailable, message)
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Throttled, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Refused, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::InvalidResponse, message)
    }

    /// Attach the model id unless one is already set
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model.get_or_insert_with(|| model.into());
        self
    }

    /// Whether sending the same prompt again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, LlmErrorKind::Unavailable | LlmErrorKind::Throttled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Provider unreachable or timed out
    Unavailable,
    /// Provider asked to slow down
    Throttled,
    /// Prompt refused, for example as malformed or too long
    Refused,
    /// A response or stream that does not form a message
    InvalidResponse,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LlmErrorKind::Unavailable => "model unavailable",
            LlmErrorKind::Throttled => "model throttled",
            LlmErrorKind::Refused => "prompt refused",
            LlmErrorKind::InvalidResponse => "invalid model response",
        })
    }
}
