//! LLM collaborator abstraction
//!
//! The engine only needs a model that turns a prompt into a message. Provider
//! adapters live outside this crate and implement [`LlmService`].

mod error;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use types::*;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

/// Stream of generation chunks
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, LlmError>>;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Generate a complete message
    async fn generate(&self, prompt: &Prompt) -> Result<LlmCompletion, LlmError>;

    /// Generate a message as an ordered stream of chunks.
    ///
    /// The stream is `Start`, any number of `Text`, then `End` carrying the
    /// final message, whose text equals the concatenation of the text chunks.
    /// The default implementation derives the stream from [`generate`].
    ///
    /// [`generate`]: LlmService::generate
    async fn stream_generate(&self, prompt: &Prompt) -> Result<ChunkStream, LlmError> {
        let completion = self.generate(prompt).await?;
        let mut chunks = vec![Ok(StreamChunk::Start)];
        if !completion.message.text.is_empty() {
            chunks.push(Ok(StreamChunk::Text(completion.message.text.clone())));
        }
        chunks.push(Ok(StreamChunk::End(completion)));
        Ok(stream::iter(chunks).boxed())
    }

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Drain a chunk stream into the final completion
pub async fn collect_stream(
    mut chunks: ChunkStream,
    mut on_text: impl FnMut(&str) + Send,
) -> Result<LlmCompletion, LlmError> {
    let mut text = String::new();
    while let Some(chunk) = chunks.next().await {
        match chunk? {
            StreamChunk::Start => text.clear(),
            StreamChunk::Text(delta) => {
                on_text(&delta);
                text.push_str(&delta);
            }
            StreamChunk::End(mut completion) => {
                if completion.message.text.is_empty() {
                    completion.message.text = text;
                }
                return Ok(completion);
            }
        }
    }
    Err(LlmError::invalid_response("stream ended without a final message"))
}

/// Logging wrapper for LLM services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn generate(&self, prompt: &Prompt) -> Result<LlmCompletion, LlmError> {
        let start = std::time::Instant::now();
        let result = self
            .inner
            .generate(prompt)
            .await
            .map_err(|e| e.with_model(&self.model_id));
        let duration = start.elapsed();

        match &result {
            Ok(completion) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    messages = prompt.messages.len(),
                    input_tokens = completion.usage.input_tokens,
                    output_tokens = completion.usage.output_tokens,
                    tool_requests = completion.message.tool_requests.len(),
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    kind = %e.kind,
                    error = %e.message,
                    retryable = e.is_retryable(),
                    "LLM request failed"
                );
            }
        }

        result
    }

    async fn stream_generate(&self, prompt: &Prompt) -> Result<ChunkStream, LlmError> {
        tracing::debug!(
            model = %self.model_id,
            messages = prompt.messages.len(),
            "LLM streaming request started"
        );
        self.inner
            .stream_generate(prompt)
            .await
            .map_err(|e| e.with_model(&self.model_id))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
