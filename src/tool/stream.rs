//! Streamed tool outputs
//!
//! A streaming tool yields intermediate chunks; the last chunk is the tool's
//! result. The number of chunks a single stream may produce is bounded by a
//! process-wide limit.

use super::ToolError;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_MAX_STREAM_CHUNKS: usize = 10_000;

static MAX_STREAM_CHUNKS: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_STREAM_CHUNKS);

/// Current chunk limit for tool output streams
pub fn max_stream_chunks() -> usize {
    MAX_STREAM_CHUNKS.load(Ordering::Relaxed)
}

/// Change the chunk limit. Applies to streams opened afterwards.
///
/// A limit of zero is clamped to one.
pub fn set_max_stream_chunks(limit: usize) {
    MAX_STREAM_CHUNKS.store(limit.max(1), Ordering::Relaxed);
}

pub fn reset_max_stream_chunks() {
    set_max_stream_chunks(DEFAULT_MAX_STREAM_CHUNKS);
}

/// Finite, non-restartable stream of tool output chunks
pub struct ToolOutputStream {
    tool: String,
    inner: BoxStream<'static, Result<Value, ToolError>>,
    limit: usize,
    produced: usize,
    done: bool,
}

impl ToolOutputStream {
    pub fn new(
        tool: impl Into<String>,
        inner: BoxStream<'static, Result<Value, ToolError>>,
    ) -> Self {
        Self {
            tool: tool.into(),
            inner,
            limit: max_stream_chunks(),
            produced: 0,
            done: false,
        }
    }

    /// Next chunk, or `None` once the stream is exhausted.
    ///
    /// After an error or the end of the stream every call returns `None`.
    pub async fn next(&mut self) -> Option<Result<Value, ToolError>> {
        if self.done {
            return None;
        }
        let item = match self.inner.next().await {
            Some(item) => item,
            None => {
                self.done = true;
                return None;
            }
        };
        self.produced += 1;
        if self.produced > self.limit {
            self.done = true;
            return Some(Err(ToolError::Failed(format!(
                "tool `{}` exceeded the maximum of {} streamed chunks",
                self.tool, self.limit
            ))));
        }
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }

    /// Chunks produced so far
    pub fn produced(&self) -> usize {
        self.produced
    }

    /// Drain the stream, reporting every chunk; the last one is the result
    pub async fn finish(
        mut self,
        mut on_chunk: impl FnMut(usize, &Value) + Send,
    ) -> Result<Value, ToolError> {
        let mut last = None;
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            on_chunk(self.produced - 1, &chunk);
            last = Some(chunk);
        }
        last.ok_or_else(|| ToolError::Failed(format!("tool `{}` streamed no output", self.tool)))
    }
}

impl std::fmt::Debug for ToolOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolOutputStream")
            .field("tool", &self.tool)
            .field("limit", &self.limit)
            .field("produced", &self.produced)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
