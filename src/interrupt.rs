//! Execution interrupts
//!
//! Interrupts attached to a conversation are polled before every step
//! invocation and every LLM call. A triggered interrupt stops execution with
//! [`ExecutionStatus::Interrupted`](crate::status::ExecutionStatus::Interrupted)
//! and leaves the conversation resumable.

use crate::llm::TokenUsage;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What an interrupt can observe about the running conversation
#[derive(Debug, Clone, Copy)]
pub struct InterruptContext<'a> {
    pub conversation_id: &'a str,
    /// Token usage of the whole conversation tree so far
    pub token_usage: TokenUsage,
}

pub trait ExecutionInterrupt: Send + Sync {
    /// Reason to stop, or `None` to keep going
    fn check(&self, ctx: &InterruptContext<'_>) -> Option<String>;
}

/// Fires once the given duration has elapsed since creation
#[derive(Debug)]
pub struct SoftTimeoutInterrupt {
    armed_at: Instant,
    timeout: Duration,
}

impl SoftTimeoutInterrupt {
    pub fn new(timeout: Duration) -> Self {
        Self {
            armed_at: Instant::now(),
            timeout,
        }
    }
}

impl ExecutionInterrupt for SoftTimeoutInterrupt {
    fn check(&self, _ctx: &InterruptContext<'_>) -> Option<String> {
        let elapsed = self.armed_at.elapsed();
        (elapsed >= self.timeout).then(|| {
            format!(
                "soft timeout of {}ms reached after {}ms",
                self.timeout.as_millis(),
                elapsed.as_millis()
            )
        })
    }
}

/// Fires once the conversation has used at least `limit` tokens
#[derive(Debug)]
pub struct SoftTokenLimitInterrupt {
    limit: u64,
}

impl SoftTokenLimitInterrupt {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl ExecutionInterrupt for SoftTokenLimitInterrupt {
    fn check(&self, ctx: &InterruptContext<'_>) -> Option<String> {
        let used = ctx.token_usage.total();
        (used >= self.limit).then(|| format!("token limit of {} reached ({used} used)", self.limit))
    }
}

/// Fires once its token is cancelled
#[derive(Debug, Clone, Default)]
pub struct CancellationInterrupt {
    token: CancellationToken,
}

impl CancellationInterrupt {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl ExecutionInterrupt for CancellationInterrupt {
    fn check(&self, _ctx: &InterruptContext<'_>) -> Option<String> {
        self.token.is_cancelled().then(|| "execution cancelled".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tokens: u64) -> InterruptContext<'static> {
        InterruptContext {
            conversation_id: "c1",
            token_usage: TokenUsage {
                input_tokens: tokens,
                output_tokens: 0,
            },
        }
    }

    #[test]
    fn test_token_limit() {
        let interrupt = SoftTokenLimitInterrupt::new(100);
        assert!(interrupt.check(&ctx(99)).is_none());
        assert!(interrupt.check(&ctx(100)).unwrap().contains("token limit"));
    }

    #[test]
    fn test_timeout() {
        assert!(SoftTimeoutInterrupt::new(Duration::ZERO).check(&ctx(0)).is_some());
        assert!(SoftTimeoutInterrupt::new(Duration::from_secs(3600)).check(&ctx(0)).is_none());
    }

    #[test]
    fn test_cancellation() {
        let interrupt = CancellationInterrupt::default();
        assert!(interrupt.check(&ctx(0)).is_none());
        interrupt.token().cancel();
        assert_eq!(interrupt.check(&ctx(0)).as_deref(), Some("execution cancelled"));
    }
}
