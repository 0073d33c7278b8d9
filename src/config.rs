//! Engine configuration from the environment

use crate::error::Result;
use crate::pool;
use crate::tool::stream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_LOG_FILTER: &str = "flowloom=info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Workers of the process-wide pool; no pool when unset
    pub worker_pool_size: Option<usize>,
    /// Overrides the stream chunk bound when set
    pub max_stream_chunks: Option<usize>,
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: None,
            max_stream_chunks: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable numbers are ignored with a
    /// warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| {
            let raw = lookup(key)?;
            match raw.trim().parse::<usize>() {
                Ok(n) => Some(n),
                Err(e) => {
                    tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid setting");
                    None
                }
            }
        };
        let log_format = match lookup("FLOWLOOM_LOG_FORMAT").as_deref().map(str::trim) {
            Some(f) if f.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        Self {
            worker_pool_size: number("FLOWLOOM_WORKER_POOL_SIZE"),
            max_stream_chunks: number("FLOWLOOM_MAX_STREAM_CHUNKS"),
            log_filter: lookup("FLOWLOOM_LOG")
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            log_format,
        }
    }

    /// Initialise the worker pool and the stream chunk bound
    pub fn apply(&self) -> Result<()> {
        if let Some(limit) = self.max_stream_chunks {
            stream::set_max_stream_chunks(limit);
        }
        if let Some(size) = self.worker_pool_size {
            pool::init_worker_pool(size)?;
        }
        Ok(())
    }

    /// Install the global tracing subscriber
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.log_filter)
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
        let registry = tracing_subscriber::registry().with(filter);
        match self.log_format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_span_list(false),
                )
                .init(),
            LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
        }
    }
}
