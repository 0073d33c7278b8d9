//! Execution events and scoped listeners

use crate::llm::TokenUsage;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Something observable happened during execution
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ExecutionStarted {
        conversation_id: String,
        component: String,
    },
    ExecutionFinished {
        conversation_id: String,
        component: String,
        status: &'static str,
    },
    StepStarted {
        conversation_id: String,
        step: String,
    },
    StepFinished {
        conversation_id: String,
        step: String,
        /// `None` when the step yielded
        branch: Option<String>,
    },
    LlmRequest {
        conversation_id: String,
        model: String,
        messages: usize,
    },
    LlmResponse {
        conversation_id: String,
        model: String,
        usage: TokenUsage,
    },
    ToolStarted {
        request_id: String,
        tool: String,
    },
    ToolFinished {
        request_id: String,
        tool: String,
        is_error: bool,
    },
    ToolStreamChunk {
        tool: String,
        index: usize,
        chunk: Value,
    },
}

impl Event {
    /// Conversation the event belongs to, when it carries one
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Event::ExecutionStarted { conversation_id, .. }
            | Event::ExecutionFinished { conversation_id, .. }
            | Event::StepStarted { conversation_id, .. }
            | Event::StepFinished { conversation_id, .. }
            | Event::LlmRequest { conversation_id, .. }
            | Event::LlmResponse { conversation_id, .. } => Some(conversation_id),
            Event::ToolStarted { .. }
            | Event::ToolFinished { .. }
            | Event::ToolStreamChunk { .. } => None,
        }
    }
}

/// Receives every emitted event while registered
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(1);
type Registry = Vec<(u64, Arc<dyn EventListener>)>;

static LISTENERS: RwLock<Registry> = parking_lot::const_rwlock(Vec::new());

/// Deregisters its listeners when dropped
#[must_use = "listeners are removed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ListenerGuard {
    registration: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        LISTENERS.write().retain(|(id, _)| *id != self.registration);
    }
}

/// Register listeners until the returned guard goes out of scope
pub fn register_event_listeners(listeners: Vec<Arc<dyn EventListener>>) -> ListenerGuard {
    let registration = NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed);
    let mut registry = LISTENERS.write();
    registry.extend(listeners.into_iter().map(|l| (registration, l)));
    ListenerGuard { registration }
}

pub(crate) fn emit(event: Event) {
    let listeners: Vec<Arc<dyn EventListener>> = {
        let registry = LISTENERS.read();
        if registry.is_empty() {
            return;
        }
        registry.iter().map(|(_, l)| Arc::clone(l)).collect()
    };
    for listener in listeners {
        listener.on_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(tag: &'static str) -> (Arc<Mutex<Vec<String>>>, Arc<dyn EventListener>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = move |event: &Event| {
            if let Event::StepStarted { conversation_id, step } = event {
                if conversation_id == tag {
                    sink.lock().push(step.clone());
                }
            }
        };
        (seen, Arc::new(listener))
    }

    fn step_started(tag: &str, step: &str) -> Event {
        Event::StepStarted {
            conversation_id: tag.to_string(),
            step: step.to_string(),
        }
    }

    #[test]
    fn test_guard_removes_listener_on_drop() {
        let (seen, listener) = recorder("guard-test");
        {
            let _guard = register_event_listeners(vec![listener]);
            emit(step_started("guard-test", "a"));
        }
        emit(step_started("guard-test", "b"));
        assert_eq!(*seen.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_guard_removed_on_early_return() {
        fn run(listener: Arc<dyn EventListener>) -> Result<(), &'static str> {
            let _guard = register_event_listeners(vec![listener]);
            emit(step_started("early-return", "inside"));
            Err("bail")
        }
        let (seen, listener) = recorder("early-return");
        assert!(run(listener).is_err());
        emit(step_started("early-return", "outside"));
        assert_eq!(*seen.lock(), vec!["inside".to_string()]);
    }

    #[test]
    fn test_nested_registrations_are_independent() {
        let (outer_seen, outer) = recorder("nested");
        let (inner_seen, inner) = recorder("nested");
        let _outer = register_event_listeners(vec![outer]);
        {
            let _inner = register_event_listeners(vec![inner]);
            emit(step_started("nested", "both"));
        }
        emit(step_started("nested", "outer-only"));
        assert_eq!(outer_seen.lock().len(), 2);
        assert_eq!(*inner_seen.lock(), vec!["both".to_string()]);
    }
}
