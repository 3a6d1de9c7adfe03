//! Audit logging: the in-process implementation of the audit emitter.
//!
//! Records every tool invocation event for monitoring and compliance and
//! forwards it to any configured sinks.

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

use tether_core::audit::{AuditEmitter, AuditEvent};
use tether_core::error::AuditError;

/// Trait for audit log sinks (where events are written).
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// In-memory audit logger that stores events in a vector.
/// Useful for testing and small deployments.
pub struct AuditLogger {
    entries: Mutex<Vec<AuditEvent>>,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entry_count", &self.count())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    /// Create a new audit logger with no sinks.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sinks: Vec::new(),
        }
    }

    /// Create a new audit logger with the given sinks.
    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sinks,
        }
    }

    /// Record an audit event.
    pub fn log(&self, event: AuditEvent) {
        for sink in &self.sinks {
            sink.record(&event);
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Get all recorded events, oldest first.
    pub fn entries(&self) -> Vec<AuditEvent> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events whose target id matches (e.g. one tool).
    pub fn entries_for_target(&self, target_id: &str) -> Vec<AuditEvent> {
        self.filtered(|e| e.target.id == target_id)
    }

    /// Events whose `success` metadata equals `success`.
    pub fn entries_by_outcome(&self, success: bool) -> Vec<AuditEvent> {
        self.filtered(|e| e.succeeded() == Some(success))
    }

    /// Events tagged with an episode id.
    pub fn entries_for_episode(&self, episode_id: &str) -> Vec<AuditEvent> {
        self.filtered(|e| {
            e.metadata
                .get("episode_id")
                .and_then(|v| v.as_str())
                .is_some_and(|id| id == episode_id)
        })
    }

    /// Clear all stored entries.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Count of stored entries.
    pub fn count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn filtered(&self, pred: impl Fn(&AuditEvent) -> bool) -> Vec<AuditEvent> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditEmitter for AuditLogger {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.log(event);
        Ok(())
    }
}

/// A tracing-based audit sink that logs entries via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            event_type = %event.event_type,
            actor = %event.actor.id,
            target = %event.target.id,
            success = ?event.succeeded(),
            metadata = %serde_json::Value::Object(event.metadata.clone()),
            "AUDIT"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tether_core::audit::{AuditActor, AuditTarget, TOOL_INVOCATION_EVENT};

    fn event(tool: &str, success: bool, episode: &str) -> AuditEvent {
        AuditEvent::new(
            TOOL_INVOCATION_EVENT,
            AuditActor {
                kind: "agent".into(),
                id: "agent-1".into(),
            },
            AuditTarget {
                kind: "tool".into(),
                id: tool.into(),
            },
        )
        .with("success", success)
        .with("episode_id", episode)
    }

    #[test]
    fn log_and_retrieve_entries() {
        let logger = AuditLogger::new();
        logger.log(event("memory:read", true, "ep-1"));
        logger.log(event("social:publish", false, "ep-1"));

        assert_eq!(logger.count(), 2);
        let entries = logger.entries();
        assert_eq!(entries[0].target.id, "memory:read");
        assert_eq!(entries[1].target.id, "social:publish");
    }

    #[test]
    fn filter_by_outcome_target_and_episode() {
        let logger = AuditLogger::new();
        logger.log(event("memory:read", true, "ep-1"));
        logger.log(event("social:publish", false, "ep-1"));
        logger.log(event("memory:read", true, "ep-2"));

        assert_eq!(logger.entries_by_outcome(true).len(), 2);
        assert_eq!(logger.entries_by_outcome(false).len(), 1);
        assert_eq!(logger.entries_for_target("memory:read").len(), 2);
        assert_eq!(logger.entries_for_episode("ep-1").len(), 2);
    }

    #[test]
    fn clear_entries() {
        let logger = AuditLogger::new();
        logger.log(event("memory:read", true, "ep-1"));
        assert_eq!(logger.count(), 1);
        logger.clear();
        assert_eq!(logger.count(), 0);
    }

    #[tokio::test]
    async fn emitter_impl_stores_event() {
        let logger = Arc::new(AuditLogger::new());
        let emitter: Arc<dyn AuditEmitter> = logger.clone();
        emitter.emit(event("memory:read", true, "ep-1")).await.unwrap();
        assert_eq!(logger.count(), 1);
    }

    #[test]
    fn custom_sink_receives_events() {
        struct TestSink {
            received: Arc<Mutex<Vec<String>>>,
        }

        impl AuditSink for TestSink {
            fn record(&self, event: &AuditEvent) {
                self.received.lock().unwrap().push(event.target.id.clone());
            }
        }

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = TestSink {
            received: received.clone(),
        };
        let logger = AuditLogger::with_sinks(vec![Box::new(sink), Box::new(TracingSink)]);

        logger.log(event("memory:read", true, "ep-1"));

        let sink_entries = received.lock().unwrap();
        assert_eq!(sink_entries.len(), 1);
        assert_eq!(sink_entries[0], "memory:read");
    }

    #[test]
    fn debug_format() {
        let logger = AuditLogger::new();
        let debug_str = format!("{logger:?}");
        assert!(debug_str.contains("AuditLogger"));
        assert!(debug_str.contains("entry_count"));
    }
}
