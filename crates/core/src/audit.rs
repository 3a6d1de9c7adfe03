//! Audit emitter contract: an external append-only sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuditError;

/// Event type emitted once per tool invocation (retries included).
pub const TOOL_INVOCATION_EVENT: &str = "tool.invocation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditActor {
    /// `agent`, `user`, `system`.
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTarget {
    /// `tool`, `episode`, ...
    pub kind: String,
    pub id: String,
}

/// One record handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: AuditActor,
    pub target: AuditTarget,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, actor: AuditActor, target: AuditTarget) -> Self {
        Self {
            event_type: event_type.into(),
            actor,
            target,
            metadata: serde_json::Map::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Convenience accessor for the `success` metadata flag.
    pub fn succeeded(&self) -> Option<bool> {
        self.metadata.get("success").and_then(|v| v.as_bool())
    }
}

/// Where audit records go.
///
/// The pipeline awaits `emit` before acknowledging a result, but an `Err`
/// never fails the tool invocation; it is logged and dropped.
#[async_trait]
pub trait AuditEmitter: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError>;
}
