//! Domain event system: lifecycle notifications decoupled from consumers.
//!
//! Events are published when an episode changes state or a tool call
//! finishes. Subscribers (CLI output, metrics, tests) react without the
//! runtime knowing about them. Events are informational; the audit
//! emitter remains the system of record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::budget::BudgetDimension;
use crate::episode::{EpisodeStatus, Phase};

/// All domain events in the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// An episode moved from pending to running
    EpisodeStarted {
        episode_id: String,
        client_id: String,
        depth: u32,
        timestamp: DateTime<Utc>,
    },

    /// An episode entered a new phase
    PhaseAdvanced {
        episode_id: String,
        from: Phase,
        to: Phase,
        timestamp: DateTime<Utc>,
    },

    /// A tool invocation finished (success or failure)
    ToolInvoked {
        episode_id: String,
        tool_id: String,
        success: bool,
        error_code: Option<String>,
        retry_count: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A budget dimension crossed the advisory threshold
    BudgetAdvisory {
        episode_id: String,
        dimension: BudgetDimension,
        ratio: f64,
        timestamp: DateTime<Utc>,
    },

    /// A child episode was spawned
    ChildSpawned {
        parent_episode_id: String,
        child_episode_id: String,
        child_type: String,
        depth: u32,
        timestamp: DateTime<Utc>,
    },

    /// A checkpoint was persisted
    CheckpointSaved {
        episode_id: String,
        checkpoint_id: String,
        phase: Phase,
        timestamp: DateTime<Utc>,
    },

    /// An episode reached a terminal status
    EpisodeTerminated {
        episode_id: String,
        status: EpisodeStatus,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Slow subscribers lag and lose events; publishers never block.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
