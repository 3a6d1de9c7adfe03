//! Error types for the tether domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! These are *configuration and programmer* errors plus collaborator
//! failures. Operational tool failures (invalid input, policy denial,
//! budget exhaustion, timeouts, handler errors) are never represented
//! here: they travel inside a [`crate::tool::ToolResult`].

use thiserror::Error;

use crate::budget::BudgetDimension;
use crate::episode::EpisodeStatus;

/// The top-level error type for all tether operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Tool registry / handler wiring ---
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    // --- Episode lifecycle ---
    #[error("Episode error: {0}")]
    Episode(#[from] EpisodeError),

    // --- Recursion ---
    #[error("Recursion error: {0}")]
    Recursion(#[from] RecursionError),

    // --- Checkpoints ---
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("No handler registered for tool: {0}")]
    NoHandler(String),
}

impl RegistryError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            Self::UnknownTool(_) => "UNKNOWN_TOOL",
            Self::NoHandler(_) => "NO_HANDLER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EpisodeError {
    #[error("Episode {episode_id} is terminal ({status})")]
    Terminal {
        episode_id: String,
        status: EpisodeStatus,
    },

    #[error("Invalid transition for episode {episode_id}: {from} -> {to}")]
    InvalidTransition {
        episode_id: String,
        from: String,
        to: String,
    },

    #[error("Budget exhausted for episode {episode_id} ({dimension})")]
    BudgetExhausted {
        episode_id: String,
        dimension: BudgetDimension,
    },
}

impl EpisodeError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Terminal { .. } => "EPISODE_TERMINAL",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::BudgetExhausted { .. } => "BUDGET_EXCEEDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecursionError {
    #[error("Recursion depth exceeded: child depth {requested} > max {max}")]
    DepthExceeded { requested: u32, max: u32 },

    #[error("Child limit reached: {spawned} of {max} children already spawned")]
    TooManyChildren { spawned: u32, max: u32 },

    #[error("Episode chain limit reached: {total} of {max} episodes")]
    TooManyEpisodes { total: u32, max: u32 },

    #[error("Child type not allowed: {0}")]
    ChildTypeNotAllowed(String),

    #[error("Child type forbidden: {0}")]
    ChildTypeForbidden(String),

    #[error("Child budget below minimum viable floor for {dimension}: {available} < {floor}")]
    BudgetBelowFloor {
        dimension: BudgetDimension,
        available: u64,
        floor: u64,
    },

    #[error("Subcall budget exhausted: {used} of {max}")]
    SubcallsExhausted { used: u64, max: u64 },

    #[error("Side effect already caused on '{target}'; only a verification child may follow")]
    DuplicateSideEffect { target: String },

    #[error("Recursion stopped: {0}")]
    Stopped(String),

    #[error("Child policy loosens parent policy: {0}")]
    LoosenedPolicy(String),

    #[error("Invalid recursion policy: {0}")]
    InvalidPolicy(String),

    #[error("Parent episode is not running ({0})")]
    ParentNotRunning(EpisodeStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Checkpoint storage failed: {0}")]
    Storage(String),

    #[error("Cannot checkpoint while {0} tool call(s) are in flight")]
    InFlight(usize),

    #[error("Episode {episode_id} is not resumable ({status})")]
    NotResumable {
        episode_id: String,
        status: EpisodeStatus,
    },

    #[error("Checkpoint digest mismatch for {0}")]
    DigestMismatch(String),
}

#[derive(Debug, Clone, Error)]
pub enum PolicyError {
    #[error("Policy engine unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed policy response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("Audit event rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_error_displays_correctly() {
        let err = Error::Registry(RegistryError::AlreadyRegistered("memory:read".into()));
        assert!(err.to_string().contains("memory:read"));
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn episode_terminal_has_stable_code() {
        let err = EpisodeError::Terminal {
            episode_id: "ep-1".into(),
            status: EpisodeStatus::Completed,
        };
        assert_eq!(err.code(), "EPISODE_TERMINAL");
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn registry_codes() {
        assert_eq!(RegistryError::UnknownTool("x".into()).code(), "UNKNOWN_TOOL");
        assert_eq!(RegistryError::NoHandler("x".into()).code(), "NO_HANDLER");
    }

    #[test]
    fn floor_error_names_dimension() {
        let err = RecursionError::BudgetBelowFloor {
            dimension: BudgetDimension::Tokens,
            available: 10,
            floor: 100,
        };
        assert!(err.to_string().contains("tokens"));
    }
}
