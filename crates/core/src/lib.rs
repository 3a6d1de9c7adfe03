//! # Tether Core
//!
//! Domain types, traits, and error definitions for the tether episode
//! runtime. This crate has no runtime machinery of its own: it defines the
//! model (episodes, budgets, tools, checkpoints) and the collaborator
//! contracts (policy engine, audit emitter, checkpoint store) that the
//! other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod audit;
pub mod budget;
pub mod checkpoint;
pub mod episode;
pub mod error;
pub mod event;
pub mod policy;
pub mod schema;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use audit::{AuditActor, AuditEmitter, AuditEvent, AuditTarget};
pub use budget::{Budget, BudgetDimension, BudgetSnapshot, Counter, TimeBudget, TimeUsage};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use episode::{
    Episode, EpisodeId, EpisodeStatus, EscalationTicket, FailureSummary, Phase, PhaseOutputs,
    RecursionPolicy, SideEffectRecord, StopCondition, TerminalSummary,
};
pub use error::{
    AuditError, CheckpointError, EpisodeError, Error, PolicyError, RecursionError, RegistryError,
    Result,
};
pub use event::{DomainEvent, EventBus};
pub use policy::{PolicyDecision, PolicyEngine, PolicyRequest, PolicyResponse};
pub use schema::{ObjectSchema, ValueKind};
pub use tool::{
    InvocationContext, InvocationOptions, RetryPolicy, RiskLevel, ToolCategory, ToolDefinition,
    ToolErrorCode, ToolFailure, ToolInvocation, ToolRegistry, ToolResult, ToolResultMetadata,
};
