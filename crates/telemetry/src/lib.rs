//! Budget enforcement and execution tracing for tether episodes.
//!
//! Provides the per-episode budget guard (atomic reserve/reconcile of
//! tokens, tool calls and time, child budget allocation, wrap-up
//! advisories) and span-based tracing of every tool invocation and phase.

pub mod guard;
pub mod model;
pub mod recorder;

#[cfg(test)]
mod proptest_guard;

pub use guard::{
    BudgetAdvisory, BudgetDenial, BudgetFloor, BudgetGuard, Guarded, Reservation,
    DEFAULT_ADVISORY_THRESHOLD, MAX_CHILD_FRACTION,
};
pub use model::{Span, SpanKind, Trace, TraceSummary};
pub use recorder::TraceRecorder;
