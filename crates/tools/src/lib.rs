//! The tool invocation pipeline for tether episodes.
//!
//! [`ToolWrapper`] owns the handler table and mediates every tool call an
//! episode makes: schema validation, policy check, budget reservation,
//! timed and retried execution, audit emission and tracing.

pub mod handler;
pub mod limiter;
pub mod retry;
pub mod wrapper;

pub use handler::{FnHandler, HandlerContext, HandlerError, ToolHandler, ToolOutput, handler_fn};
pub use limiter::ClientLimiter;
pub use retry::{next_delay, should_retry};
pub use wrapper::{DEFAULT_TOOL_TIMEOUT_MS, Invoked, ToolWrapper};
