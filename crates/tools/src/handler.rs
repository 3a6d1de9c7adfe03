//! Tool handler contract.
//!
//! A handler does the actual work behind a tool id. It is registered on a
//! [`ToolWrapper`](crate::ToolWrapper) and only ever called by the wrapper,
//! after validation, policy and budget checks have passed.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tether_core::tool::ToolDefinition;

/// What a handler sees about the call it is serving.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub definition: Arc<ToolDefinition>,
    /// Shared by every attempt of one invocation.
    pub invocation_id: String,
    pub episode_id: String,
    pub client_id: String,
    pub agent_id: String,
    pub request_id: Option<String>,
    /// 0 for the first attempt, incremented per retry.
    pub attempt: u32,
    /// Cancelled on timeout or when the owning episode is cancelled.
    /// Handlers doing long I/O should select on it.
    pub cancel: CancellationToken,
}

/// Successful handler output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub value: Value,
    /// Actual tokens consumed, when the handler knows (e.g. from an LLM
    /// response). Falls back to the tool's estimate when absent.
    pub tokens_used: Option<u64>,
}

impl ToolOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            tokens_used: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// A failed attempt. `code` is matched against the tool's retryable errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// An error with no meaningful code. Never retryable unless a policy
    /// lists `HANDLER_ERROR`.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new("HANDLER_ERROR", message)
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: Value, ctx: HandlerContext) -> Result<ToolOutput, HandlerError>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure as a handler.
///
/// ```ignore
/// wrapper.register_handler("memory:read", handler_fn(|input, _ctx| async move {
///     Ok(ToolOutput::new(json!({ "echo": input })))
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput, HandlerError>> + Send + 'static,
{
    async fn call(&self, input: Value, ctx: HandlerContext) -> Result<ToolOutput, HandlerError> {
        (self.0)(input, ctx).await
    }
}
