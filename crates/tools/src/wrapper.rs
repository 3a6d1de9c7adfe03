//! The tool invocation pipeline.
//!
//! Every external effect an episode can cause passes through
//! [`ToolWrapper::invoke`], in this order:
//!
//! 1. resolve the definition (unknown tool is an `Err`)
//! 2. validate input against the definition's schema
//! 3. ask the policy engine, unless the call opts out
//! 4. resolve the handler (missing handler is an `Err`)
//! 5. reserve budget, then race the handler's retry loop against a timeout
//! 6. emit exactly one audit event and record one trace span
//!
//! Operational failures never surface as `Err`: they are packaged into a
//! [`ToolResult`] with a stable [`ToolErrorCode`].

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use tether_core::audit::{
    AuditActor, AuditEmitter, AuditEvent, AuditTarget, TOOL_INVOCATION_EVENT,
};
use tether_core::error::RegistryError;
use tether_core::policy::{ActorType, PolicyEngine, PolicyRequest, TOOL_INVOKE_ACTION};
use tether_core::schema::SchemaViolation;
use tether_core::tool::{
    ToolDefinition, ToolErrorCode, ToolFailure, ToolInvocation, ToolRegistry, ToolResult,
    ToolResultMetadata,
};
use tether_telemetry::{BudgetAdvisory, BudgetGuard, Guarded, Span, SpanKind, TraceRecorder};

use crate::handler::{HandlerContext, ToolHandler};
use crate::limiter::ClientLimiter;
use crate::retry::{next_delay, should_retry};

/// Timeout used when neither the call nor the tool sets one.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

/// Stand-in deadline for timeouts too large to represent.
const FAR_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// A pipeline result plus the budget advisories its charge raised.
pub type Invoked = Guarded<ToolResult>;

/// What the guarded section produced, before packaging.
struct Execution {
    outcome: Result<(Value, Option<u64>), ToolFailure>,
    retry_count: u32,
}

impl Execution {
    fn failed(failure: ToolFailure) -> Self {
        Self {
            outcome: Err(failure),
            retry_count: 0,
        }
    }
}

/// Owns the handler table and the collaborators every invocation needs.
///
/// Construct one per process and share it by `Arc`. Tests build isolated
/// instances with their own stubs.
pub struct ToolWrapper {
    registry: Arc<ToolRegistry>,
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
    policy: Arc<dyn PolicyEngine>,
    audit: Arc<dyn AuditEmitter>,
    limiter: ClientLimiter,
    recorder: Option<Arc<TraceRecorder>>,
    default_timeout_ms: u64,
}

impl std::fmt::Debug for ToolWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolWrapper")
            .field("tools", &self.registry.len())
            .field("handlers", &self.handler_ids())
            .field("default_timeout_ms", &self.default_timeout_ms)
            .finish()
    }
}

impl ToolWrapper {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: Arc<dyn PolicyEngine>,
        audit: Arc<dyn AuditEmitter>,
    ) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
            policy,
            audit,
            limiter: ClientLimiter::default(),
            recorder: None,
            default_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
        }
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_concurrent_per_client(mut self, permits: usize) -> Self {
        self.limiter = ClientLimiter::new(permits);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<TraceRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> Option<&Arc<TraceRecorder>> {
        self.recorder.as_ref()
    }

    pub fn limiter(&self) -> &ClientLimiter {
        &self.limiter
    }

    // ── Handlers ──────────────────────────────────────────────────────

    /// Attach a handler to a registered tool, replacing any previous one.
    pub fn register_handler(
        &self,
        tool_id: &str,
        handler: impl ToolHandler + 'static,
    ) -> Result<(), RegistryError> {
        self.register_shared_handler(tool_id, Arc::new(handler))
    }

    pub fn register_shared_handler(
        &self,
        tool_id: &str,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.registry.get(tool_id).is_none() {
            return Err(RegistryError::UnknownTool(tool_id.to_string()));
        }
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tool_id.to_string(), handler);
        if previous.is_some() {
            debug!(tool_id, "Replaced tool handler");
        }
        Ok(())
    }

    /// Returns whether a handler was removed.
    pub fn unregister_handler(&self, tool_id: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tool_id)
            .is_some()
    }

    pub fn has_handler(&self, tool_id: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tool_id)
    }

    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn handler(&self, tool_id: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool_id)
            .cloned()
    }

    // ── Invocation ────────────────────────────────────────────────────

    /// Run one invocation with no outside cancellation.
    pub async fn invoke(
        &self,
        invocation: ToolInvocation,
        guard: &BudgetGuard,
    ) -> Result<ToolResult, RegistryError> {
        self.invoke_with_cancel(invocation, guard, &CancellationToken::new())
            .await
            .map(|invoked| invoked.value)
    }

    /// Run one invocation. Handlers receive a child of `cancel`, so
    /// cancelling it reaches cooperating handlers and stops further
    /// retries. A call already in its handler is not aborted by it.
    pub async fn invoke_with_cancel(
        &self,
        invocation: ToolInvocation,
        guard: &BudgetGuard,
        cancel: &CancellationToken,
    ) -> Result<Invoked, RegistryError> {
        let definition = self
            .registry
            .get(&invocation.tool_id)
            .ok_or_else(|| RegistryError::UnknownTool(invocation.tool_id.clone()))?;
        if definition.deprecated {
            warn!(tool_id = %definition.id, "Invoking deprecated tool");
        }

        let invocation_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "tool_invocation",
            tool_id = %definition.id,
            invocation_id = %invocation_id,
            episode_id = %invocation.context.episode_id,
            client_id = %invocation.context.client_id,
            status = tracing::field::Empty,
        );

        let started_at = Utc::now();
        let clock = Instant::now();

        let (execution, advisories) = self
            .execute(&definition, &invocation, &invocation_id, guard, cancel)
            .instrument(span.clone())
            .await?;

        let result = package(&definition, &invocation_id, started_at, clock, execution);

        async {
            match &result.error {
                None => {
                    tracing::Span::current().record("status", "ok");
                    debug!(
                        duration_ms = result.metadata.duration_ms,
                        retry_count = result.metadata.retry_count,
                        "Tool invocation succeeded"
                    );
                }
                Some(err) => {
                    tracing::Span::current().record("status", "error");
                    info!(
                        code = %err.code,
                        message = %err.message,
                        retry_count = result.metadata.retry_count,
                        "Tool invocation failed"
                    );
                }
            }
            self.emit_audit(&definition, &invocation, &result).await;
        }
        .instrument(span)
        .await;

        self.record_span(&definition, &invocation, started_at, &result);

        Ok(Guarded {
            value: result,
            advisories,
        })
    }

    async fn execute(
        &self,
        definition: &Arc<ToolDefinition>,
        invocation: &ToolInvocation,
        invocation_id: &str,
        guard: &BudgetGuard,
        cancel: &CancellationToken,
    ) -> Result<(Execution, Vec<BudgetAdvisory>), RegistryError> {
        if let Err(violations) = definition.input_schema.validate(&invocation.input) {
            debug!(violations = violations.len(), "Tool input rejected");
            let failure = ToolFailure::new(
                ToolErrorCode::InvalidInput,
                format!("Invalid input: {}", join_violations(&violations)),
            )
            .with_details(json!({ "violations": violations }));
            return Ok((Execution::failed(failure), Vec::new()));
        }

        if invocation.options.skip_policy_check {
            debug!("Policy check skipped by caller");
        } else if let Some(failure) = self.check_policy(definition, invocation).await {
            return Ok((Execution::failed(failure), Vec::new()));
        }

        let handler = self
            .handler(&definition.id)
            .ok_or_else(|| RegistryError::NoHandler(definition.id.clone()))?;

        // The deadline starts now, so time spent queued for a client slot
        // counts against the invocation's timeout.
        let timeout_ms = self.timeout_ms_for(definition, invocation);
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(Duration::from_millis(timeout_ms))
            .unwrap_or_else(|| now + FAR_DEADLINE);

        let _permit = tokio::select! {
            biased;
            acquired = self.limiter.acquire(&invocation.context.client_id) => match acquired {
                Ok(permit) => permit,
                Err(e) => {
                    let failure = ToolFailure::new(
                        ToolErrorCode::InternalError,
                        format!("Concurrency limiter unavailable: {e}"),
                    )
                    .with_details(json!({ "queued": true }));
                    return Ok((Execution::failed(failure), Vec::new()));
                }
            },
            _ = cancel.cancelled() => {
                debug!("Cancelled while waiting for a client slot");
                let failure = ToolFailure::new(
                    ToolErrorCode::ExecutionError,
                    "Cancelled while waiting for a client slot",
                )
                .with_handler_code("CANCELLED")
                .with_details(json!({ "queued": true }));
                return Ok((Execution::failed(failure), Vec::new()));
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(timeout_ms, "Tool invocation timed out waiting for a client slot");
                let failure = ToolFailure::new(
                    ToolErrorCode::Timeout,
                    format!("Tool timed out after {timeout_ms}ms waiting for a client slot"),
                )
                .with_details(json!({ "timeoutMs": timeout_ms, "queued": true }));
                return Ok((Execution::failed(failure), Vec::new()));
            }
        };

        let guarded = guard
            .guard_tool_call(definition, |remaining_ms| async move {
                let left_ms = u64::try_from(
                    deadline
                        .saturating_duration_since(tokio::time::Instant::now())
                        .as_millis(),
                )
                .unwrap_or(u64::MAX);
                let effective_ms = left_ms.min(remaining_ms);
                let token = cancel.child_token();
                let retries = AtomicU32::new(0);

                let raced = tokio::time::timeout(
                    Duration::from_millis(effective_ms),
                    self.run_attempts(handler, definition, invocation, invocation_id, &token, &retries),
                )
                .await;
                let retry_count = retries.load(Ordering::SeqCst);

                match raced {
                    Ok(Ok((value, tokens))) => (
                        Execution {
                            outcome: Ok((value, tokens)),
                            retry_count,
                        },
                        tokens,
                    ),
                    Ok(Err(failure)) => (
                        Execution {
                            outcome: Err(failure),
                            retry_count,
                        },
                        None,
                    ),
                    Err(_) => {
                        token.cancel();
                        warn!(timeout_ms = effective_ms, retry_count, "Tool invocation timed out");
                        let failure = ToolFailure::new(
                            ToolErrorCode::Timeout,
                            format!("Tool timed out after {effective_ms}ms"),
                        )
                        .with_details(json!({ "timeoutMs": effective_ms }));
                        (
                            Execution {
                                outcome: Err(failure),
                                retry_count,
                            },
                            None,
                        )
                    }
                }
            })
            .await;

        match guarded {
            Ok(Guarded { value, advisories }) => Ok((value, advisories)),
            Err(denial) => {
                let failure = ToolFailure::new(ToolErrorCode::BudgetExceeded, denial.to_string())
                    .with_details(json!({
                        "dimension": denial.dimension,
                        "used": denial.used,
                        "requested": denial.requested,
                        "max": denial.max,
                    }));
                Ok((Execution::failed(failure), Vec::new()))
            }
        }
    }

    fn timeout_ms_for(&self, definition: &ToolDefinition, invocation: &ToolInvocation) -> u64 {
        invocation
            .options
            .timeout_ms
            .or(definition.budget_cost.default_time_ms)
            .unwrap_or(self.default_timeout_ms)
    }

    async fn check_policy(
        &self,
        definition: &ToolDefinition,
        invocation: &ToolInvocation,
    ) -> Option<ToolFailure> {
        let request = PolicyRequest {
            action: TOOL_INVOKE_ACTION.to_string(),
            resource: definition.id.clone(),
            client_id: invocation.context.client_id.clone(),
            actor_type: ActorType::Agent,
            actor_id: invocation.context.agent_id.clone(),
            attributes: json!({
                "category": definition.category,
                "riskLevel": definition.risk_level,
                "input": invocation.input,
            }),
            request_id: invocation.context.request_id.clone(),
            episode_id: Some(invocation.context.episode_id.clone()),
        };

        match self.policy.evaluate(request).await {
            Ok(response) if response.decision.is_allow() => None,
            Ok(response) => {
                info!(
                    reason = %response.decision.reason,
                    denied_by = ?response.decision.denied_by,
                    "Policy denied tool invocation"
                );
                Some(
                    ToolFailure::new(ToolErrorCode::PolicyDenied, response.decision.reason.clone())
                        .with_details(json!({
                            "deniedBy": response.decision.denied_by,
                            "checks": response.checks,
                        })),
                )
            }
            Err(e) => {
                warn!(error = %e, "Policy engine error, denying tool invocation");
                Some(
                    ToolFailure::new(ToolErrorCode::PolicyDenied, format!("Policy engine error: {e}"))
                        .with_details(json!({ "deniedBy": "policy_engine_error" })),
                )
            }
        }
    }

    /// The handler plus its retry loop. Runs inside the timeout race.
    async fn run_attempts(
        &self,
        handler: Arc<dyn ToolHandler>,
        definition: &Arc<ToolDefinition>,
        invocation: &ToolInvocation,
        invocation_id: &str,
        cancel: &CancellationToken,
        retries: &AtomicU32,
    ) -> Result<(Value, Option<u64>), ToolFailure> {
        let policy = definition.retry_policy.as_ref();

        loop {
            let attempt = retries.load(Ordering::SeqCst);
            let ctx = HandlerContext {
                definition: Arc::clone(definition),
                invocation_id: invocation_id.to_string(),
                episode_id: invocation.context.episode_id.clone(),
                client_id: invocation.context.client_id.clone(),
                agent_id: invocation.context.agent_id.clone(),
                request_id: invocation.context.request_id.clone(),
                attempt,
                cancel: cancel.clone(),
            };

            let error = match AssertUnwindSafe(handler.call(invocation.input.clone(), ctx))
                .catch_unwind()
                .await
            {
                Ok(Ok(output)) => {
                    if let Some(schema) = &definition.output_schema {
                        if let Err(violations) = schema.validate(&output.value) {
                            return Err(ToolFailure::new(
                                ToolErrorCode::ExecutionError,
                                format!("Output failed schema: {}", join_violations(&violations)),
                            )
                            .with_handler_code("INVALID_OUTPUT"));
                        }
                    }
                    return Ok((output.value, output.tokens_used));
                }
                Ok(Err(error)) => error,
                Err(panic) => {
                    let message = panic_message(&*panic);
                    warn!(attempt, %message, "Tool handler panicked");
                    return Err(ToolFailure::new(
                        ToolErrorCode::InternalError,
                        format!("Handler panicked: {message}"),
                    ));
                }
            };

            if cancel.is_cancelled() || !should_retry(policy, &error.code, attempt) {
                return Err(ToolFailure::new(ToolErrorCode::ExecutionError, error.message)
                    .with_handler_code(error.code));
            }

            let delay = policy.map(|p| next_delay(attempt, p)).unwrap_or_default();
            info!(
                attempt = attempt + 1,
                code = %error.code,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying tool handler"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ToolFailure::new(
                        ToolErrorCode::ExecutionError,
                        format!("Cancelled before retry: {}", error.message),
                    )
                    .with_handler_code(error.code));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            retries.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ── Audit & trace ─────────────────────────────────────────────────

    async fn emit_audit(
        &self,
        definition: &ToolDefinition,
        invocation: &ToolInvocation,
        result: &ToolResult,
    ) {
        let meta = &result.metadata;
        let mut event = AuditEvent::new(
            TOOL_INVOCATION_EVENT,
            AuditActor {
                kind: "agent".into(),
                id: invocation.context.agent_id.clone(),
            },
            AuditTarget {
                kind: "tool".into(),
                id: definition.id.clone(),
            },
        )
        .with("invocation_id", meta.invocation_id.clone())
        .with("episode_id", invocation.context.episode_id.clone())
        .with("client_id", invocation.context.client_id.clone())
        .with("success", result.success)
        .with("duration_ms", meta.duration_ms)
        .with("retry_count", meta.retry_count)
        .with("category", definition.category.to_string())
        .with("risk_level", definition.risk_level.to_string());

        if let Some(request_id) = &invocation.context.request_id {
            event = event.with("request_id", request_id.clone());
        }
        if let Some(tokens) = meta.tokens_used {
            event = event.with("tokens_used", tokens);
        }
        if let Some(err) = &result.error {
            event = event
                .with("error_code", err.code.as_str())
                .with("error_message", err.message.clone());
            if let Some(code) = &err.handler_code {
                event = event.with("handler_code", code.clone());
            }
        }

        if let Err(e) = self.audit.emit(event).await {
            warn!(error = %e, "Audit emission failed; tool result unaffected");
        }
    }

    fn record_span(
        &self,
        definition: &ToolDefinition,
        invocation: &ToolInvocation,
        started_at: DateTime<Utc>,
        result: &ToolResult,
    ) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let mut span = Span::new(SpanKind::ToolInvocation, definition.id.clone())
            .started(started_at)
            .with_meta("invocation_id", result.metadata.invocation_id.clone())
            .with_meta("client_id", invocation.context.client_id.clone());
        span.tokens_used = result.metadata.tokens_used;
        span.retry_count = result.metadata.retry_count;
        match &result.error {
            None => span.end(true),
            Some(err) => span.fail(err.code.as_str()),
        }
        recorder.record_span(&invocation.context.episode_id, span);
    }
}

fn package(
    definition: &ToolDefinition,
    invocation_id: &str,
    started_at: DateTime<Utc>,
    clock: Instant,
    execution: Execution,
) -> ToolResult {
    let (tokens_used, outcome) = match execution.outcome {
        Ok((value, tokens)) => (tokens, Ok(value)),
        Err(failure) => (None, Err(failure)),
    };
    let metadata = ToolResultMetadata {
        tool_id: definition.id.clone(),
        invocation_id: invocation_id.to_string(),
        started_at,
        completed_at: Utc::now(),
        duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        retry_count: execution.retry_count,
        tokens_used,
    };
    match outcome {
        Ok(value) => ToolResult::ok(value, metadata),
        Err(failure) => ToolResult::failed(failure, metadata),
    }
}

fn join_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, ToolOutput, handler_fn};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tether_core::budget::Budget;
    use tether_core::error::{AuditError, PolicyError};
    use tether_core::policy::PolicyResponse;
    use tether_core::schema::{ObjectSchema, ValueKind};
    use tether_core::tool::{InvocationContext, RetryPolicy, RiskLevel, ToolCategory};

    // ── Stubs ─────────────────────────────────────────────────────────

    struct StubPolicy {
        response: Option<PolicyResponse>,
        calls: AtomicUsize,
        last: Mutex<Option<PolicyRequest>>,
    }

    impl StubPolicy {
        fn allow() -> Arc<Self> {
            Self::with(Some(PolicyResponse::allow("ok")))
        }
        fn deny(reason: &str) -> Arc<Self> {
            Self::with(Some(PolicyResponse::deny(reason, "rule:test")))
        }
        fn broken() -> Arc<Self> {
            Self::with(None)
        }
        fn with(response: Option<PolicyResponse>) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl PolicyEngine for StubPolicy {
        async fn evaluate(&self, request: PolicyRequest) -> Result<PolicyResponse, PolicyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request);
            self.response
                .clone()
                .ok_or_else(|| PolicyError::Unavailable("connection refused".into()))
        }
    }

    #[derive(Default)]
    struct RecordingAudit {
        events: Mutex<Vec<AuditEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl AuditEmitter for RecordingAudit {
        async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
            if self.fail {
                return Err(AuditError::Unavailable("sink down".into()));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    // ── Fixtures ──────────────────────────────────────────────────────

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::new("memory:read", ToolCategory::Read, RiskLevel::Read)
                    .with_input_schema(ObjectSchema::new().require("key", ValueKind::String))
                    .with_budget_cost(Some(100), None),
            )
            .unwrap();
        registry
            .register(
                ToolDefinition::new("social:publish", ToolCategory::Publish, RiskLevel::Publish)
                    .with_retry_policy(RetryPolicy {
                        max_retries: 3,
                        backoff_ms: 100,
                        backoff_multiplier: 2.0,
                        max_backoff_ms: 1_000,
                        retryable_errors: vec!["TEMPORARY".into()],
                    }),
            )
            .unwrap();
        registry
            .register(
                ToolDefinition::new("slow:tool", ToolCategory::Read, RiskLevel::Read)
                    .with_budget_cost(None, Some(50)),
            )
            .unwrap();
        registry
            .register(
                ToolDefinition::new("shaped:tool", ToolCategory::Read, RiskLevel::Read)
                    .with_output_schema(ObjectSchema::new().require("items", ValueKind::Array)),
            )
            .unwrap();
        registry
            .register(
                ToolDefinition::new("old:tool", ToolCategory::Read, RiskLevel::Read)
                    .mark_deprecated(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn wrapper(policy: Arc<StubPolicy>, audit: Arc<RecordingAudit>) -> ToolWrapper {
        ToolWrapper::new(registry(), policy, audit)
    }

    fn guard() -> BudgetGuard {
        BudgetGuard::new("ep-1", Budget::new(10_000, 60_000, 10, 2))
    }

    fn invocation(tool: &str, input: Value) -> ToolInvocation {
        ToolInvocation::new(
            tool,
            input,
            InvocationContext {
                episode_id: "ep-1".into(),
                client_id: "client-1".into(),
                agent_id: "agent-1".into(),
                request_id: Some("req-1".into()),
                parent_tool_call_id: None,
            },
        )
    }

    fn counting_ok(calls: Arc<AtomicUsize>) -> impl ToolHandler + 'static {
        handler_fn(move |input: Value, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ToolOutput::new(json!({ "value": input["key"] })))
            }
        })
    }

    // ── Configuration errors ──────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        let err = w
            .invoke(invocation("nope", json!({})), &guard())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownTool(id) if id == "nope"));
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        let err = w
            .invoke(invocation("memory:read", json!({"key": "k"})), &guard())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoHandler(_)));
    }

    #[test]
    fn handler_for_unregistered_tool_rejected() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        let result = w.register_handler("ghost", counting_ok(Arc::default()));
        assert!(matches!(result, Err(RegistryError::UnknownTool(_))));
    }

    #[test]
    fn unregister_handler() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        w.register_handler("memory:read", counting_ok(Arc::default()))
            .unwrap();
        assert!(w.has_handler("memory:read"));
        assert_eq!(w.handler_ids(), vec!["memory:read".to_string()]);
        assert!(w.unregister_handler("memory:read"));
        assert!(!w.unregister_handler("memory:read"));
    }

    // ── Pipeline stages ───────────────────────────────────────────────

    #[tokio::test]
    async fn success_charges_budget_and_audits_once() {
        let audit = Arc::new(RecordingAudit::default());
        let policy = StubPolicy::allow();
        let w = wrapper(policy.clone(), audit.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        w.register_handler("memory:read", counting_ok(calls.clone()))
            .unwrap();
        let g = guard();

        let result = w
            .invoke(invocation("memory:read", json!({"key": "k"})), &g)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output, Some(json!({"value": "k"})));
        assert!(result.error.is_none());
        assert_eq!(result.metadata.retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let budget = g.budget();
        assert_eq!(budget.tool_calls.used, 1);
        assert_eq!(budget.tokens.used, 100, "estimate charged when none reported");

        let events = audit.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].succeeded(), Some(true));
        assert_eq!(events[0].target.id, "memory:read");
        assert_eq!(
            events[0].metadata["invocation_id"],
            json!(result.metadata.invocation_id)
        );

        let request = policy.last.lock().unwrap().clone().unwrap();
        assert_eq!(request.action, "tool:invoke");
        assert_eq!(request.resource, "memory:read");
        assert_eq!(request.attributes["riskLevel"], "read");
        assert_eq!(request.attributes["input"]["key"], "k");
        assert_eq!(request.episode_id.as_deref(), Some("ep-1"));
    }

    #[tokio::test]
    async fn invalid_input_skips_policy_and_budget() {
        let audit = Arc::new(RecordingAudit::default());
        let policy = StubPolicy::allow();
        let w = wrapper(policy.clone(), audit.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        w.register_handler("memory:read", counting_ok(calls.clone()))
            .unwrap();
        let g = guard();

        let result = w
            .invoke(invocation("memory:read", json!({"other": 1})), &g)
            .await
            .unwrap();

        assert_eq!(result.error_code(), Some(ToolErrorCode::InvalidInput));
        assert!(result.output.is_none());
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(g.budget().tool_calls.used, 0);

        let events = audit.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].succeeded(), Some(false));
        assert_eq!(events[0].metadata["error_code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn policy_denial_short_circuits() {
        let audit = Arc::new(RecordingAudit::default());
        let w = wrapper(StubPolicy::deny("Not authorized"), audit.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        w.register_handler("memory:read", counting_ok(calls.clone()))
            .unwrap();
        let g = guard();

        let result = w
            .invoke(invocation("memory:read", json!({"key": "k"})), &g)
            .await
            .unwrap();

        let error = result.error.unwrap();
        assert_eq!(error.code, ToolErrorCode::PolicyDenied);
        assert_eq!(error.message, "Not authorized");
        assert_eq!(error.details.unwrap()["deniedBy"], "rule:test");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(g.budget().tool_calls.used, 0);
        assert_eq!(g.budget().tokens.used, 0);
        assert_eq!(audit.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn policy_engine_error_fails_closed() {
        let w = wrapper(StubPolicy::broken(), Arc::default());
        let calls = Arc::new(AtomicUsize::new(0));
        w.register_handler("memory:read", counting_ok(calls.clone()))
            .unwrap();

        let result = w
            .invoke(invocation("memory:read", json!({"key": "k"})), &guard())
            .await
            .unwrap();

        let error = result.error.unwrap();
        assert_eq!(error.code, ToolErrorCode::PolicyDenied);
        assert_eq!(error.details.unwrap()["deniedBy"], "policy_engine_error");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn skip_policy_check_bypasses_engine() {
        let policy = StubPolicy::deny("never asked");
        let w = wrapper(policy.clone(), Arc::default());
        w.register_handler("memory:read", counting_ok(Arc::default()))
            .unwrap();

        let result = w
            .invoke(
                invocation("memory:read", json!({"key": "k"})).skip_policy_check(),
                &guard(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn budget_denial_never_runs_handler() {
        let audit = Arc::new(RecordingAudit::default());
        let w = wrapper(StubPolicy::allow(), audit.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        w.register_handler("memory:read", counting_ok(calls.clone()))
            .unwrap();
        let g = BudgetGuard::new("ep-1", Budget::new(10_000, 60_000, 0, 0));

        let result = w
            .invoke(invocation("memory:read", json!({"key": "k"})), &g)
            .await
            .unwrap();

        let error = result.error.unwrap();
        assert_eq!(error.code, ToolErrorCode::BudgetExceeded);
        assert_eq!(error.details.unwrap()["dimension"], "tool_calls");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(audit.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reported_tokens_replace_estimate() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        w.register_handler(
            "memory:read",
            handler_fn(|_input, _ctx| async move {
                Ok(ToolOutput::new(json!("hit")).with_tokens(42))
            }),
        )
        .unwrap();
        let g = guard();

        let result = w
            .invoke(invocation("memory:read", json!({"key": "k"})), &g)
            .await
            .unwrap();

        assert_eq!(result.metadata.tokens_used, Some(42));
        assert_eq!(g.budget().tokens.used, 42);
        assert_eq!(g.reserved_tokens(), 0);
    }

    // ── Retries ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn retries_share_one_invocation_id_and_one_audit() {
        let audit = Arc::new(RecordingAudit::default());
        let w = wrapper(StubPolicy::allow(), audit.clone());
        let seen = Arc::new(Mutex::new(Vec::<(String, u32)>::new()));
        let seen_by_handler = seen.clone();
        w.register_handler(
            "social:publish",
            handler_fn(move |_input, ctx: HandlerContext| {
                let seen = seen_by_handler.clone();
                async move {
                    let n = {
                        let mut seen = seen.lock().unwrap();
                        seen.push((ctx.invocation_id.clone(), ctx.attempt));
                        seen.len()
                    };
                    if n <= 2 {
                        Err(HandlerError::new("TEMPORARY", "rate limited"))
                    } else {
                        Ok(ToolOutput::new(json!({"posted": true})))
                    }
                }
            }),
        )
        .unwrap();
        let g = guard();

        let result = w
            .invoke(invocation("social:publish", json!({})), &g)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.metadata.retry_count, 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(id, _)| *id == result.metadata.invocation_id));
        assert_eq!(
            seen.iter().map(|(_, a)| *a).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(audit.events.lock().unwrap().len(), 1);
        assert_eq!(g.budget().tool_calls.used, 1, "retries are one tool call");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        w.register_handler(
            "social:publish",
            handler_fn(move |_input, _ctx| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<ToolOutput, _>(HandlerError::new("TEMPORARY", "still down"))
                }
            }),
        )
        .unwrap();

        let result = w
            .invoke(invocation("social:publish", json!({})), &guard())
            .await
            .unwrap();

        let error = result.error.unwrap();
        assert_eq!(error.code, ToolErrorCode::ExecutionError);
        assert_eq!(error.handler_code.as_deref(), Some("TEMPORARY"));
        assert_eq!(result.metadata.retry_count, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_fast() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        w.register_handler(
            "social:publish",
            handler_fn(move |_input, _ctx| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<ToolOutput, _>(HandlerError::new("FORBIDDEN", "account suspended"))
                }
            }),
        )
        .unwrap();

        let result = w
            .invoke(invocation("social:publish", json!({})), &guard())
            .await
            .unwrap();

        assert_eq!(result.error_code(), Some(ToolErrorCode::ExecutionError));
        assert_eq!(result.metadata.retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_becomes_internal_error_without_retry() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        w.register_handler(
            "social:publish",
            handler_fn(move |_input, _ctx| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if c.load(Ordering::SeqCst) > 0 {
                        panic!("driver crashed");
                    }
                    Ok(ToolOutput::new(json!(null)))
                }
            }),
        )
        .unwrap();

        let result = w
            .invoke(invocation("social:publish", json!({})), &guard())
            .await
            .unwrap();

        let error = result.error.unwrap();
        assert_eq!(error.code, ToolErrorCode::InternalError);
        assert!(error.message.contains("driver crashed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── Timeout ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn timeout_wins_and_cancels_handler_token() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        let observed = Arc::new(Mutex::new(None::<CancellationToken>));
        let o = observed.clone();
        w.register_handler(
            "slow:tool",
            handler_fn(move |_input, ctx: HandlerContext| {
                let o = o.clone();
                async move {
                    *o.lock().unwrap() = Some(ctx.cancel.clone());
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(ToolOutput::new(json!("late")))
                }
            }),
        )
        .unwrap();

        let started = tokio::time::Instant::now();
        let result = w
            .invoke(invocation("slow:tool", json!({})), &guard())
            .await
            .unwrap();

        assert_eq!(result.error_code(), Some(ToolErrorCode::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
        let token = observed.lock().unwrap().clone().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_overrides_tool_default() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        w.register_handler(
            "slow:tool",
            handler_fn(|_input, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(ToolOutput::new(json!("done")))
            }),
        )
        .unwrap();

        let result = w
            .invoke(
                invocation("slow:tool", json!({})).with_timeout_ms(1_000),
                &guard(),
            )
            .await
            .unwrap();
        assert!(result.success);
    }

    /// Occupies the only slot of `client-1` with a 10 s publish call.
    async fn hold_only_slot(w: &Arc<ToolWrapper>) -> tokio::task::JoinHandle<ToolResult> {
        w.register_handler(
            "social:publish",
            handler_fn(|_input, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(ToolOutput::new(json!("posted")))
            }),
        )
        .unwrap();
        let holder = {
            let w = w.clone();
            tokio::spawn(async move {
                w.invoke(
                    invocation("social:publish", json!({})).with_timeout_ms(20_000),
                    &guard(),
                )
                .await
                .unwrap()
            })
        };
        while w.limiter().available("client-1") > 0 {
            tokio::task::yield_now().await;
        }
        holder
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_a_client_slot_counts_against_timeout() {
        let audit = Arc::new(RecordingAudit::default());
        let w = Arc::new(
            wrapper(StubPolicy::allow(), audit.clone()).with_max_concurrent_per_client(1),
        );
        let holder = hold_only_slot(&w).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        w.register_handler(
            "slow:tool",
            handler_fn(move |_input, _ctx| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(ToolOutput::new(json!("fast")))
                }
            }),
        )
        .unwrap();

        let g = guard();
        let started = tokio::time::Instant::now();
        let result = w
            .invoke(invocation("slow:tool", json!({})), &g)
            .await
            .unwrap();

        assert_eq!(result.error_code(), Some(ToolErrorCode::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.error.unwrap().details.unwrap()["queued"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(g.remaining_budget().tool_calls.used, 0);
        let audited = audit.events.lock().unwrap();
        assert_eq!(
            audited.iter().filter(|e| e.target.id == "slow:tool").count(),
            1
        );
        drop(audited);

        assert!(holder.await.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reaches_a_call_waiting_for_a_slot() {
        let w = Arc::new(
            wrapper(StubPolicy::allow(), Arc::default()).with_max_concurrent_per_client(1),
        );
        let _holder = hold_only_slot(&w).await;
        w.register_handler(
            "memory:read",
            handler_fn(|_input, _ctx| async move { Ok(ToolOutput::new(json!("v"))) }),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let waiting = {
            let w = w.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                w.invoke_with_cancel(
                    invocation("memory:read", json!({"key": "k"})).with_timeout_ms(20_000),
                    &guard(),
                    &cancel,
                )
                .await
                .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let invoked = waiting.await.unwrap();
        let error = invoked.value.error.unwrap();
        assert_eq!(error.code, ToolErrorCode::ExecutionError);
        assert_eq!(error.handler_code.as_deref(), Some("CANCELLED"));
    }

    #[tokio::test]
    async fn outside_cancel_stops_retries() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        w.register_handler(
            "social:publish",
            handler_fn(move |_input, _ctx| {
                let c = c.clone();
                async move {
                    c.cancel();
                    Err::<ToolOutput, _>(HandlerError::new("TEMPORARY", "flaky"))
                }
            }),
        )
        .unwrap();

        let invoked = w
            .invoke_with_cancel(invocation("social:publish", json!({})), &guard(), &cancel)
            .await
            .unwrap();
        assert_eq!(invoked.value.metadata.retry_count, 0);
        assert_eq!(invoked.value.error_code(), Some(ToolErrorCode::ExecutionError));
    }

    // ── Output, audit and trace ───────────────────────────────────────

    #[tokio::test]
    async fn output_schema_violation() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        w.register_handler(
            "shaped:tool",
            handler_fn(|_input, _ctx| async move { Ok(ToolOutput::new(json!({"items": "x"}))) }),
        )
        .unwrap();

        let result = w
            .invoke(invocation("shaped:tool", json!({})), &guard())
            .await
            .unwrap();
        let error = result.error.unwrap();
        assert_eq!(error.code, ToolErrorCode::ExecutionError);
        assert_eq!(error.handler_code.as_deref(), Some("INVALID_OUTPUT"));
    }

    #[tokio::test]
    async fn audit_failure_does_not_fail_invocation() {
        let audit = Arc::new(RecordingAudit {
            fail: true,
            ..RecordingAudit::default()
        });
        let w = wrapper(StubPolicy::allow(), audit);
        w.register_handler("memory:read", counting_ok(Arc::default()))
            .unwrap();

        let result = w
            .invoke(invocation("memory:read", json!({"key": "k"})), &guard())
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn deprecated_tool_still_runs() {
        let w = wrapper(StubPolicy::allow(), Arc::default());
        w.register_handler(
            "old:tool",
            handler_fn(|_input, _ctx| async move { Ok(ToolOutput::new(json!(1))) }),
        )
        .unwrap();
        let result = w
            .invoke(invocation("old:tool", json!({})), &guard())
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn spans_recorded_per_invocation() {
        let recorder = Arc::new(TraceRecorder::new());
        let w = wrapper(StubPolicy::allow(), Arc::default()).with_recorder(recorder.clone());
        w.register_handler("memory:read", counting_ok(Arc::default()))
            .unwrap();
        let g = guard();

        w.invoke(invocation("memory:read", json!({"key": "k"})), &g)
            .await
            .unwrap();
        w.invoke(invocation("memory:read", json!({})), &g)
            .await
            .unwrap();

        let traces = recorder.traces_for_episode("ep-1");
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].tool_invocation_count(), 2);
        assert_eq!(traces[0].failed_invocation_count(), 1);
    }
}
