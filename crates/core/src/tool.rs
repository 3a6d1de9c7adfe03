//! Tool definitions, invocations, results, and the tool registry.
//!
//! A [`ToolDefinition`] is static catalog data: what a tool is, how risky
//! it is, what it costs and how it may be retried. The executable side
//! (handlers) is registered separately on the invocation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::schema::ObjectSchema;

/// Broad class of effect a tool has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolCategory {
    Read,
    Write,
    Publish,
    SideEffect,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Publish => write!(f, "publish"),
            Self::SideEffect => write!(f, "sideEffect"),
        }
    }
}

/// Risk classification used by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Read,
    Write,
    Publish,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Publish => write!(f, "publish"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Estimated cost of one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCost {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_tokens: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_time_ms: Option<u64>,
}

/// Retry policy for transient handler failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay before the first retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Handler error codes that may be retried. Anything else fails fast.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, code: &str) -> bool {
        self.retryable_errors.iter().any(|c| c == code)
    }
}

/// Static catalog entry for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Globally unique id, e.g. `memory:read`.
    pub id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub category: ToolCategory,

    pub risk_level: RiskLevel,

    #[serde(default)]
    pub input_schema: ObjectSchema,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<ObjectSchema>,

    /// Granted permissions. Supports exact, `prefix:*` and bare `*`.
    #[serde(default)]
    pub permissions: Vec<String>,

    #[serde(default)]
    pub budget_cost: BudgetCost,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default)]
    pub deprecated: bool,
}

fn default_version() -> String {
    "1.0.0".into()
}

impl ToolDefinition {
    pub fn new(id: impl Into<String>, category: ToolCategory, risk_level: RiskLevel) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            version: default_version(),
            category,
            risk_level,
            input_schema: ObjectSchema::default(),
            output_schema: None,
            permissions: Vec::new(),
            budget_cost: BudgetCost::default(),
            retry_policy: None,
            deprecated: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: ObjectSchema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: ObjectSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_budget_cost(mut self, default_tokens: Option<u64>, default_time_ms: Option<u64>) -> Self {
        self.budget_cost = BudgetCost {
            default_tokens,
            default_time_ms,
        };
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn mark_deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    /// Tools whose effects escape the runtime and must not be duplicated.
    pub fn is_side_effecting(&self) -> bool {
        matches!(self.category, ToolCategory::Publish | ToolCategory::SideEffect)
    }
}

/// Who/what an invocation is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub episode_id: String,
    pub client_id: String,
    pub agent_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_call_id: Option<String>,
}

/// Per-call knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationOptions {
    /// Overrides the tool's default time cost as the timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub skip_policy_check: bool,
}

/// A request to run one tool through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_id: String,
    pub input: serde_json::Value,
    pub context: InvocationContext,
    #[serde(default)]
    pub options: InvocationOptions,
}

impl ToolInvocation {
    pub fn new(tool_id: impl Into<String>, input: serde_json::Value, context: InvocationContext) -> Self {
        Self {
            tool_id: tool_id.into(),
            input,
            context,
            options: InvocationOptions::default(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn skip_policy_check(mut self) -> Self {
        self.options.skip_policy_check = true;
        self
    }
}

/// Stable codes for operational failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    InvalidInput,
    PolicyDenied,
    BudgetExceeded,
    Timeout,
    ExecutionError,
    InternalError,
}

impl ToolErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::Timeout => "TIMEOUT",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ToolErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure carried by an unsuccessful [`ToolResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub code: ToolErrorCode,
    pub message: String,

    /// Code reported by the handler itself (e.g. `TEMPORARY`), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolFailure {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            handler_code: None,
            details: None,
        }
    }

    pub fn with_handler_code(mut self, code: impl Into<String>) -> Self {
        self.handler_code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Timing and accounting for one invocation (all retries included).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultMetadata {
    pub tool_id: String,
    pub invocation_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// Outcome of one invocation. Exactly one of `output` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<ToolFailure>,
    pub metadata: ToolResultMetadata,
}

impl ToolResult {
    pub fn ok(output: serde_json::Value, metadata: ToolResultMetadata) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            metadata,
        }
    }

    pub fn failed(error: ToolFailure, metadata: ToolResultMetadata) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error),
            metadata,
        }
    }

    pub fn error_code(&self) -> Option<ToolErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Does a granted permission cover the requested one?
///
/// Exact match, `prefix:*` matching anything sharing `prefix:`, or bare `*`.
pub fn permission_matches(granted: &str, requested: &str) -> bool {
    if granted == "*" || granted == requested {
        return true;
    }
    match granted.strip_suffix('*') {
        Some(prefix) if prefix.ends_with(':') => requested.starts_with(prefix),
        _ => false,
    }
}

/// The authoritative catalog of tool definitions.
///
/// Built once at startup, then shared read-only (typically in an `Arc`)
/// across every concurrently running episode.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool definition. Duplicate ids are rejected.
    pub fn register(&mut self, definition: ToolDefinition) -> Result<(), RegistryError> {
        if self.tools.contains_key(&definition.id) {
            return Err(RegistryError::AlreadyRegistered(definition.id));
        }
        self.tools
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// Get a tool by id.
    pub fn get(&self, id: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.get(id).cloned()
    }

    pub fn get_by_category(&self, category: ToolCategory) -> Vec<Arc<ToolDefinition>> {
        self.filtered(|t| t.category == category)
    }

    pub fn get_by_risk_level(&self, level: RiskLevel) -> Vec<Arc<ToolDefinition>> {
        self.filtered(|t| t.risk_level == level)
    }

    /// All definitions, sorted by id.
    pub fn list(&self) -> Vec<Arc<ToolDefinition>> {
        self.filtered(|_| true)
    }

    /// Whether `tool_id` has been granted `permission`. Unknown tools have none.
    pub fn has_permission(&self, tool_id: &str, permission: &str) -> bool {
        self.tools.get(tool_id).is_some_and(|t| {
            t.permissions
                .iter()
                .any(|granted| permission_matches(granted, permission))
        })
    }

    pub fn is_deprecated(&self, tool_id: &str) -> bool {
        self.tools.get(tool_id).is_some_and(|t| t.deprecated)
    }

    /// List all registered tool ids, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn filtered(&self, pred: impl Fn(&ToolDefinition) -> bool) -> Vec<Arc<ToolDefinition>> {
        let mut out: Vec<Arc<ToolDefinition>> = self
            .tools
            .values()
            .filter(|t| pred(t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
