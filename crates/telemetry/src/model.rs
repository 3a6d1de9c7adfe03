//! Data model for execution traces and spans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// One call through the tool invocation pipeline, retries included.
    ToolInvocation,
    /// Time spent in one episode phase.
    Phase,
    /// A child episode, from spawn to outcome.
    ChildEpisode,
    /// A checkpoint save or resume.
    Checkpoint,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolInvocation => write!(f, "tool_invocation"),
            Self::Phase => write!(f, "phase"),
            Self::ChildEpisode => write!(f, "child_episode"),
            Self::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

/// A single traced execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Unique identifier.
    pub id: String,
    /// Parent span id (None for root spans).
    pub parent_id: Option<String>,
    /// What kind of work this represents.
    pub kind: SpanKind,
    /// Human-readable label (tool id, phase name).
    pub label: String,
    /// When the span started.
    pub started_at: DateTime<Utc>,
    /// When the span ended (None if still running).
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds (computed on end).
    pub duration_ms: Option<u64>,
    /// Tokens reported by the handler.
    pub tokens_used: Option<u64>,
    /// Retries performed before the final outcome.
    pub retry_count: u32,
    /// Stable error code on failure.
    pub error_code: Option<String>,
    /// Whether the operation succeeded.
    pub success: Option<bool>,
    /// Arbitrary metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Span {
    /// Create a new span with the given kind and label.
    pub fn new(kind: SpanKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            kind,
            label: label.into(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            tokens_used: None,
            retry_count: 0,
            error_code: None,
            success: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Set the parent span.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Start time, for spans rebuilt after the fact.
    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Mark the span as ended with the given success status.
    pub fn end(&mut self, success: bool) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.success = Some(success);
    }

    /// Mark the span as failed with a stable code.
    pub fn fail(&mut self, code: impl Into<String>) {
        self.error_code = Some(code.into());
        self.end(false);
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_used.unwrap_or(0)
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────

/// All spans recorded for one episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// Unique trace id.
    pub id: String,
    /// Episode this trace belongs to.
    pub episode_id: String,
    /// All spans in this trace.
    pub spans: Vec<Span>,
    /// When the trace started.
    pub started_at: DateTime<Utc>,
    /// When the trace ended.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Trace {
    /// Create a new trace for an episode.
    pub fn new(episode_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            episode_id: episode_id.into(),
            spans: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Add a span to this trace.
    pub fn add_span(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Mark the trace as complete.
    pub fn end(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// Total tokens across all spans.
    pub fn total_tokens(&self) -> u64 {
        self.spans.iter().map(|s| s.total_tokens()).sum()
    }

    /// Total duration in milliseconds.
    pub fn total_duration_ms(&self) -> u64 {
        self.spans.iter().filter_map(|s| s.duration_ms).sum()
    }

    /// Number of tool invocations in this trace.
    pub fn tool_invocation_count(&self) -> usize {
        self.spans_of(SpanKind::ToolInvocation).count()
    }

    /// Tool invocations that ended in failure.
    pub fn failed_invocation_count(&self) -> usize {
        self.spans_of(SpanKind::ToolInvocation)
            .filter(|s| s.success == Some(false))
            .count()
    }

    /// Retries across all tool invocations.
    pub fn total_retries(&self) -> u64 {
        self.spans_of(SpanKind::ToolInvocation)
            .map(|s| u64::from(s.retry_count))
            .sum()
    }

    fn spans_of(&self, kind: SpanKind) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(move |s| s.kind == kind)
    }
}

// ── Aggregated views ──────────────────────────────────────────────────────

/// Totals across every recorded trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_count: u64,
    pub tool_invocations: u64,
    pub failed_invocations: u64,
    pub retries: u64,
    pub tokens: u64,
}
