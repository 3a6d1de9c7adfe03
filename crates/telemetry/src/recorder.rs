//! Thread-safe trace recorder: one trace per episode, spans appended as
//! tool invocations and phases complete.

use crate::model::*;
use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock};

/// Traces retained before completed ones are pruned.
const MAX_TRACES: usize = 5_000;

/// Collects spans for every episode that runs through the runtime.
///
/// Thread-safe via `RwLock`. Shared as an `Arc` between the tool
/// pipeline and the episode state machines.
pub struct TraceRecorder {
    /// All recorded traces (most recent last).
    traces: RwLock<Vec<Trace>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            traces: RwLock::new(Vec::new()),
        }
    }

    // ── Trace management ──────────────────────────────────────────────

    /// Start a trace for an episode. Returns the existing trace id if one
    /// is already open.
    pub fn start_trace(&self, episode_id: &str) -> String {
        let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(t) = traces
            .iter()
            .find(|t| t.episode_id == episode_id && t.ended_at.is_none())
        {
            return t.id.clone();
        }

        if traces.len() >= MAX_TRACES {
            // Remove oldest completed traces first
            let drain_count = MAX_TRACES / 10;
            let mut removed = 0;
            traces.retain(|t| {
                if removed >= drain_count {
                    return true;
                }
                if t.ended_at.is_some() {
                    removed += 1;
                    return false;
                }
                true
            });
        }

        let trace = Trace::new(episode_id);
        let id = trace.id.clone();
        traces.push(trace);
        id
    }

    /// End the open trace of an episode.
    pub fn end_trace(&self, episode_id: &str) {
        let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(trace) = traces
            .iter_mut()
            .rev()
            .find(|t| t.episode_id == episode_id && t.ended_at.is_none())
        {
            trace.end();
        }
    }

    /// Record a completed span against an episode, opening a trace if
    /// none is open yet.
    pub fn record_span(&self, episode_id: &str, span: Span) {
        tracing::trace!(
            episode_id,
            kind = %span.kind,
            label = %span.label,
            success = ?span.success,
            "span recorded"
        );
        self.start_trace(episode_id);
        let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(trace) = traces
            .iter_mut()
            .rev()
            .find(|t| t.episode_id == episode_id && t.ended_at.is_none())
        {
            trace.add_span(span);
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Get a specific trace by ID.
    pub fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        traces.iter().find(|t| t.id == trace_id).cloned()
    }

    /// All traces for one episode, oldest first. A resumed episode keeps
    /// its id, so it may have more than one.
    pub fn traces_for_episode(&self, episode_id: &str) -> Vec<Trace> {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        traces
            .iter()
            .filter(|t| t.episode_id == episode_id)
            .cloned()
            .collect()
    }

    /// List recent traces (most recent first).
    pub fn recent_traces(&self, limit: usize) -> Vec<Trace> {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        traces.iter().rev().take(limit).cloned().collect()
    }

    /// Total number of traces recorded.
    pub fn trace_count(&self) -> usize {
        self.traces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Totals across every retained trace.
    pub fn summary(&self) -> TraceSummary {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        traces.iter().fold(TraceSummary::default(), |mut acc, t| {
            acc.trace_count += 1;
            acc.tool_invocations += t.tool_invocation_count() as u64;
            acc.failed_invocations += t.failed_invocation_count() as u64;
            acc.retries += t.total_retries();
            acc.tokens += t.total_tokens();
            acc
        })
    }

    /// Prune traces started before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
        let before = traces.len();
        traces.retain(|t| t.started_at >= cutoff);
        before - traces.len()
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}
