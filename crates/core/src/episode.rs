//! Episode domain types: lifecycle status, phases, recursion policy,
//! the side-effect ledger, and terminal summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::budget::{Budget, BudgetSnapshot};
use crate::error::RecursionError;

/// Unique identifier for an episode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(pub String);

impl EpisodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EpisodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for EpisodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Top-level lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Escalated,
    Cancelled,
}

impl EpisodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Escalated | Self::Cancelled
        )
    }
}

impl std::fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Escalated => write!(f, "escalated"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Ordered sub-steps of the `running` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Intake,
    Plan,
    Act,
    Verify,
    Commit,
}

impl Phase {
    pub const ORDER: [Phase; 5] = [
        Phase::Intake,
        Phase::Plan,
        Phase::Act,
        Phase::Verify,
        Phase::Commit,
    ];

    /// The following phase, or `None` after `commit`.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Self::Intake => Some(Self::Plan),
            Self::Plan => Some(Self::Act),
            Self::Act => Some(Self::Verify),
            Self::Verify => Some(Self::Commit),
            Self::Commit => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Plan => "plan",
            Self::Act => "act",
            Self::Verify => "verify",
            Self::Commit => "commit",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outputs produced so far, keyed by phase name then output key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseOutputs(BTreeMap<String, serde_json::Map<String, serde_json::Value>>);

impl PhaseOutputs {
    pub fn insert(&mut self, phase: Phase, key: impl Into<String>, value: serde_json::Value) {
        self.0
            .entry(phase.as_str().to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn get(&self, phase: Phase) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.0.get(phase.as_str())
    }

    pub fn value(&self, phase: Phase, key: &str) -> Option<&serde_json::Value> {
        self.get(phase).and_then(|m| m.get(key))
    }

    /// Required keys not yet produced for `phase`.
    pub fn missing<'a>(&self, phase: Phase, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|k| self.value(phase, k).is_none())
            .map(|k| k.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A condition that ends the current episode's recursion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopCondition {
    BudgetExhausted,
    DepthExceeded,
    NoNewInformation { consecutive: u32 },
    RepeatedFailure { threshold: u32 },
    PolicyBlocked,
    ObjectiveSatisfied,
}

impl StopCondition {
    fn same_kind(&self, other: &StopCondition) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn threshold(&self) -> Option<u32> {
        match self {
            Self::NoNewInformation { consecutive } => Some(*consecutive),
            Self::RepeatedFailure { threshold } => Some(*threshold),
            _ => None,
        }
    }
}

/// Limits governing children of an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursionPolicy {
    pub max_depth: u32,
    pub max_children: u32,
    pub max_total_episodes: u32,

    /// Empty means any type not explicitly forbidden.
    #[serde(default)]
    pub allowed_child_types: Vec<String>,

    #[serde(default)]
    pub forbidden_child_types: Vec<String>,

    #[serde(default)]
    pub stop_conditions: Vec<StopCondition>,
}

impl Default for RecursionPolicy {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_children: 5,
            max_total_episodes: 20,
            allowed_child_types: Vec::new(),
            forbidden_child_types: Vec::new(),
            stop_conditions: vec![
                StopCondition::BudgetExhausted,
                StopCondition::DepthExceeded,
                StopCondition::NoNewInformation { consecutive: 2 },
                StopCondition::RepeatedFailure { threshold: 3 },
                StopCondition::PolicyBlocked,
                StopCondition::ObjectiveSatisfied,
            ],
        }
    }
}

impl RecursionPolicy {
    /// Reject internally inconsistent policies.
    pub fn validate(&self) -> Result<(), RecursionError> {
        if self.max_total_episodes == 0 {
            return Err(RecursionError::InvalidPolicy(
                "max_total_episodes must be at least 1 (the root episode)".into(),
            ));
        }
        if let Some(t) = self
            .allowed_child_types
            .iter()
            .find(|t| self.forbidden_child_types.contains(t))
        {
            return Err(RecursionError::InvalidPolicy(format!(
                "child type '{t}' is both allowed and forbidden"
            )));
        }
        if self.stop_conditions.iter().any(|c| c.threshold() == Some(0)) {
            return Err(RecursionError::InvalidPolicy(
                "stop condition thresholds must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Check a requested child type against the allow/forbid lists.
    pub fn permits_child_type(&self, child_type: &str) -> Result<(), RecursionError> {
        if self.forbidden_child_types.iter().any(|t| t == child_type) {
            return Err(RecursionError::ChildTypeForbidden(child_type.to_string()));
        }
        if !self.allowed_child_types.is_empty()
            && !self.allowed_child_types.iter().any(|t| t == child_type)
        {
            return Err(RecursionError::ChildTypeNotAllowed(child_type.to_string()));
        }
        Ok(())
    }

    /// A child policy may only be equal to or stricter than its parent's.
    pub fn ensure_no_looser_than(&self, parent: &RecursionPolicy) -> Result<(), RecursionError> {
        let loosened = |what: String| Err(RecursionError::LoosenedPolicy(what));

        if self.max_depth > parent.max_depth {
            return loosened(format!("max_depth {} > {}", self.max_depth, parent.max_depth));
        }
        if self.max_children > parent.max_children {
            return loosened(format!(
                "max_children {} > {}",
                self.max_children, parent.max_children
            ));
        }
        if self.max_total_episodes > parent.max_total_episodes {
            return loosened(format!(
                "max_total_episodes {} > {}",
                self.max_total_episodes, parent.max_total_episodes
            ));
        }
        if !parent.allowed_child_types.is_empty() {
            if self.allowed_child_types.is_empty() {
                return loosened("allowed_child_types widened to any".into());
            }
            if let Some(t) = self
                .allowed_child_types
                .iter()
                .find(|t| !parent.allowed_child_types.contains(t))
            {
                return loosened(format!("child type '{t}' not allowed by parent"));
            }
        }
        if let Some(t) = parent
            .forbidden_child_types
            .iter()
            .find(|t| !self.forbidden_child_types.contains(t))
        {
            return loosened(format!("child type '{t}' no longer forbidden"));
        }
        for cond in &parent.stop_conditions {
            let Some(mine) = self.stop_conditions.iter().find(|c| c.same_kind(cond)) else {
                return loosened(format!("stop condition {cond:?} dropped"));
            };
            if let (Some(a), Some(b)) = (mine.threshold(), cond.threshold()) {
                if a > b {
                    return loosened(format!("stop condition {cond:?} relaxed to {a}"));
                }
            }
        }
        Ok(())
    }

    pub fn stops_on_budget_exhaustion(&self) -> bool {
        self.stop_conditions
            .contains(&StopCondition::BudgetExhausted)
    }

    pub fn stops_on_depth_exceeded(&self) -> bool {
        self.stop_conditions.contains(&StopCondition::DepthExceeded)
    }

    pub fn stops_on_policy_block(&self) -> bool {
        self.stop_conditions.contains(&StopCondition::PolicyBlocked)
    }

    pub fn stops_on_objective_satisfied(&self) -> bool {
        self.stop_conditions
            .contains(&StopCondition::ObjectiveSatisfied)
    }

    pub fn no_new_information_limit(&self) -> Option<u32> {
        self.stop_conditions.iter().find_map(|c| match c {
            StopCondition::NoNewInformation { consecutive } => Some(*consecutive),
            _ => None,
        })
    }

    pub fn repeated_failure_threshold(&self) -> Option<u32> {
        self.stop_conditions.iter().find_map(|c| match c {
            StopCondition::RepeatedFailure { threshold } => Some(*threshold),
            _ => None,
        })
    }
}

/// One attempted external side effect, kept for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectRecord {
    pub tool_id: String,
    pub target: String,
    pub invocation_id: String,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Which tool failed, how, and after how many retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub tool_id: String,
    pub code: String,
    pub message: String,
    pub retry_count: u32,
}

impl std::fmt::Display for FailureSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed with {} after {} retr{}: {}",
            self.tool_id,
            self.code,
            self.retry_count,
            if self.retry_count == 1 { "y" } else { "ies" },
            self.message
        )
    }
}

/// Hand-off record for a human or another system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationTicket {
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EscalationTicket {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ticket_id: None,
            details: None,
        }
    }
}

/// Explanation attached to every terminal episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSummary {
    pub status: EpisodeStatus,
    pub reason: String,
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<EscalationTicket>,

    pub budget: BudgetSnapshot,
    pub finished_at: DateTime<Utc>,
}

/// One bounded unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub client_id: String,
    pub agent_id: String,
    pub goal: String,

    #[serde(default)]
    pub inputs: serde_json::Value,

    pub status: EpisodeStatus,
    pub phase: Phase,

    /// 0 for the root episode.
    pub depth: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_episode_id: Option<EpisodeId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_type: Option<String>,

    pub budget: Budget,
    pub recursion_policy: RecursionPolicy,

    #[serde(default)]
    pub outputs: PhaseOutputs,

    #[serde(default)]
    pub side_effects: Vec<SideEffectRecord>,

    /// Targets an ancestor already acted on. This episode may not cause
    /// another side effect on them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherited_targets: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<TerminalSummary>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Episode {
    /// A new root episode in `pending` at the `intake` phase.
    pub fn new(
        client_id: impl Into<String>,
        agent_id: impl Into<String>,
        goal: impl Into<String>,
        budget: Budget,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EpisodeId::new(),
            client_id: client_id.into(),
            agent_id: agent_id.into(),
            goal: goal.into(),
            inputs: serde_json::Value::Null,
            status: EpisodeStatus::Pending,
            phase: Phase::Intake,
            depth: 0,
            parent_episode_id: None,
            child_type: None,
            budget,
            recursion_policy: RecursionPolicy::default(),
            outputs: PhaseOutputs::default(),
            side_effects: Vec::new(),
            inherited_targets: Vec::new(),
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_recursion_policy(mut self, policy: RecursionPolicy) -> Self {
        self.recursion_policy = policy;
        self
    }

    /// Has this episode already touched `target` with a side effect?
    pub fn has_side_effect_on(&self, target: &str) -> bool {
        self.side_effects.iter().any(|s| s.target == target)
    }

    /// Was `target` acted on by an ancestor of this episode?
    pub fn is_inherited_target(&self, target: &str) -> bool {
        self.inherited_targets.iter().any(|t| t == target)
    }

    /// Every target this episode or its ancestors caused a side effect on.
    pub fn side_effect_targets(&self) -> impl Iterator<Item = &str> {
        self.inherited_targets
            .iter()
            .map(String::as_str)
            .chain(self.side_effects.iter().map(|s| s.target.as_str()))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
