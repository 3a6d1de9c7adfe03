//! Bounded recursion: when an episode may spawn a child, with what budget,
//! and when it must stop spawning altogether.
//!
//! ```text
//!            ┌──────────────┐
//!            │ parent (d=0) │  ← owns the RecursionController
//!            └──┬────────┬──┘
//!   research    │        │    verification
//!               ▼        ▼
//!        ┌──────────┐ ┌──────────┐
//!        │ child d=1│ │ child d=1│  ← each gets ≤ 50% of what remains
//!        └──────────┘ └──────────┘
//! ```
//!
//! Every check runs against the parent's [`RecursionPolicy`]. A child may
//! carry its own policy, but never a looser one. Once a stop condition
//! fires, the parent spawns no further children.

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use tether_core::episode::{Episode, EpisodeId, EpisodeStatus, RecursionPolicy};
use tether_core::error::RecursionError;
use tether_core::event::DomainEvent;
use tether_telemetry::{Span, SpanKind};

use crate::machine::EpisodeMachine;

/// Fraction of the parent's remaining budget a child gets when the
/// request does not say.
pub const DEFAULT_CHILD_FRACTION: f64 = 0.25;

/// Why an episode is considering a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnTrigger {
    MissingContext,
    AmbiguousHighRiskAction,
    PredictedBudgetBreach,
    SideEffectVerification,
    ConflictingEvidence,
}

/// Answer to [`RecursionController::should_spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnDecision {
    Spawn,
    ContinueInline(String),
    Stop(String),
}

/// What a child is for. Action children are tied to the target they act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildPurpose {
    Research,
    Action { target: String },
    Verification { target: String },
}

impl ChildPurpose {
    fn action_target(&self) -> Option<&str> {
        match self {
            Self::Action { target } => Some(target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChildRequest {
    pub child_type: String,
    pub goal: String,
    pub inputs: Value,
    pub purpose: ChildPurpose,
    /// Share of the parent's remaining budget. Capped at 50%.
    pub budget_fraction: Option<f64>,
    /// Must be no looser than the parent's. Defaults to the parent's.
    pub policy: Option<RecursionPolicy>,
}

impl ChildRequest {
    pub fn new(child_type: impl Into<String>, goal: impl Into<String>, purpose: ChildPurpose) -> Self {
        Self {
            child_type: child_type.into(),
            goal: goal.into(),
            inputs: Value::Null,
            purpose,
            budget_fraction: None,
            policy: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_budget_fraction(mut self, fraction: f64) -> Self {
        self.budget_fraction = Some(fraction);
        self
    }

    pub fn with_policy(mut self, policy: RecursionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// How a finished child went, as judged by the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome {
    NewInformation,
    NoNewInformation,
    Failed { class: String },
    PolicyBlocked,
    ObjectiveSatisfied,
}

impl ChildOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewInformation => "new_information",
            Self::NoNewInformation => "no_new_information",
            Self::Failed { .. } => "failed",
            Self::PolicyBlocked => "policy_blocked",
            Self::ObjectiveSatisfied => "objective_satisfied",
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    consecutive_no_info: u32,
    failure_counts: HashMap<String, u32>,
    stopped: Option<String>,
    absorbed: HashSet<EpisodeId>,
    action_targets: HashSet<String>,
}

/// Decides and performs child spawning for one parent episode.
pub struct RecursionController {
    parent: Arc<EpisodeMachine>,
    /// Episodes in the whole chain, root included. Shared with the
    /// controllers of descendants.
    chain_total: Arc<AtomicU32>,
    children_spawned: AtomicU32,
    children: Mutex<Vec<Arc<EpisodeMachine>>>,
    state: Mutex<ControllerState>,
    default_fraction: f64,
}

impl std::fmt::Debug for RecursionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecursionController")
            .field("parent", self.parent.id())
            .field("children_spawned", &self.children_spawned())
            .field("chain_total", &self.chain_total())
            .field("stopped", &self.stop_reason())
            .finish()
    }
}

impl RecursionController {
    /// Controller for a root episode.
    pub fn new(parent: Arc<EpisodeMachine>) -> Self {
        Self::with_chain(parent, Arc::new(AtomicU32::new(1)))
    }

    fn with_chain(parent: Arc<EpisodeMachine>, chain_total: Arc<AtomicU32>) -> Self {
        Self {
            parent,
            chain_total,
            children_spawned: AtomicU32::new(0),
            children: Mutex::new(Vec::new()),
            state: Mutex::new(ControllerState::default()),
            default_fraction: DEFAULT_CHILD_FRACTION,
        }
    }

    pub fn with_default_fraction(mut self, fraction: f64) -> Self {
        self.default_fraction = fraction;
        self
    }

    /// Controller for a child this controller spawned, counting against
    /// the same chain total.
    pub fn child_controller(&self, child: Arc<EpisodeMachine>) -> Self {
        let mut controller = Self::with_chain(child, self.chain_total.clone());
        controller.default_fraction = self.default_fraction;
        controller
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn children_lock(&self) -> MutexGuard<'_, Vec<Arc<EpisodeMachine>>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn parent(&self) -> &Arc<EpisodeMachine> {
        &self.parent
    }

    pub fn children(&self) -> Vec<Arc<EpisodeMachine>> {
        self.children_lock().clone()
    }

    pub fn children_spawned(&self) -> u32 {
        self.children_spawned.load(Ordering::SeqCst)
    }

    pub fn chain_total(&self) -> u32 {
        self.chain_total.load(Ordering::SeqCst)
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.lock().stopped.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped.is_some()
    }

    // ── Decisions ─────────────────────────────────────────────────────

    /// Should the parent spawn a child for `trigger` or keep working
    /// inline? Advisory only: [`spawn`](Self::spawn) re-checks everything.
    pub fn should_spawn(&self, trigger: SpawnTrigger) -> SpawnDecision {
        if let Some(reason) = self.stop_reason() {
            return SpawnDecision::Stop(reason);
        }
        let status = self.parent.status();
        if status != EpisodeStatus::Running {
            return SpawnDecision::Stop(format!("parent episode is {status}"));
        }

        let episode = self.parent.episode();
        let policy = &episode.recursion_policy;
        if episode.depth + 1 > policy.max_depth {
            return SpawnDecision::ContinueInline(format!(
                "depth limit {} reached",
                policy.max_depth
            ));
        }
        if self.children_spawned() >= policy.max_children {
            return SpawnDecision::ContinueInline(format!(
                "child limit {} reached",
                policy.max_children
            ));
        }
        if self.chain_total() >= policy.max_total_episodes {
            return SpawnDecision::ContinueInline(format!(
                "episode chain limit {} reached",
                policy.max_total_episodes
            ));
        }
        if episode.budget.subcalls.remaining() == 0 {
            return SpawnDecision::ContinueInline("no subcalls remaining".into());
        }
        if trigger != SpawnTrigger::SideEffectVerification && self.parent.should_wrap_up() {
            return SpawnDecision::ContinueInline(
                "budget advisory raised; wrap up instead of starting new work".into(),
            );
        }
        SpawnDecision::Spawn
    }

    /// Spawn a child episode in `pending`. The caller starts and drives it,
    /// then reports back through [`record_child_outcome`](Self::record_child_outcome).
    pub fn spawn(&self, request: ChildRequest) -> Result<Arc<EpisodeMachine>, RecursionError> {
        if let Some(reason) = self.stop_reason() {
            return Err(RecursionError::Stopped(reason));
        }
        let status = self.parent.status();
        if status != EpisodeStatus::Running {
            return Err(RecursionError::ParentNotRunning(status));
        }

        let parent = self.parent.episode();
        let policy = &parent.recursion_policy;

        let requested = parent.depth + 1;
        if requested > policy.max_depth {
            if policy.stops_on_depth_exceeded() {
                self.stop(format!("depth {requested} exceeds max {}", policy.max_depth));
            }
            return Err(RecursionError::DepthExceeded {
                requested,
                max: policy.max_depth,
            });
        }

        policy.permits_child_type(&request.child_type)?;
        let child_policy = match request.policy {
            Some(p) => {
                p.validate()?;
                p.ensure_no_looser_than(policy)?;
                p
            }
            None => policy.clone(),
        };

        if let Some(target) = request.purpose.action_target() {
            let acted_on = parent.side_effect_targets().any(|t| t == target);
            if acted_on || self.lock().action_targets.contains(target) {
                warn!(
                    episode_id = %parent.id,
                    %target,
                    "Refusing second action child for a target already acted on"
                );
                return Err(RecursionError::DuplicateSideEffect {
                    target: target.to_string(),
                });
            }
        }

        if let Some(dimension) = self.parent.guard().exhausted_dimension() {
            let reason = format!("parent budget exhausted ({dimension})");
            if policy.stops_on_budget_exhaustion() {
                self.stop(reason.clone());
            }
            return Err(RecursionError::Stopped(reason));
        }

        self.reserve_slots(policy)?;

        let fraction = request.budget_fraction.unwrap_or(self.default_fraction);
        let budget = match self.parent.guard().allocate_subcall_budget(fraction) {
            Ok(budget) => budget,
            Err(e) => {
                self.release_slots();
                if matches!(e, RecursionError::SubcallsExhausted { .. })
                    && policy.stops_on_budget_exhaustion()
                {
                    self.stop(e.to_string());
                }
                return Err(e);
            }
        };

        let mut episode = Episode::new(
            parent.client_id.clone(),
            parent.agent_id.clone(),
            request.goal,
            budget,
        )
        .with_inputs(request.inputs)
        .with_recursion_policy(child_policy);
        episode.depth = requested;
        episode.parent_episode_id = Some(parent.id.clone());
        episode.child_type = Some(request.child_type.clone());
        episode.inherited_targets = self.inherited_targets(&parent, request.purpose.action_target());

        let child = Arc::new(self.parent.spawn_child(episode));
        if let Some(target) = request.purpose.action_target() {
            self.lock().action_targets.insert(target.to_string());
        }
        self.children_lock().push(child.clone());

        info!(
            episode_id = %parent.id,
            child_episode_id = %child.id(),
            child_type = %request.child_type,
            depth = requested,
            purpose = ?request.purpose,
            "Child episode spawned"
        );
        self.parent.publish(DomainEvent::ChildSpawned {
            parent_episode_id: parent.id.to_string(),
            child_episode_id: child.id().to_string(),
            child_type: request.child_type,
            depth: requested,
            timestamp: Utc::now(),
        });
        Ok(child)
    }

    /// Targets a new child must leave alone: everything the parent line
    /// acted on plus targets claimed by earlier action children, except
    /// the child's own action target.
    fn inherited_targets(&self, parent: &Episode, own_target: Option<&str>) -> Vec<String> {
        let mut targets: Vec<String> = parent
            .side_effect_targets()
            .map(str::to_string)
            .chain(self.lock().action_targets.iter().cloned())
            .filter(|t| Some(t.as_str()) != own_target)
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Take one child slot and one chain slot, or neither.
    fn reserve_slots(&self, policy: &RecursionPolicy) -> Result<(), RecursionError> {
        self.children_spawned
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < policy.max_children).then_some(n + 1)
            })
            .map_err(|spawned| RecursionError::TooManyChildren {
                spawned,
                max: policy.max_children,
            })?;

        if let Err(total) = self
            .chain_total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < policy.max_total_episodes).then_some(n + 1)
            })
        {
            self.children_spawned.fetch_sub(1, Ordering::SeqCst);
            return Err(RecursionError::TooManyEpisodes {
                total,
                max: policy.max_total_episodes,
            });
        }
        Ok(())
    }

    fn release_slots(&self) {
        self.children_spawned.fetch_sub(1, Ordering::SeqCst);
        self.chain_total.fetch_sub(1, Ordering::SeqCst);
    }

    /// Fold a child's result into the parent: its usage is charged once,
    /// then the stop conditions are evaluated. Returns the stop reason if
    /// recursion is now stopped.
    pub fn record_child_outcome(
        &self,
        child: &EpisodeMachine,
        outcome: ChildOutcome,
    ) -> Option<String> {
        let first_report = self.lock().absorbed.insert(child.id().clone());
        if first_report {
            self.parent.absorb_child(child);
            self.parent.record_span(child_span(child, &outcome));
        }

        let policy = self.parent.episode().recursion_policy;
        let mut st = self.lock();
        if st.stopped.is_some() {
            return st.stopped.clone();
        }

        let reason = match &outcome {
            ChildOutcome::NewInformation => {
                st.consecutive_no_info = 0;
                None
            }
            ChildOutcome::NoNewInformation => {
                st.consecutive_no_info += 1;
                policy
                    .no_new_information_limit()
                    .filter(|limit| st.consecutive_no_info >= *limit)
                    .map(|limit| format!("{limit} consecutive children returned no new information"))
            }
            ChildOutcome::Failed { class } => {
                st.consecutive_no_info = 0;
                let count = st.failure_counts.entry(class.clone()).or_insert(0);
                *count += 1;
                let count = *count;
                policy
                    .repeated_failure_threshold()
                    .filter(|threshold| count >= *threshold)
                    .map(|_| format!("failure class '{class}' repeated {count} times"))
            }
            ChildOutcome::PolicyBlocked => policy
                .stops_on_policy_block()
                .then(|| "child was blocked by policy".to_string()),
            ChildOutcome::ObjectiveSatisfied => policy
                .stops_on_objective_satisfied()
                .then(|| "objective satisfied and verified".to_string()),
        };

        let reason = reason.or_else(|| {
            let dimension = self.parent.guard().exhausted_dimension()?;
            policy
                .stops_on_budget_exhaustion()
                .then(|| format!("parent budget exhausted ({dimension})"))
        });

        debug!(
            episode_id = %self.parent.id(),
            child_episode_id = %child.id(),
            ?outcome,
            "Child outcome recorded"
        );

        if let Some(reason) = &reason {
            info!(episode_id = %self.parent.id(), %reason, "Recursion stopped");
            st.stopped = Some(reason.clone());
        }
        reason
    }

    /// Cancel every child that is still running. Parents never cancel
    /// their children implicitly. Returns how many were cancelled.
    pub fn cascade_cancel(&self, reason: &str) -> usize {
        let cancelled = self
            .children()
            .iter()
            .filter(|child| child.cancel(format!("parent cancelled: {reason}")))
            .count();
        if cancelled > 0 {
            info!(episode_id = %self.parent.id(), cancelled, "Cascaded cancellation to children");
        }
        cancelled
    }

    fn stop(&self, reason: String) {
        let mut st = self.lock();
        if st.stopped.is_none() {
            info!(episode_id = %self.parent.id(), %reason, "Recursion stopped");
            st.stopped = Some(reason);
        }
    }
}

/// One span in the parent's trace covering a child from spawn to outcome.
fn child_span(child: &EpisodeMachine, outcome: &ChildOutcome) -> Span {
    let episode = child.episode();
    let mut span = Span::new(
        SpanKind::ChildEpisode,
        episode.child_type.as_deref().unwrap_or("child"),
    )
    .started(episode.created_at)
    .with_meta("child_episode_id", episode.id.to_string())
    .with_meta("status", episode.status.to_string())
    .with_meta("outcome", outcome.as_str());
    span.tokens_used = Some(episode.budget.tokens.used);
    match outcome {
        ChildOutcome::Failed { class } => span.fail(class.clone()),
        ChildOutcome::PolicyBlocked => span.fail("POLICY_DENIED"),
        _ => span.end(true),
    }
    span
}
