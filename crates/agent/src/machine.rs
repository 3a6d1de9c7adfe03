//! The episode state machine.
//!
//! Owns the lifecycle of one episode:
//!
//! ```text
//! pending ──► running ──► completed
//!               │   ├──► failed
//!               │   ├──► escalated
//!               └───┴──► cancelled   (also from pending)
//! ```
//!
//! While `running` the episode walks the ordered phases
//! `intake → plan → act → verify → commit`. Phases are positions inside
//! `running`, not states of their own. Terminal states never change again.
//!
//! Every tool call the episode makes goes through the shared
//! [`ToolWrapper`] with this episode's [`BudgetGuard`]. The kill switch is
//! checked before each call.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_config::PhasesConfig;
use tether_core::checkpoint::{Checkpoint, CheckpointStore};
use tether_core::episode::{
    Episode, EpisodeId, EpisodeStatus, EscalationTicket, FailureSummary, Phase, SideEffectRecord,
    TerminalSummary,
};
use tether_core::error::{CheckpointError, EpisodeError, Error, RecursionError};
use tether_core::event::{DomainEvent, EventBus};
use tether_core::tool::{
    InvocationContext, InvocationOptions, ToolErrorCode, ToolInvocation, ToolResult,
};
use tether_security::KillSwitch;
use tether_telemetry::{
    BudgetAdvisory, BudgetFloor, BudgetGuard, DEFAULT_ADVISORY_THRESHOLD, Span, SpanKind,
};
use tether_tools::ToolWrapper;

/// Outcome of [`EpisodeMachine::advance_phase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    Advanced { from: Phase, to: Phase },
    /// Required outputs were missing, so the episode is now `escalated`.
    Escalated { phase: Phase, missing: Vec<String> },
}

#[derive(Debug)]
struct MachineState {
    episode: Episode,
    last_failure: Option<FailureSummary>,
    phase_started_at: DateTime<Utc>,
}

/// Counts a tool call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drives one episode. Safe to share by `Arc` between the task running the
/// episode and anything that may cancel it.
pub struct EpisodeMachine {
    id: EpisodeId,
    state: Mutex<MachineState>,
    guard: Arc<BudgetGuard>,
    wrapper: Arc<ToolWrapper>,
    kill_switch: Arc<KillSwitch>,
    cancel: CancellationToken,
    in_flight: AtomicUsize,
    phases: PhasesConfig,
    events: Option<Arc<EventBus>>,
    advisory_threshold: f64,
    floor: BudgetFloor,
}

impl std::fmt::Debug for EpisodeMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("EpisodeMachine")
            .field("id", &self.id)
            .field("status", &st.episode.status)
            .field("phase", &st.episode.phase)
            .field("depth", &st.episode.depth)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl EpisodeMachine {
    pub fn new(episode: Episode, wrapper: Arc<ToolWrapper>, kill_switch: Arc<KillSwitch>) -> Self {
        let id = episode.id.clone();
        let guard = Arc::new(BudgetGuard::new(id.to_string(), episode.budget.clone()));
        Self {
            id,
            state: Mutex::new(MachineState {
                episode,
                last_failure: None,
                phase_started_at: Utc::now(),
            }),
            guard,
            wrapper,
            kill_switch,
            cancel: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            phases: PhasesConfig::default(),
            events: None,
            advisory_threshold: DEFAULT_ADVISORY_THRESHOLD,
            floor: BudgetFloor::default(),
        }
    }

    /// Rebuild an episode from a checkpoint, in `running` at the saved
    /// phase with the saved budget.
    pub fn resume(
        checkpoint: &Checkpoint,
        wrapper: Arc<ToolWrapper>,
        kill_switch: Arc<KillSwitch>,
    ) -> Result<Self, CheckpointError> {
        let episode = checkpoint.restore(Utc::now())?;
        info!(
            episode_id = %episode.id,
            checkpoint_id = %checkpoint.id,
            phase = %episode.phase,
            "Episode resumed from checkpoint"
        );
        Ok(Self::new(episode, wrapper, kill_switch))
    }

    /// Required outputs per phase. Phases without an entry advance freely.
    pub fn with_phase_requirements(mut self, phases: PhasesConfig) -> Self {
        self.phases = phases;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_advisory_threshold(mut self, threshold: f64) -> Self {
        self.advisory_threshold = threshold;
        self.guard = Arc::new(self.build_guard());
        self
    }

    /// Smallest budget this episode may hand to a child.
    pub fn with_budget_floor(mut self, floor: BudgetFloor) -> Self {
        self.floor = floor;
        self.guard = Arc::new(self.build_guard());
        self
    }

    fn build_guard(&self) -> BudgetGuard {
        BudgetGuard::new(self.id.to_string(), self.lock().episode.budget.clone())
            .with_advisory_threshold(self.advisory_threshold)
            .with_floor(self.floor)
    }

    /// A machine for a child episode, sharing this machine's collaborators.
    /// The child gets its own cancellation token.
    pub(crate) fn spawn_child(&self, episode: Episode) -> Self {
        let mut child = Self::new(episode, self.wrapper.clone(), self.kill_switch.clone());
        child.phases = self.phases.clone();
        child.events = self.events.clone();
        child.advisory_threshold = self.advisory_threshold;
        child.floor = self.floor;
        child.guard = Arc::new(child.build_guard());
        child
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn id(&self) -> &EpisodeId {
        &self.id
    }

    /// Snapshot of the episode, with the budget as the guard sees it now.
    pub fn episode(&self) -> Episode {
        let mut episode = self.lock().episode.clone();
        episode.budget = self.guard.budget();
        episode
    }

    pub fn status(&self) -> EpisodeStatus {
        self.lock().episode.status
    }

    pub fn phase(&self) -> Phase {
        self.lock().episode.phase
    }

    pub fn depth(&self) -> u32 {
        self.lock().episode.depth
    }

    pub fn summary(&self) -> Option<TerminalSummary> {
        self.lock().episode.summary.clone()
    }

    pub fn last_failure(&self) -> Option<FailureSummary> {
        self.lock().last_failure.clone()
    }

    pub fn guard(&self) -> &Arc<BudgetGuard> {
        &self.guard
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Has the budget crossed the wrap-up threshold on any dimension?
    pub fn should_wrap_up(&self) -> bool {
        self.guard.should_wrap_up()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// `pending → running`. An episode whose budget is already exhausted
    /// fails immediately instead.
    pub fn start(&self) -> Result<(), EpisodeError> {
        let mut st = self.lock();
        match st.episode.status {
            EpisodeStatus::Pending => {}
            status if status.is_terminal() => return Err(self.terminal_error(status)),
            status => return Err(self.invalid_transition(&status.to_string(), "running")),
        }

        if let Some(dimension) = self.guard.exhausted_dimension() {
            self.terminate(
                &mut st,
                EpisodeStatus::Failed,
                format!("budget exhausted at start ({dimension})"),
                None,
            );
            return Err(EpisodeError::BudgetExhausted {
                episode_id: self.id.to_string(),
                dimension,
            });
        }

        let now = Utc::now();
        st.episode.status = EpisodeStatus::Running;
        st.episode.updated_at = now;
        st.phase_started_at = now;
        info!(
            episode_id = %self.id,
            client_id = %st.episode.client_id,
            depth = st.episode.depth,
            goal = %st.episode.goal,
            "Episode started"
        );
        self.publish(DomainEvent::EpisodeStarted {
            episode_id: self.id.to_string(),
            client_id: st.episode.client_id.clone(),
            depth: st.episode.depth,
            timestamp: now,
        });
        Ok(())
    }

    /// Store an output produced by the current phase.
    pub fn record_output(&self, key: impl Into<String>, value: Value) -> Result<(), EpisodeError> {
        let mut st = self.lock();
        self.ensure_running(&st)?;
        let phase = st.episode.phase;
        st.episode.outputs.insert(phase, key, value);
        st.episode.touch();
        Ok(())
    }

    /// Move to the next phase if the current one produced its required
    /// outputs. Otherwise the episode is escalated.
    pub fn advance_phase(&self) -> Result<PhaseTransition, EpisodeError> {
        self.check_kill_switch()?;
        let mut st = self.lock();
        self.ensure_running(&st)?;

        let from = st.episode.phase;
        let Some(to) = from.next() else {
            return Err(self.invalid_transition(from.as_str(), "next phase"));
        };

        let missing: Vec<String> = st
            .episode
            .outputs
            .missing(from, self.phases.required_for(from))
            .into_iter()
            .map(String::from)
            .collect();

        if !missing.is_empty() {
            let reason = format!(
                "phase {from} missing required outputs: {}",
                missing.join(", ")
            );
            self.record_phase_span(&st, from, false);
            let ticket = EscalationTicket {
                details: Some(json!({ "phase": from, "missing": &missing })),
                ..EscalationTicket::new(reason.clone())
            };
            self.terminate(&mut st, EpisodeStatus::Escalated, reason, Some(ticket));
            return Ok(PhaseTransition::Escalated {
                phase: from,
                missing,
            });
        }

        self.record_phase_span(&st, from, true);
        let now = Utc::now();
        st.episode.phase = to;
        st.episode.updated_at = now;
        st.phase_started_at = now;
        info!(episode_id = %self.id, %from, %to, "Phase advanced");
        self.publish(DomainEvent::PhaseAdvanced {
            episode_id: self.id.to_string(),
            from,
            to,
            timestamp: now,
        });
        Ok(PhaseTransition::Advanced { from, to })
    }

    /// Cancel from any non-terminal state. Idempotent: returns `false` if
    /// the episode had already ended. Does not wait for in-flight calls;
    /// their results are discarded when they return.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut st = self.lock();
        if st.episode.status.is_terminal() {
            debug!(episode_id = %self.id, status = %st.episode.status, "Cancel ignored; episode already terminal");
            return false;
        }
        self.terminate(&mut st, EpisodeStatus::Cancelled, reason, None);
        true
    }

    pub fn complete(&self) -> Result<(), EpisodeError> {
        self.finish(EpisodeStatus::Completed, "objective completed".into(), None)
    }

    pub fn fail(&self, reason: impl Into<String>) -> Result<(), EpisodeError> {
        self.finish(EpisodeStatus::Failed, reason.into(), None)
    }

    /// Hand off to a human or another system.
    pub fn escalate(&self, ticket: EscalationTicket) -> Result<(), EpisodeError> {
        let reason = ticket.reason.clone();
        self.finish(EpisodeStatus::Escalated, reason, Some(ticket))
    }

    fn finish(
        &self,
        status: EpisodeStatus,
        reason: String,
        ticket: Option<EscalationTicket>,
    ) -> Result<(), EpisodeError> {
        let mut st = self.lock();
        self.ensure_running(&st)?;
        self.terminate(&mut st, status, reason, ticket);
        Ok(())
    }

    /// Cancel if the kill switch is engaged.
    pub fn check_kill_switch(&self) -> Result<(), EpisodeError> {
        if !self.kill_switch.is_engaged() {
            return Ok(());
        }
        let reason = self
            .kill_switch
            .reason()
            .unwrap_or_else(|| "emergency stop".to_string());
        warn!(episode_id = %self.id, %reason, "Kill switch engaged; cancelling episode");
        self.cancel(format!("kill switch engaged: {reason}"));
        Err(self.terminal_error(self.status()))
    }

    // ── Tool calls ────────────────────────────────────────────────────

    pub async fn invoke_tool(&self, tool_id: &str, input: Value) -> Result<ToolResult, Error> {
        self.invoke_tool_with(tool_id, input, InvocationOptions::default())
            .await
    }

    /// Run one tool call through the pipeline on behalf of this episode.
    ///
    /// Terminal episodes reject the call with `EPISODE_TERMINAL`. A call
    /// that returns after the episode ended has its result discarded and
    /// is reported the same way. A publish or side-effect call on a target
    /// an ancestor already acted on is refused before it reaches the
    /// pipeline.
    pub async fn invoke_tool_with(
        &self,
        tool_id: &str,
        input: Value,
        options: InvocationOptions,
    ) -> Result<ToolResult, Error> {
        self.check_kill_switch()?;

        let side_effecting = self
            .wrapper
            .registry()
            .get(tool_id)
            .is_some_and(|def| def.is_side_effecting());
        let target = input
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or(tool_id)
            .to_string();

        let (context, in_flight) = {
            let st = self.lock();
            self.ensure_running(&st)?;
            if side_effecting && st.episode.is_inherited_target(&target) {
                warn!(
                    episode_id = %self.id,
                    tool_id,
                    %target,
                    "Refusing side effect on a target an ancestor already acted on"
                );
                return Err(RecursionError::DuplicateSideEffect { target }.into());
            }
            let context = InvocationContext {
                episode_id: self.id.to_string(),
                client_id: st.episode.client_id.clone(),
                agent_id: st.episode.agent_id.clone(),
                request_id: None,
                parent_tool_call_id: None,
            };
            (context, InFlight::enter(&self.in_flight))
        };

        let invocation = ToolInvocation {
            tool_id: tool_id.to_string(),
            input,
            context,
            options,
        };
        let invoked = self
            .wrapper
            .invoke_with_cancel(invocation, &self.guard, &self.cancel)
            .await;
        drop(in_flight);
        let invoked = invoked?;
        let result = invoked.value;

        {
            let mut st = self.lock();
            if st.episode.status.is_terminal() {
                debug!(
                    episode_id = %self.id,
                    tool_id,
                    status = %st.episode.status,
                    "Discarding result of call that finished after the episode ended"
                );
                return Err(self.terminal_error(st.episode.status).into());
            }

            if side_effecting && handler_ran(&result) {
                st.episode.side_effects.push(SideEffectRecord {
                    tool_id: tool_id.to_string(),
                    target,
                    invocation_id: result.metadata.invocation_id.clone(),
                    success: result.success,
                    recorded_at: Utc::now(),
                });
            }
            if let Some(err) = &result.error {
                let message = match &err.handler_code {
                    Some(code) => format!("{code}: {}", err.message),
                    None => err.message.clone(),
                };
                st.last_failure = Some(FailureSummary {
                    tool_id: tool_id.to_string(),
                    code: err.code.as_str().to_string(),
                    message,
                    retry_count: result.metadata.retry_count,
                });
            }
            st.episode.budget = self.guard.budget();
            st.episode.touch();
        }

        self.publish(DomainEvent::ToolInvoked {
            episode_id: self.id.to_string(),
            tool_id: tool_id.to_string(),
            success: result.success,
            error_code: result.error_code().map(|c| c.as_str().to_string()),
            retry_count: result.metadata.retry_count,
            duration_ms: result.metadata.duration_ms,
            timestamp: Utc::now(),
        });
        self.publish_advisories(invoked.advisories);

        Ok(result)
    }

    /// Run independent calls of one phase concurrently. Each call reserves
    /// its budget atomically before its handler starts, so two calls never
    /// both pass a check only one of them fits. Results keep input order.
    pub async fn invoke_batch(&self, calls: Vec<(String, Value)>) -> Vec<Result<ToolResult, Error>> {
        join_all(
            calls
                .into_iter()
                .map(|(tool_id, input)| async move { self.invoke_tool(&tool_id, input).await }),
        )
        .await
    }

    /// Re-check advisories that move without a charge (wall-clock time).
    pub fn poll_advisories(&self) -> Vec<BudgetAdvisory> {
        let advisories = self.guard.poll_advisories();
        self.publish_advisories(advisories.clone());
        advisories
    }

    /// Charge a child's consumption to this episode and take over its
    /// side-effect ledger.
    pub(crate) fn absorb_child(&self, child: &EpisodeMachine) {
        let usage = child.guard.remaining_budget();
        let advisories = self.guard.absorb_child_usage(&usage);
        let child_effects = child.lock().episode.side_effects.clone();
        {
            let mut st = self.lock();
            if !st.episode.status.is_terminal() {
                st.episode.side_effects.extend(child_effects);
                st.episode.budget = self.guard.budget();
                st.episode.touch();
            }
        }
        debug!(
            episode_id = %self.id,
            child_episode_id = %child.id,
            tokens = usage.tokens.used,
            tool_calls = usage.tool_calls.used,
            "Absorbed child usage"
        );
        self.publish_advisories(advisories);
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    /// Persist a snapshot at the current phase boundary. Refused while a
    /// tool call is in flight or once the episode has ended.
    pub async fn checkpoint(&self, store: &dyn CheckpointStore) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = {
            let st = self.lock();
            let in_flight = self.in_flight();
            if in_flight > 0 {
                return Err(CheckpointError::InFlight(in_flight));
            }
            if st.episode.status.is_terminal() {
                return Err(CheckpointError::NotResumable {
                    episode_id: self.id.to_string(),
                    status: st.episode.status,
                });
            }
            let mut episode = st.episode.clone();
            episode.budget = self.guard.budget();
            Checkpoint::capture(&episode, self.guard.remaining_budget())?
        };

        let checkpoint_id = store.save(checkpoint.clone()).await?;
        info!(
            episode_id = %self.id,
            %checkpoint_id,
            phase = %checkpoint.current_phase,
            "Checkpoint saved"
        );

        if let Some(recorder) = self.wrapper.recorder() {
            let mut span = Span::new(SpanKind::Checkpoint, checkpoint.current_phase.as_str())
                .with_meta("checkpoint_id", checkpoint_id.clone());
            span.end(true);
            recorder.record_span(self.id.as_str(), span);
        }
        self.publish(DomainEvent::CheckpointSaved {
            episode_id: self.id.to_string(),
            checkpoint_id,
            phase: checkpoint.current_phase,
            timestamp: Utc::now(),
        });
        Ok(checkpoint)
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn ensure_running(&self, st: &MachineState) -> Result<(), EpisodeError> {
        match st.episode.status {
            EpisodeStatus::Running => Ok(()),
            status if status.is_terminal() => Err(self.terminal_error(status)),
            status => Err(self.invalid_transition(&status.to_string(), "running work")),
        }
    }

    fn terminal_error(&self, status: EpisodeStatus) -> EpisodeError {
        EpisodeError::Terminal {
            episode_id: self.id.to_string(),
            status,
        }
    }

    fn invalid_transition(&self, from: &str, to: &str) -> EpisodeError {
        EpisodeError::InvalidTransition {
            episode_id: self.id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn terminate(
        &self,
        st: &mut MachineState,
        status: EpisodeStatus,
        reason: String,
        ticket: Option<EscalationTicket>,
    ) {
        let now = Utc::now();
        st.episode.status = status;
        st.episode.budget = self.guard.budget();
        st.episode.updated_at = now;
        st.episode.summary = Some(TerminalSummary {
            status,
            reason: reason.clone(),
            phase: st.episode.phase,
            last_failure: st.last_failure.clone(),
            ticket,
            budget: self.guard.remaining_budget(),
            finished_at: now,
        });

        match status {
            EpisodeStatus::Failed | EpisodeStatus::Escalated => warn!(
                episode_id = %self.id,
                %status,
                phase = %st.episode.phase,
                %reason,
                last_failure = ?st.last_failure.as_ref().map(ToString::to_string),
                "Episode ended"
            ),
            _ => info!(
                episode_id = %self.id,
                %status,
                phase = %st.episode.phase,
                %reason,
                "Episode ended"
            ),
        }

        self.cancel.cancel();
        if let Some(recorder) = self.wrapper.recorder() {
            recorder.end_trace(self.id.as_str());
        }
        self.publish(DomainEvent::EpisodeTerminated {
            episode_id: self.id.to_string(),
            status,
            reason,
            timestamp: now,
        });
    }

    fn record_phase_span(&self, st: &MachineState, phase: Phase, success: bool) {
        let Some(recorder) = self.wrapper.recorder() else {
            return;
        };
        let mut span = Span::new(SpanKind::Phase, phase.as_str()).started(st.phase_started_at);
        span.end(success);
        recorder.record_span(self.id.as_str(), span);
    }

    /// Add a span to this episode's trace, if tracing is on.
    pub(crate) fn record_span(&self, span: Span) {
        if let Some(recorder) = self.wrapper.recorder() {
            recorder.record_span(self.id.as_str(), span);
        }
    }

    fn publish_advisories(&self, advisories: Vec<BudgetAdvisory>) {
        for advisory in advisories {
            info!(
                episode_id = %self.id,
                dimension = %advisory.dimension,
                ratio = advisory.ratio,
                "Budget advisory: consider wrapping up"
            );
            self.publish(DomainEvent::BudgetAdvisory {
                episode_id: self.id.to_string(),
                dimension: advisory.dimension,
                ratio: advisory.ratio,
                timestamp: Utc::now(),
            });
        }
    }

    pub(crate) fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

/// Did the call get as far as running its handler?
fn handler_ran(result: &ToolResult) -> bool {
    if result.success {
        return true;
    }
    let queued = result
        .error
        .as_ref()
        .and_then(|e| e.details.as_ref())
        .and_then(|d| d.get("queued"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    !queued
        && matches!(
            result.error_code(),
            Some(ToolErrorCode::Timeout | ToolErrorCode::ExecutionError | ToolErrorCode::InternalError)
        )
}
