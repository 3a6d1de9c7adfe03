//! Budget guard: atomic accounting and enforcement for one episode.
//!
//! The guard owns the only mutable copy of an episode's [`Budget`]. Every
//! tool call reserves through it before its handler runs and reconciles
//! afterwards; child budgets are carved out of it. All checks and charges
//! happen under one short lock, so concurrent calls from the same phase
//! never both pass a check that only one of them fits.
//!
//! Token estimates are held as a separate reservation while a call is in
//! flight, so `used` only ever grows.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tether_core::budget::{Budget, BudgetDimension, BudgetSnapshot};
use tether_core::error::RecursionError;
use tether_core::tool::ToolDefinition;

/// Hard cap on the share of remaining budget a child may receive.
pub const MAX_CHILD_FRACTION: f64 = 0.5;

/// Default consumption ratio that raises a wrap-up advisory.
pub const DEFAULT_ADVISORY_THRESHOLD: f64 = 0.7;

/// Smallest budget a child may be given. All zeros disables the check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetFloor {
    pub tokens: u64,
    pub time_ms: u64,
    pub tool_calls: u64,
}

/// A reservation refused before any work ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{dimension} budget exhausted ({used} of {max} used, {requested} requested)")]
pub struct BudgetDenial {
    pub dimension: BudgetDimension,
    pub used: u64,
    pub requested: u64,
    pub max: u64,
}

/// A dimension crossed the advisory threshold. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetAdvisory {
    pub dimension: BudgetDimension,
    pub ratio: f64,
}

/// Budget held for one in-flight call. Consumed by [`BudgetGuard::reconcile`].
#[derive(Debug)]
#[must_use = "a reservation must be reconciled"]
pub struct Reservation {
    tokens: u64,
    remaining_time_ms: u64,
}

impl Reservation {
    pub fn reserved_tokens(&self) -> u64 {
        self.tokens
    }

    /// Episode time left when the reservation was taken.
    pub fn remaining_time_ms(&self) -> u64 {
        self.remaining_time_ms
    }
}

/// Output of a guarded call plus any advisories it triggered.
#[derive(Debug)]
pub struct Guarded<T> {
    pub value: T,
    pub advisories: Vec<BudgetAdvisory>,
}

#[derive(Debug)]
struct GuardState {
    budget: Budget,
    reserved_tokens: u64,
    advised: HashSet<BudgetDimension>,
}

/// Guards exactly one episode's budget.
#[derive(Debug)]
pub struct BudgetGuard {
    episode_id: String,
    state: Mutex<GuardState>,
    advisory_threshold: f64,
    floor: BudgetFloor,
}

impl BudgetGuard {
    pub fn new(episode_id: impl Into<String>, budget: Budget) -> Self {
        Self {
            episode_id: episode_id.into(),
            state: Mutex::new(GuardState {
                budget,
                reserved_tokens: 0,
                advised: HashSet::new(),
            }),
            advisory_threshold: DEFAULT_ADVISORY_THRESHOLD,
            floor: BudgetFloor::default(),
        }
    }

    pub fn with_advisory_threshold(mut self, threshold: f64) -> Self {
        self.advisory_threshold = threshold;
        self
    }

    pub fn with_floor(mut self, floor: BudgetFloor) -> Self {
        self.floor = floor;
        self
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Tool calls ────────────────────────────────────────────────────

    /// Check and reserve budget for one tool call.
    ///
    /// Charges one tool call and holds `estimate_tokens` until
    /// [`reconcile`](Self::reconcile). Nothing is charged on denial.
    pub fn reserve(&self, estimate_tokens: u64) -> Result<Reservation, BudgetDenial> {
        let now = Utc::now();
        let mut st = self.lock();
        let budget = &st.budget;

        let metered = budget.tokens.max > 0;
        if metered {
            let committed = budget.tokens.used.saturating_add(st.reserved_tokens);
            if committed >= budget.tokens.max
                || committed.saturating_add(estimate_tokens) > budget.tokens.max
            {
                return Err(BudgetDenial {
                    dimension: BudgetDimension::Tokens,
                    used: committed,
                    requested: estimate_tokens,
                    max: budget.tokens.max,
                });
            }
        }

        if !budget.tool_calls.fits(1) {
            return Err(BudgetDenial {
                dimension: BudgetDimension::ToolCalls,
                used: budget.tool_calls.used,
                requested: 1,
                max: budget.tool_calls.max,
            });
        }

        let remaining_time_ms = budget.time_ms.remaining_ms(now);
        if remaining_time_ms == 0 {
            return Err(BudgetDenial {
                dimension: BudgetDimension::TimeMs,
                used: budget.time_ms.elapsed_ms(now),
                requested: 0,
                max: budget.time_ms.max_ms,
            });
        }

        st.budget.tool_calls.charge_clamped(1);
        let tokens = if metered { estimate_tokens } else { 0 };
        st.reserved_tokens = st.reserved_tokens.saturating_add(tokens);

        Ok(Reservation {
            tokens,
            remaining_time_ms,
        })
    }

    /// Release a reservation and charge actual usage (the estimate if the
    /// handler reported none), clamped at `max`.
    pub fn reconcile(&self, reservation: Reservation, actual_tokens: Option<u64>) -> Vec<BudgetAdvisory> {
        let mut st = self.lock();
        st.reserved_tokens = st.reserved_tokens.saturating_sub(reservation.tokens);

        if st.budget.tokens.max > 0 {
            let charge = actual_tokens.unwrap_or(reservation.tokens);
            let charged = st.budget.tokens.charge_clamped(charge);
            if charged < charge {
                tracing::warn!(
                    episode_id = %self.episode_id,
                    reported = charge,
                    charged,
                    "Token usage clamped at budget max"
                );
            }
        }

        self.collect_advisories(&mut st)
    }

    /// Run `f` under a reservation sized from the tool's estimated cost.
    ///
    /// `f` receives the remaining episode time in ms and returns its value
    /// together with the actual tokens it consumed, if known. On denial `f`
    /// is never called.
    pub async fn guard_tool_call<F, Fut, T>(
        &self,
        tool: &ToolDefinition,
        f: F,
    ) -> Result<Guarded<T>, BudgetDenial>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = (T, Option<u64>)>,
    {
        let estimate = tool.budget_cost.default_tokens.unwrap_or(0);
        let reservation = match self.reserve(estimate) {
            Ok(r) => r,
            Err(denial) => {
                tracing::info!(
                    episode_id = %self.episode_id,
                    tool_id = %tool.id,
                    %denial,
                    "Tool call denied by budget"
                );
                return Err(denial);
            }
        };

        let (value, actual) = f(reservation.remaining_time_ms).await;
        let advisories = self.reconcile(reservation, actual);
        Ok(Guarded { value, advisories })
    }

    // ── Children ──────────────────────────────────────────────────────

    /// Carve a child budget out of this episode's remaining budget.
    ///
    /// `fraction` is clamped to `[0, 0.5]`; each child dimension is at most
    /// `fraction * remaining`. Counts one subcall against this episode.
    /// Refused (with nothing charged) when no subcalls remain or the child
    /// would fall below the floor. A metered parent never yields an
    /// unmetered child: a token share that rounds to zero is refused.
    pub fn allocate_subcall_budget(&self, fraction: f64) -> Result<Budget, RecursionError> {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, MAX_CHILD_FRACTION)
        } else {
            0.0
        };
        // Parts per million keeps the cap exact for any u64.
        let ppm = (fraction * 1_000_000.0).floor() as u128;
        let share = |remaining: u64| (u128::from(remaining) * ppm / 1_000_000) as u64;

        let now = Utc::now();
        let mut st = self.lock();
        let budget = &st.budget;

        if !budget.subcalls.fits(1) {
            return Err(RecursionError::SubcallsExhausted {
                used: budget.subcalls.used,
                max: budget.subcalls.max,
            });
        }

        let metered = budget.tokens.max > 0;
        let tokens = if metered {
            share(budget.tokens.remaining().saturating_sub(st.reserved_tokens))
        } else {
            0
        };
        let time_ms = share(budget.time_ms.remaining_ms(now));
        let tool_calls = share(budget.tool_calls.remaining());
        let subcalls = share(budget.subcalls.remaining());

        let floor_checks = [
            (BudgetDimension::Tokens, metered, tokens, self.floor.tokens),
            (BudgetDimension::TimeMs, true, time_ms, self.floor.time_ms),
            (BudgetDimension::ToolCalls, true, tool_calls, self.floor.tool_calls),
        ];
        for (dimension, applies, available, floor) in floor_checks {
            // A zero share would read as unmetered (tokens) or as a child
            // that can do nothing, so every applicable dimension needs at
            // least one unit.
            let floor = floor.max(1);
            if applies && available < floor {
                return Err(RecursionError::BudgetBelowFloor {
                    dimension,
                    available,
                    floor,
                });
            }
        }

        st.budget.subcalls.charge_clamped(1);
        tracing::debug!(
            episode_id = %self.episode_id,
            fraction,
            tokens,
            time_ms,
            tool_calls,
            subcalls,
            "Allocated child budget"
        );
        Ok(Budget::new(tokens, time_ms, tool_calls, subcalls))
    }

    /// Charge a finished child's consumption to this episode, clamped.
    pub fn absorb_child_usage(&self, child: &BudgetSnapshot) -> Vec<BudgetAdvisory> {
        let mut st = self.lock();
        if st.budget.tokens.max > 0 {
            st.budget.tokens.charge_clamped(child.tokens.used);
        }
        st.budget.tool_calls.charge_clamped(child.tool_calls.used);
        self.collect_advisories(&mut st)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    /// Read-only view. Never use it to authorize work; reserve instead.
    pub fn remaining_budget(&self) -> BudgetSnapshot {
        self.lock().budget.snapshot(Utc::now())
    }

    pub fn budget(&self) -> Budget {
        self.lock().budget.clone()
    }

    pub fn reserved_tokens(&self) -> u64 {
        self.lock().reserved_tokens
    }

    pub fn exhausted_dimension(&self) -> Option<BudgetDimension> {
        self.lock().budget.exhausted_dimension(Utc::now())
    }

    /// Re-check advisories, e.g. for wall-clock time which moves without
    /// any charge.
    pub fn poll_advisories(&self) -> Vec<BudgetAdvisory> {
        let mut st = self.lock();
        self.collect_advisories(&mut st)
    }

    /// Has any dimension crossed the advisory threshold?
    pub fn should_wrap_up(&self) -> bool {
        !self.lock().advised.is_empty()
    }

    /// Each dimension is reported once, the first time it crosses.
    fn collect_advisories(&self, st: &mut GuardState) -> Vec<BudgetAdvisory> {
        let now = Utc::now();
        let mut out = Vec::new();
        for dimension in BudgetDimension::ALL {
            if st.advised.contains(&dimension) {
                continue;
            }
            let max = match dimension {
                BudgetDimension::Tokens => st.budget.tokens.max,
                BudgetDimension::TimeMs => st.budget.time_ms.max_ms,
                BudgetDimension::ToolCalls => st.budget.tool_calls.max,
                BudgetDimension::Subcalls => st.budget.subcalls.max,
            };
            if max == 0 {
                continue;
            }
            let ratio = st.budget.ratio(dimension, now);
            if ratio >= self.advisory_threshold {
                st.advised.insert(dimension);
                tracing::info!(
                    episode_id = %self.episode_id,
                    %dimension,
                    ratio,
                    "Budget advisory: consider wrapping up"
                );
                out.push(BudgetAdvisory { dimension, ratio });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_core::tool::{RiskLevel, ToolCategory};

    fn tool(tokens: Option<u64>) -> ToolDefinition {
        ToolDefinition::new("memory:read", ToolCategory::Read, RiskLevel::Read)
            .with_budget_cost(tokens, None)
    }

    #[tokio::test]
    async fn guarded_call_charges_actual_tokens() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 10, 2));
        let out = guard
            .guard_tool_call(&tool(Some(100)), |_| async { ("ok", Some(40)) })
            .await
            .unwrap();
        assert_eq!(out.value, "ok");

        let snap = guard.remaining_budget();
        assert_eq!(snap.tokens.used, 40);
        assert_eq!(snap.tool_calls.used, 1);
        assert_eq!(guard.reserved_tokens(), 0);
    }

    #[tokio::test]
    async fn estimate_charged_when_usage_unknown() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 10, 2));
        guard
            .guard_tool_call(&tool(Some(100)), |_| async { ((), None) })
            .await
            .unwrap();
        assert_eq!(guard.remaining_budget().tokens.used, 100);
    }

    #[tokio::test]
    async fn denied_call_never_runs() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 1, 2));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let _ = guard
                .guard_tool_call(&tool(None), |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ((), None)
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.remaining_budget().tool_calls.used, 1);
    }

    #[test]
    fn token_estimate_over_budget_is_denied() {
        let guard = BudgetGuard::new("ep-1", Budget::new(100, 60_000, 10, 2));
        let denial = guard.reserve(150).unwrap_err();
        assert_eq!(denial.dimension, BudgetDimension::Tokens);
        assert_eq!(guard.remaining_budget().tool_calls.used, 0);
    }

    #[test]
    fn concurrent_reservations_share_headroom() {
        let guard = BudgetGuard::new("ep-1", Budget::new(100, 60_000, 10, 2));
        let first = guard.reserve(60).unwrap();
        assert_eq!(guard.reserve(60).unwrap_err().dimension, BudgetDimension::Tokens);
        guard.reconcile(first, Some(10));
        assert!(guard.reserve(60).is_ok());
    }

    #[test]
    fn over_reporting_is_clamped() {
        let guard = BudgetGuard::new("ep-1", Budget::new(100, 60_000, 10, 2));
        let r = guard.reserve(10).unwrap();
        guard.reconcile(r, Some(500));
        let snap = guard.remaining_budget();
        assert_eq!(snap.tokens.used, 100);
        assert_eq!(guard.exhausted_dimension(), Some(BudgetDimension::Tokens));
    }

    #[test]
    fn unmetered_tokens_never_deny() {
        let guard = BudgetGuard::new("ep-1", Budget::new(0, 60_000, 10, 2));
        let r = guard.reserve(10_000).unwrap();
        assert!(guard.reconcile(r, Some(10_000)).is_empty());
        assert_eq!(guard.remaining_budget().tokens.used, 0);
    }

    #[test]
    fn expired_time_is_denied() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 0, 10, 2));
        assert_eq!(guard.reserve(0).unwrap_err().dimension, BudgetDimension::TimeMs);
    }

    #[test]
    fn advisory_raised_once_per_dimension() {
        let guard = BudgetGuard::new("ep-1", Budget::new(0, 600_000, 10, 2));
        let mut raised = Vec::new();
        for _ in 0..9 {
            let r = guard.reserve(0).unwrap();
            raised.extend(guard.reconcile(r, None));
        }
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].dimension, BudgetDimension::ToolCalls);
        assert!(raised[0].ratio >= 0.7);
        assert!(guard.should_wrap_up());
    }

    #[test]
    fn child_budget_is_clamped_to_half() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 10, 4));
        let child = guard.allocate_subcall_budget(0.9).unwrap();
        assert_eq!(child.tokens.max, 500);
        assert_eq!(child.tool_calls.max, 5);
        assert_eq!(child.subcalls.max, 2);
        assert!(child.time_ms.max_ms <= 30_000);
        assert_eq!(guard.remaining_budget().subcalls.used, 1);
    }

    #[test]
    fn child_budget_uses_remaining_not_max() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 10, 4));
        let r = guard.reserve(0).unwrap();
        guard.reconcile(r, Some(600));
        let child = guard.allocate_subcall_budget(0.25).unwrap();
        assert_eq!(child.tokens.max, 100);
    }

    #[test]
    fn child_below_floor_is_refused_without_charge() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 10, 4)).with_floor(
            BudgetFloor {
                tokens: 400,
                time_ms: 0,
                tool_calls: 0,
            },
        );
        let err = guard.allocate_subcall_budget(0.25).unwrap_err();
        assert!(matches!(
            err,
            RecursionError::BudgetBelowFloor {
                dimension: BudgetDimension::Tokens,
                available: 250,
                floor: 400
            }
        ));
        assert_eq!(guard.remaining_budget().subcalls.used, 0);
    }

    #[test]
    fn zero_token_share_is_refused_not_unmetered() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 10, 4));
        let r = guard.reserve(0).unwrap();
        guard.reconcile(r, Some(999));

        let err = guard.allocate_subcall_budget(0.5).unwrap_err();
        assert_eq!(
            err,
            RecursionError::BudgetBelowFloor {
                dimension: BudgetDimension::Tokens,
                available: 0,
                floor: 1,
            }
        );
        assert_eq!(guard.remaining_budget().subcalls.used, 0);

        // a tiny fraction of a healthy budget rounds down the same way
        let guard = BudgetGuard::new("ep-2", Budget::new(1_000, 60_000, 10, 4));
        assert!(matches!(
            guard.allocate_subcall_budget(0.0001),
            Err(RecursionError::BudgetBelowFloor { .. })
        ));
    }

    #[test]
    fn unmetered_parent_may_yield_unmetered_child() {
        let guard = BudgetGuard::new("ep-1", Budget::new(0, 60_000, 10, 4));
        let child = guard.allocate_subcall_budget(0.5).unwrap();
        assert_eq!(child.tokens.max, 0);
        assert_eq!(child.tool_calls.max, 5);
    }

    #[test]
    fn zero_tool_call_share_is_refused() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 1, 4));
        assert!(matches!(
            guard.allocate_subcall_budget(0.5),
            Err(RecursionError::BudgetBelowFloor {
                dimension: BudgetDimension::ToolCalls,
                ..
            })
        ));
    }

    #[test]
    fn subcalls_exhausted() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 10, 1));
        assert!(guard.allocate_subcall_budget(0.1).is_ok());
        assert!(matches!(
            guard.allocate_subcall_budget(0.1),
            Err(RecursionError::SubcallsExhausted { used: 1, max: 1 })
        ));
    }

    #[test]
    fn child_usage_rolls_up() {
        let guard = BudgetGuard::new("ep-1", Budget::new(1_000, 60_000, 10, 2));
        let mut child = guard.allocate_subcall_budget(0.5).unwrap();
        child.tokens.used = 300;
        child.tool_calls.used = 4;
        guard.absorb_child_usage(&child.snapshot(Utc::now()));

        let snap = guard.remaining_budget();
        assert_eq!(snap.tokens.used, 300);
        assert_eq!(snap.tool_calls.used, 4);
    }
}
