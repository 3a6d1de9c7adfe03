//! Budget domain types: the resource ledger of one episode.
//!
//! These are plain values. Enforcement (atomic check-and-reserve,
//! reconciliation, advisories, child allocation) lives in the
//! `tether-telemetry` budget guard, which owns the only mutable copy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One of the four metered resource dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Tokens,
    TimeMs,
    ToolCalls,
    Subcalls,
}

impl BudgetDimension {
    pub const ALL: [BudgetDimension; 4] = [
        BudgetDimension::Tokens,
        BudgetDimension::TimeMs,
        BudgetDimension::ToolCalls,
        BudgetDimension::Subcalls,
    ];
}

impl std::fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tokens => write!(f, "tokens"),
            Self::TimeMs => write!(f, "time_ms"),
            Self::ToolCalls => write!(f, "tool_calls"),
            Self::Subcalls => write!(f, "subcalls"),
        }
    }
}

/// A `used / max` counter. `used` never exceeds `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub used: u64,
    pub max: u64,
}

impl Counter {
    pub fn new(max: u64) -> Self {
        Self { used: 0, max }
    }

    pub fn remaining(&self) -> u64 {
        self.max.saturating_sub(self.used)
    }

    /// Would consuming `amount` more stay within `max`?
    pub fn fits(&self, amount: u64) -> bool {
        self.used.saturating_add(amount) <= self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// Fraction consumed in `[0, 1]`. A zero-max counter reads as fully used.
    pub fn ratio(&self) -> f64 {
        if self.max == 0 {
            return 1.0;
        }
        (self.used as f64 / self.max as f64).min(1.0)
    }

    /// Add `amount`, clamped at `max`. Returns the amount actually added.
    pub fn charge_clamped(&mut self, amount: u64) -> u64 {
        let before = self.used;
        self.used = self.used.saturating_add(amount).min(self.max);
        self.used - before
    }
}

/// Wall-clock allowance measured from `started_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBudget {
    pub started_at: DateTime<Utc>,
    pub max_ms: u64,
}

impl TimeBudget {
    pub fn new(max_ms: u64) -> Self {
        Self {
            started_at: Utc::now(),
            max_ms,
        }
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        now.signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        self.max_ms.saturating_sub(self.elapsed_ms(now))
    }

    pub fn ratio(&self, now: DateTime<Utc>) -> f64 {
        if self.max_ms == 0 {
            return 1.0;
        }
        (self.elapsed_ms(now) as f64 / self.max_ms as f64).min(1.0)
    }
}

/// The mutable resource ledger scoped to one episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub tokens: Counter,
    pub time_ms: TimeBudget,
    pub tool_calls: Counter,
    /// Children spawned.
    pub subcalls: Counter,
}

impl Budget {
    /// Create a fresh budget whose clock starts now.
    pub fn new(max_tokens: u64, max_time_ms: u64, max_tool_calls: u64, max_subcalls: u64) -> Self {
        Self {
            tokens: Counter::new(max_tokens),
            time_ms: TimeBudget::new(max_time_ms),
            tool_calls: Counter::new(max_tool_calls),
            subcalls: Counter::new(max_subcalls),
        }
    }

    /// Rebuild a budget from a snapshot, re-basing the clock so that the
    /// elapsed time recorded in the snapshot is preserved.
    pub fn from_snapshot(snapshot: &BudgetSnapshot, now: DateTime<Utc>) -> Self {
        let elapsed = i64::try_from(snapshot.time.elapsed_ms).unwrap_or(i64::MAX);
        Self {
            tokens: snapshot.tokens,
            time_ms: TimeBudget {
                started_at: now - Duration::milliseconds(elapsed),
                max_ms: snapshot.time.max_ms,
            },
            tool_calls: snapshot.tool_calls,
            subcalls: snapshot.subcalls,
        }
    }

    /// First dimension that leaves no room for further work, if any.
    ///
    /// Subcalls are not considered: an episode that cannot spawn children
    /// can still work inline.
    pub fn exhausted_dimension(&self, now: DateTime<Utc>) -> Option<BudgetDimension> {
        if self.tokens.max > 0 && self.tokens.is_exhausted() {
            return Some(BudgetDimension::Tokens);
        }
        if self.time_ms.remaining_ms(now) == 0 {
            return Some(BudgetDimension::TimeMs);
        }
        if self.tool_calls.is_exhausted() {
            return Some(BudgetDimension::ToolCalls);
        }
        None
    }

    /// Consumed fraction for a dimension.
    pub fn ratio(&self, dimension: BudgetDimension, now: DateTime<Utc>) -> f64 {
        match dimension {
            BudgetDimension::Tokens => self.tokens.ratio(),
            BudgetDimension::TimeMs => self.time_ms.ratio(now),
            BudgetDimension::ToolCalls => self.tool_calls.ratio(),
            BudgetDimension::Subcalls => self.subcalls.ratio(),
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BudgetSnapshot {
        BudgetSnapshot {
            tokens: self.tokens,
            tool_calls: self.tool_calls,
            subcalls: self.subcalls,
            time: TimeUsage {
                elapsed_ms: self.time_ms.elapsed_ms(now).min(self.time_ms.max_ms),
                max_ms: self.time_ms.max_ms,
            },
            taken_at: now,
        }
    }
}

/// Elapsed/max wall-clock usage, detached from any absolute start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeUsage {
    pub elapsed_ms: u64,
    pub max_ms: u64,
}

impl TimeUsage {
    pub fn remaining_ms(&self) -> u64 {
        self.max_ms.saturating_sub(self.elapsed_ms)
    }
}

/// A read-only, serializable view of a budget at one instant.
///
/// Never use a snapshot to authorize work: go through the guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub tokens: Counter,
    pub tool_calls: Counter,
    pub subcalls: Counter,
    pub time: TimeUsage,
    pub taken_at: DateTime<Utc>,
}

impl BudgetSnapshot {
    pub fn remaining(&self, dimension: BudgetDimension) -> u64 {
        match dimension {
            BudgetDimension::Tokens => self.tokens.remaining(),
            BudgetDimension::TimeMs => self.time.remaining_ms(),
            BudgetDimension::ToolCalls => self.tool_calls.remaining(),
            BudgetDimension::Subcalls => self.subcalls.remaining(),
        }
    }

    pub fn max(&self, dimension: BudgetDimension) -> u64 {
        match dimension {
            BudgetDimension::Tokens => self.tokens.max,
            BudgetDimension::TimeMs => self.time.max_ms,
            BudgetDimension::ToolCalls => self.tool_calls.max,
            BudgetDimension::Subcalls => self.subcalls.max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_charges_are_clamped() {
        let mut c = Counter::new(10);
        assert_eq!(c.charge_clamped(7), 7);
        assert_eq!(c.charge_clamped(7), 3);
        assert_eq!(c.used, 10);
        assert!(c.is_exhausted());
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn counter_fits() {
        let c = Counter { used: 8, max: 10 };
        assert!(c.fits(2));
        assert!(!c.fits(3));
        assert!(!c.fits(u64::MAX));
    }

    #[test]
    fn fresh_budget_is_not_exhausted() {
        let budget = Budget::new(1_000, 60_000, 10, 2);
        assert_eq!(budget.exhausted_dimension(Utc::now()), None);
    }

    #[test]
    fn zero_tool_calls_is_exhausted() {
        let budget = Budget::new(1_000, 60_000, 0, 2);
        assert_eq!(
            budget.exhausted_dimension(Utc::now()),
            Some(BudgetDimension::ToolCalls)
        );
    }

    #[test]
    fn snapshot_roundtrip_preserves_elapsed_time() {
        let mut budget = Budget::new(1_000, 60_000, 10, 2);
        budget.time_ms.started_at = Utc::now() - Duration::milliseconds(5_000);
        budget.tokens.used = 400;

        let snap = budget.snapshot(Utc::now());
        assert!(snap.time.elapsed_ms >= 5_000);

        // Resume an hour later: downtime does not count, elapsed time does.
        let later = Utc::now() + Duration::hours(1);
        let restored = Budget::from_snapshot(&snap, later);
        let elapsed = restored.time_ms.elapsed_ms(later);
        assert!(elapsed >= 5_000 && elapsed < 6_000);
        assert_eq!(restored.tokens.used, 400);
    }

    #[test]
    fn dimension_display() {
        assert_eq!(BudgetDimension::Tokens.to_string(), "tokens");
        assert_eq!(BudgetDimension::TimeMs.to_string(), "time_ms");
        assert_eq!(BudgetDimension::ToolCalls.to_string(), "tool_calls");
        assert_eq!(BudgetDimension::Subcalls.to_string(), "subcalls");
    }
}
