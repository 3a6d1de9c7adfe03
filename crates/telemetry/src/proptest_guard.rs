//! Property-based tests for the budget guard.
//!
//! Checks that usage only grows and never passes `max` under any call
//! sequence, and that child budgets never exceed half of what remains.

use proptest::prelude::*;

use tether_core::budget::{Budget, BudgetDimension};
use tether_core::error::RecursionError;

use super::guard::BudgetGuard;

fn limit() -> impl Strategy<Value = u64> {
    0u64..10_000
}

/// One simulated tool call: estimated tokens and reported tokens.
fn call() -> impl Strategy<Value = (u64, Option<u64>)> {
    (0u64..2_000, prop::option::of(0u64..5_000))
}

proptest! {
    /// Usage is non-decreasing and bounded by max after every call,
    /// and a denied call never reaches its handler.
    #[test]
    fn prop_usage_monotonic_and_bounded(
        max_tokens in limit(),
        max_tool_calls in 0u64..50,
        calls in prop::collection::vec(call(), 0..40),
    ) {
        let guard = BudgetGuard::new("ep", Budget::new(max_tokens, 3_600_000, max_tool_calls, 0));
        let mut last_tokens = 0;
        let mut last_calls = 0;

        for (estimate, actual) in calls {
            let before = guard.remaining_budget();
            match guard.reserve(estimate) {
                Ok(reservation) => {
                    if max_tokens > 0 {
                        prop_assert!(before.tokens.used + estimate <= max_tokens);
                    }
                    prop_assert!(before.tool_calls.used < max_tool_calls);
                    guard.reconcile(reservation, actual);
                }
                Err(denial) => {
                    // Nothing charged on denial.
                    let after = guard.remaining_budget();
                    prop_assert_eq!(after.tokens.used, before.tokens.used);
                    prop_assert_eq!(after.tool_calls.used, before.tool_calls.used);
                    prop_assert!(denial.dimension != BudgetDimension::Subcalls);
                }
            }

            let snap = guard.remaining_budget();
            prop_assert!(snap.tokens.used >= last_tokens);
            prop_assert!(snap.tool_calls.used >= last_calls);
            prop_assert!(snap.tokens.used <= snap.tokens.max);
            prop_assert!(snap.tool_calls.used <= snap.tool_calls.max);
            last_tokens = snap.tokens.used;
            last_calls = snap.tool_calls.used;
        }
    }

    /// Whatever fraction is requested, each child dimension is at most
    /// half of the parent's remaining budget.
    #[test]
    fn prop_child_budget_capped_at_half(
        max_tokens in limit(),
        max_time in 0u64..3_600_000,
        max_tool_calls in limit(),
        max_subcalls in 1u64..20,
        used_tokens in limit(),
        fraction in prop_oneof![
            -1.0f64..2.0,
            Just(f64::NAN),
            Just(f64::INFINITY),
            Just(0.5),
            Just(1.0),
        ],
    ) {
        let guard = BudgetGuard::new("ep", Budget::new(max_tokens, max_time, max_tool_calls, max_subcalls));
        if let Ok(r) = guard.reserve(0) {
            guard.reconcile(r, Some(used_tokens));
        }
        let parent = guard.remaining_budget();

        match guard.allocate_subcall_budget(fraction) {
            Ok(child) => {
                prop_assert!(child.tokens.max * 2 <= parent.tokens.remaining());
                prop_assert!(child.tool_calls.max * 2 <= parent.tool_calls.remaining());
                prop_assert!(child.subcalls.max * 2 <= parent.subcalls.remaining());
                prop_assert!(child.time_ms.max_ms * 2 <= parent.time.max_ms);
                prop_assert_eq!(child.tokens.used, 0);
                // metered parents only ever produce metered children
                prop_assert_eq!(child.tokens.max > 0, max_tokens > 0);
                prop_assert!(child.tool_calls.max > 0);
            }
            Err(RecursionError::BudgetBelowFloor { available, .. }) => {
                prop_assert_eq!(available, 0);
                prop_assert_eq!(guard.remaining_budget().subcalls.used, 0);
            }
            Err(other) => prop_assert!(false, "unexpected refusal: {other}"),
        }
    }
}
