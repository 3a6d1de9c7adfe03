//! Retry/backoff arithmetic, kept free of any sleeping so it can be tested
//! without real delays.

use std::time::Duration;
use tether_core::tool::RetryPolicy;

/// Delay before retry number `attempt` (0-based):
/// `backoff_ms * backoff_multiplier^attempt`, capped at `max_backoff_ms`.
pub fn next_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let multiplier = if policy.backoff_multiplier.is_finite() {
        policy.backoff_multiplier.max(0.0)
    } else {
        1.0
    };
    let raw = policy.backoff_ms as f64 * multiplier.powi(exponent);
    let cap = policy.max_backoff_ms as f64;
    let ms = if raw.is_finite() { raw.min(cap) } else { cap };
    Duration::from_millis(ms.max(0.0) as u64)
}

/// May a failure with `code` be retried after `retries_done` retries?
pub fn should_retry(policy: Option<&RetryPolicy>, code: &str, retries_done: u32) -> bool {
    policy.is_some_and(|p| retries_done < p.max_retries && p.is_retryable(code))
}
