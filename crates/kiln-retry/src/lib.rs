//! Retry-delay calculation shared by the scheduler's `retry_not_before`
//! bookkeeping, the adapter layer's internal idempotent-op retries, and
//! webhook delivery's retry-on-5xx loop.
//!
//! Three call sites, three fixed delay shapes, one calculation:
//!
//! - Scheduler: `retry_not_before = now + base * 2^(max_retries - retries_remaining)`,
//!   `base = 30s` by default.
//! - Adapter: fixed sequence `200ms, 400ms, 800ms`, 3 attempts, idempotent
//!   ops only.
//! - Webhook: fixed sequence `1s, 4s, 16s`, 3 attempts, retried on 5xx or
//!   network error only.

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A retry delay schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// `base * 2^attempt`, optionally jittered by up to `jitter_frac` of
    /// the computed delay (uniform in `[delay*(1-jitter_frac), delay]`).
    Exponential {
        base: Duration,
        #[serde(default)]
        jitter_frac: f64,
    },
    /// An explicit, ordered list of delays. `attempt` indexes into it;
    /// indexing past the end saturates at the last entry.
    Sequence(Vec<Duration>),
}

impl RetryStrategy {
    /// The scheduler's default: `base = 30s`, no jitter (spec's formula is
    /// exact, not randomized).
    pub fn scheduler_default() -> Self {
        RetryStrategy::Exponential { base: Duration::from_secs(30), jitter_frac: 0.0 }
    }

    /// The adapter's fixed idempotent-retry sequence.
    pub fn adapter_sequence() -> Self {
        RetryStrategy::Sequence(vec![
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
        ])
    }

    /// The webhook worker's fixed retry-on-5xx sequence.
    pub fn webhook_sequence() -> Self {
        RetryStrategy::Sequence(vec![
            Duration::from_secs(1),
            Duration::from_secs(4),
            Duration::from_secs(16),
        ])
    }

    /// Number of attempts this strategy is meant to be used for, for
    /// strategies with a natural finite bound. `Exponential` has no
    /// intrinsic bound — callers impose their own `max_retries`.
    pub fn max_attempts(&self) -> Option<usize> {
        match self {
            RetryStrategy::Exponential { .. } => None,
            RetryStrategy::Sequence(s) => Some(s.len()),
        }
    }
}

/// Compute the delay before retry attempt number `attempt` (0-indexed:
/// `attempt = 0` is the delay before the *first* retry, i.e. after the
/// initial failure).
pub fn calculate_delay(strategy: &RetryStrategy, attempt: u32) -> Duration {
    match strategy {
        RetryStrategy::Exponential { base, jitter_frac } => {
            let exp = 2u64.saturating_pow(attempt);
            let nominal = base.saturating_mul(exp as u32);
            apply_jitter(nominal, *jitter_frac)
        }
        RetryStrategy::Sequence(delays) => {
            let idx = (attempt as usize).min(delays.len().saturating_sub(1));
            delays.get(idx).copied().unwrap_or_default()
        }
    }
}

/// The scheduler's exact `retry_not_before` offset: `base * 2^(max_retries
/// - retries_remaining)`.
pub fn scheduler_backoff(base: Duration, max_retries: u32, retries_remaining: u32) -> Duration {
    let exponent = max_retries.saturating_sub(retries_remaining);
    base.saturating_mul(2u32.saturating_pow(exponent))
}

fn apply_jitter(delay: Duration, jitter_frac: f64) -> Duration {
    if jitter_frac <= 0.0 {
        return delay;
    }
    let jitter_frac = jitter_frac.min(1.0);
    let nanos = delay.as_nanos() as f64;
    let floor = nanos * (1.0 - jitter_frac);
    let jittered = rand::rng().random_range(floor..=nanos);
    Duration::from_nanos(jittered.round() as u64)
}

/// Runs a fallible, idempotent operation, sleeping between attempts
/// according to `strategy`. Used by `kiln-adapter` for `get_status`,
/// `list_files`, and `get_snapshot` only — never for `start_print`,
/// `cancel_print`, or `upload_file`, which are not idempotent and are
/// never retried below the scheduler.
pub struct RetryExecutor {
    strategy: RetryStrategy,
}

impl RetryExecutor {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    /// Runs `op`, retrying on `Err` up to `strategy.max_attempts()`
    /// attempts (or forever for an `Exponential` strategy capped by
    /// `max_attempts_override`). Sleeps between attempts using
    /// `thread::sleep` — callers on the scheduler or webhook thread never
    /// call this directly; it is for blocking adapter-transport retries
    /// running on their own worker thread.
    pub fn run<T, E>(&self, max_attempts_override: Option<usize>, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        let max_attempts = max_attempts_override
            .or_else(|| self.strategy.max_attempts())
            .unwrap_or(1);
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if (attempt as usize + 1) >= max_attempts {
                        return Err(e);
                    }
                    thread::sleep(calculate_delay(&self.strategy, attempt));
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_sequence_matches_spec() {
        let s = RetryStrategy::adapter_sequence();
        assert_eq!(calculate_delay(&s, 0), Duration::from_millis(200));
        assert_eq!(calculate_delay(&s, 1), Duration::from_millis(400));
        assert_eq!(calculate_delay(&s, 2), Duration::from_millis(800));
        // saturates at the last entry past the declared length
        assert_eq!(calculate_delay(&s, 10), Duration::from_millis(800));
        assert_eq!(s.max_attempts(), Some(3));
    }

    #[test]
    fn webhook_sequence_matches_spec() {
        let s = RetryStrategy::webhook_sequence();
        assert_eq!(calculate_delay(&s, 0), Duration::from_secs(1));
        assert_eq!(calculate_delay(&s, 1), Duration::from_secs(4));
        assert_eq!(calculate_delay(&s, 2), Duration::from_secs(16));
    }

    #[test]
    fn scheduler_backoff_matches_formula() {
        let base = Duration::from_secs(30);
        // max_retries=3, retries_remaining=3 (first failure) -> exponent 0
        assert_eq!(scheduler_backoff(base, 3, 3), Duration::from_secs(30));
        // retries_remaining=2 -> exponent 1
        assert_eq!(scheduler_backoff(base, 3, 2), Duration::from_secs(60));
        // retries_remaining=1 -> exponent 2
        assert_eq!(scheduler_backoff(base, 3, 1), Duration::from_secs(120));
        // retries_remaining=0 -> exponent 3
        assert_eq!(scheduler_backoff(base, 3, 0), Duration::from_secs(240));
    }

    #[test]
    fn executor_retries_until_success() {
        let exec = RetryExecutor::new(RetryStrategy::Sequence(vec![Duration::from_millis(1); 3]));
        let mut calls = 0;
        let result: Result<i32, &str> = exec.run(None, || {
            calls += 1;
            if calls < 3 { Err("transport") } else { Ok(42) }
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[test]
    fn executor_gives_up_after_max_attempts() {
        let exec = RetryExecutor::new(RetryStrategy::adapter_sequence());
        let mut calls = 0;
        let result: Result<i32, &str> = exec.run(None, || {
            calls += 1;
            Err("transport")
        });
        assert_eq!(result, Err("transport"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn jitter_never_exceeds_nominal_delay() {
        let nominal = Duration::from_millis(1000);
        for _ in 0..50 {
            let jittered = apply_jitter(nominal, 0.5);
            assert!(jittered <= nominal);
            assert!(jittered >= Duration::from_millis(500));
        }
    }

    proptest::proptest! {
        #[test]
        fn scheduler_backoff_is_monotonic_in_exponent(max_retries in 0u32..20, remaining in 0u32..20) {
            let base = Duration::from_secs(1);
            let a = scheduler_backoff(base, max_retries, remaining.min(max_retries));
            let b = scheduler_backoff(base, max_retries, remaining.min(max_retries).saturating_sub(1));
            prop_assert!(b >= a);
        }
    }
}
