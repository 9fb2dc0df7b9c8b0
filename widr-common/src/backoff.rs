//! Renewal timing: exponential backoff, jitter and expiry-driven renew times.
//!
//! Every wait computed by the renewal loop goes through this module so that
//! the floor, the ceiling and the jitter are applied consistently.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default floor for every computed wait.
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_secs(10);

/// Default upper bound for failure backoff.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(60 * 60);

/// Shifts beyond this always saturate at the ceiling.
const MAX_BACKOFF_SHIFT: u64 = 62;

/// Exponential backoff: `base * 2^attempt`, clamped to `limit`.
///
/// Monotonically non-decreasing in `attempt` and overflow-safe for any
/// attempt count.
pub fn backoff(base: Duration, limit: Duration, attempt: u64) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    if attempt > MAX_BACKOFF_SHIFT {
        return limit;
    }

    let limit_nanos = limit.as_nanos();
    match base.as_nanos().checked_mul(1u128 << attempt) {
        Some(nanos) if nanos < limit_nanos => duration_from_nanos(nanos),
        _ => limit,
    }
}

/// Uniformly random duration in `[0, max)`.
pub fn random_stagger(max: Duration) -> Duration {
    let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(fastrand::u64(0..nanos))
}

/// How long to wait before renewing a token that expires at `expiration`.
///
/// Renewal starts halfway through the remaining lifetime plus up to 10% of
/// that half as jitter. When half the remaining lifetime is shorter than
/// `min_wait` (including already-expired tokens) the floor is used instead,
/// again with 10% jitter.
pub fn expiry_to_renew_time(
    expiration: DateTime<Utc>,
    now: DateTime<Utc>,
    min_wait: Duration,
) -> Duration {
    let left = (expiration - now).to_std().unwrap_or(Duration::ZERO);
    let renew_at = left / 2;
    if renew_at < min_wait {
        return min_wait + random_stagger(min_wait / 10);
    }
    renew_at + random_stagger(renew_at / 10)
}

fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    // Remainder is always < 1e9.
    let subsec = (nanos % 1_000_000_000) as u32;
    Duration::new(secs, subsec)
}

/// Timing knobs for one renewal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalTiming {
    /// Floor for every computed wait. Settable to ease testing.
    pub min_wait: Duration,
    /// Maximum backoff between failed renewal attempts.
    pub ceiling: Duration,
}

impl Default for RenewalTiming {
    fn default() -> Self {
        Self {
            min_wait: DEFAULT_MIN_WAIT,
            ceiling: DEFAULT_BACKOFF_CEILING,
        }
    }
}

impl RenewalTiming {
    pub fn new(min_wait: Duration, ceiling: Duration) -> Self {
        Self { min_wait, ceiling }
    }

    /// Wait after the `retry`-th consecutive failure.
    pub fn retry_wait(&self, retry: u64) -> Duration {
        backoff(self.min_wait, self.ceiling, retry) + random_stagger(self.min_wait)
    }

    /// Wait before renewing a token expiring at `expiration`.
    pub fn renew_wait(&self, expiration: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        expiry_to_renew_time(expiration, now, self.min_wait)
    }
}
