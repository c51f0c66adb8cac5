//! Retry delay policy.

use chrono::{DateTime, TimeDelta, Utc};

/// Constant part of every retry delay, in seconds.
const BASE_DELAY_SECS: i64 = 5;

/// Delay before the given attempt may run: `attempts^4 + 5` seconds.
///
/// The polynomial keeps early retries short while the last attempts of a job
/// (10 by default) wait close to three hours. Values saturate instead of
/// overflowing.
pub fn delay(attempts: i64) -> TimeDelta {
    let attempts = attempts.max(0);
    let secs = attempts
        .checked_pow(4)
        .and_then(|secs| secs.checked_add(BASE_DELAY_SECS))
        .unwrap_or(i64::MAX);

    TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX)
}

/// Earliest time at which the given attempt becomes eligible.
pub fn next_attempt_at(now: DateTime<Utc>, attempts: i64) -> DateTime<Utc> {
    now.checked_add_signed(delay(attempts))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
