/// Reading staleness and time-window helpers.
///
/// Weather readings arrive roughly hourly and traffic snapshots are
/// collected every 15 minutes, but either source can silently stop. The
/// sub-calculators only trust data inside a tolerance window; this module
/// defines those windows so "stale" means the same thing everywhere.
///
/// # Clock injection
/// All functions accept a `now: DateTime<Utc>` parameter rather than calling
/// `Utc::now()` internally. This keeps staleness deterministic in tests.

use chrono::{DateTime, Duration, DurationRound, Utc};

// ---------------------------------------------------------------------------
// Staleness check
// ---------------------------------------------------------------------------

/// Whole minutes between `observed_at` and `now`. Negative for future
/// timestamps (provider clock ahead of ours).
pub fn age_minutes(observed_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - observed_at).num_minutes()
}

/// Returns `true` if `observed_at` is older than `max_age_minutes`.
///
/// Staleness is strictly greater than the threshold:
///   age > max_age_minutes  →  stale
///   age == max_age_minutes →  not stale
pub fn is_stale_at(
    observed_at: DateTime<Utc>,
    max_age_minutes: u64,
    now: DateTime<Utc>,
) -> bool {
    age_minutes(observed_at, now) > max_age_minutes as i64
}

/// Oldest timestamp still inside a window of `hours` ending at `now`.
///
/// Store queries use `observed_at >= window_start(..)`, which matches the
/// inclusive boundary of `is_stale_at`.
pub fn window_start(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    now - Duration::hours(hours.max(0))
}

// ---------------------------------------------------------------------------
// Hour buckets
// ---------------------------------------------------------------------------

/// Floors a timestamp to the start of its hour (the snapshot dedup key).
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
