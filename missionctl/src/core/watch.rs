//! Staleness and debounce rules for the heartbeat watchdog.

use chrono::{DateTime, Duration, Utc};

/// A worker is stale when its last heartbeat is older than its cycle plus
/// grace, or it never fired.
pub fn is_stale(
    last_fired: Option<DateTime<Utc>>,
    cycle_minutes: u32,
    grace_minutes: u32,
    now: DateTime<Utc>,
) -> bool {
    let threshold = Duration::minutes(i64::from(cycle_minutes) + i64::from(grace_minutes));
    match last_fired {
        Some(at) => now - at > threshold,
        None => true,
    }
}

/// True when no alert was sent for the worker within `suppression`.
pub fn should_alert(
    last_alert: Option<DateTime<Utc>>,
    suppression: Duration,
    now: DateTime<Utc>,
) -> bool {
    match last_alert {
        Some(at) => now - at >= suppression,
        None => true,
    }
}
