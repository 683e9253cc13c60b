//! Timestamp utilities

use chrono::{DateTime, TimeZone, Utc};

/// Seconds between the Unix epoch and the Apple reference date (2001-01-01 UTC)
pub const APPLE_EPOCH_OFFSET_SECS: i64 = 978_307_200;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert an Apple epoch value to UTC
///
/// Older stores write whole seconds, newer ones nanoseconds. Values above
/// 10^11 cannot be plausible seconds and are treated as nanoseconds.
/// Returns None for zero (unset) or out-of-range values.
pub fn from_apple_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value == 0 {
        return None;
    }
    let (secs, nanos) = if value.abs() > 100_000_000_000 {
        (value.div_euclid(1_000_000_000), value.rem_euclid(1_000_000_000) as u32)
    } else {
        (value, 0)
    };
    Utc.timestamp_opt(secs.checked_add(APPLE_EPOCH_OFFSET_SECS)?, nanos)
        .single()
}
