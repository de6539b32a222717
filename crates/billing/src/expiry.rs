//! Expiry arithmetic for credential renewals.
//!
//! The panel stores expiry as Unix milliseconds, with `0` meaning "no
//! expiry". Everything here works at millisecond precision so a value we
//! compute can be compared exactly with what the panel reads back.

use time::{Duration, OffsetDateTime};

/// New expiry after adding `days` to a credential.
///
/// A still-valid expiry stacks (`current + days`); an expired or unset one
/// restarts from `now`.
pub fn extend_expiry(current: Option<OffsetDateTime>, now: OffsetDateTime, days: i32) -> OffsetDateTime {
    let base = match current {
        Some(expiry) if expiry > now => expiry,
        _ => now,
    };
    truncate_to_millis(base + Duration::days(i64::from(days)))
}

/// Panel millis to a timestamp; non-positive values mean "unset".
pub fn from_millis(ms: i64) -> Option<OffsetDateTime> {
    if ms <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

pub fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn truncate_to_millis(at: OffsetDateTime) -> OffsetDateTime {
    from_millis(to_millis(at)).unwrap_or(at)
}
