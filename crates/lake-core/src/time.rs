//! Timestamp helpers.
//!
//! Every backend stores timestamps at microsecond precision, so values are
//! truncated before they are written to keep read-back comparisons exact.

use chrono::{DateTime, SubsecRound, Utc};

/// Current UTC time truncated to microseconds.
#[must_use]
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Truncates a timestamp to microseconds.
#[must_use]
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Converts microseconds since the Unix epoch back into a timestamp.
#[must_use]
pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}
