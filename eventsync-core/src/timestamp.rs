//! Timestamp helpers.
//!
//! Every timestamp that crosses a storage boundary is kept at microsecond
//! precision so cursors compare equal after a round-trip through SQLite.

use chrono::{DateTime, Utc};

/// Current time, truncated to microseconds.
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Truncates a timestamp to microsecond precision.
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Converts a timestamp to microseconds since the Unix epoch.
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Converts microseconds since the Unix epoch back to a timestamp.
///
/// Returns `None` if the value is out of range.
pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}
