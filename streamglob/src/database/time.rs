//! Timestamp conversion for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC). Rows
//! written by other tools may hold values chrono cannot represent; those
//! read back as `None` rather than failing the whole query.

use chrono::{DateTime, Utc};

/// Convert an optional timestamp into its stored form.
#[inline]
pub fn to_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(|dt| dt.timestamp_millis())
}

/// Convert a stored value back into a timestamp.
#[inline]
pub fn from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
}
