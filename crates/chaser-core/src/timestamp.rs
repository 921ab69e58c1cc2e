//! Timestamp normalization at the store boundary.
//!
//! Due dates and ledger instants arrive in whatever shape the writing
//! collaborator used: RFC 3339 strings, SQLite `datetime()` text, bare dates,
//! epoch milliseconds, or `{seconds, nanoseconds}` objects. Everything is
//! converted once, here; internal logic only sees `DateTime<Utc>`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChaseError, Result};

/// A timestamp in any of the accepted wire shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Epoch milliseconds.
    Millis(i64),
    Text(String),
    Structured {
        #[serde(alias = "_seconds")]
        seconds: i64,
        #[serde(default, alias = "_nanoseconds", alias = "nanos")]
        nanoseconds: u32,
    },
}

impl RawTimestamp {
    pub fn to_instant(&self) -> Result<DateTime<Utc>> {
        match self {
            RawTimestamp::Millis(ms) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .ok_or_else(|| ChaseError::InvalidTimestamp(format!("epoch millis {ms}"))),
            RawTimestamp::Text(s) => parse_instant(s),
            RawTimestamp::Structured {
                seconds,
                nanoseconds,
            } => Utc
                .timestamp_opt(*seconds, *nanoseconds)
                .single()
                .ok_or_else(|| {
                    ChaseError::InvalidTimestamp(format!(
                        "{{seconds: {seconds}, nanoseconds: {nanoseconds}}}"
                    ))
                }),
        }
    }
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        RawTimestamp::Text(value.to_rfc3339())
    }
}

/// Parse a textual timestamp. Naive forms are taken as UTC; bare dates as midnight UTC.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ChaseError::InvalidTimestamp("empty".into()));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(midnight.and_utc());
    }
    if let Ok(ms) = s.parse::<i64>() {
        return RawTimestamp::Millis(ms).to_instant();
    }
    Err(ChaseError::InvalidTimestamp(s.to_string()))
}
