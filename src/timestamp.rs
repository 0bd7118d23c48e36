//! Timestamp codec for the remote `timestamptz` column.
//!
//! PostgREST renders timestamps in whatever form the database session
//! prefers, so parsing accepts several variants. Formatting always produces
//! the canonical UTC form with a literal `Z`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Seconds since the UNIX epoch, as stored in the meter log.
pub type UnixTime = u32;

/// Offset-carrying formats, tried in priority order: `±hh:mm` before `±hh`.
const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M:%S%.f%#z",
];

/// Zone-less formats, interpreted as UTC.
const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
];

const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Parse a timestamp returned by the remote store.
///
/// Returns `None` when no accepted form matches or the instant does not fit
/// in [`UnixTime`]. Callers treat that as "no watermark", never as an error.
pub fn parse(text: &str) -> Option<UnixTime> {
    let text = text.trim();

    let seconds = OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.timestamp())
        .or_else(|| {
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive).timestamp())
        })?;

    UnixTime::try_from(seconds).ok()
}

/// Render `ts` as `YYYY-MM-DDThh:mm:ssZ`.
pub fn format(ts: UnixTime) -> String {
    Utc.timestamp_opt(i64::from(ts), 0)
        .single()
        .unwrap_or_default()
        .format(CANONICAL_FORMAT)
        .to_string()
}
