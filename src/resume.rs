//! Resume point discovery against the remote table.

use serde::Deserialize;
use url::form_urlencoded;

use crate::config::DEFAULT_SCHEMA;
use crate::timestamp::{self, UnixTime};

/// Decoded answer to the last-row query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    /// No rows for this device, or an unreadable body.
    Empty,
    Record { timestamp: Option<String> },
}

impl QueryResult {
    /// Timestamp of the stored row, if present and parseable.
    pub fn watermark(&self) -> Option<UnixTime> {
        match self {
            QueryResult::Record {
                timestamp: Some(text),
            } => timestamp::parse(text),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LastRow {
    #[serde(default)]
    timestamp: Option<String>,
}

/// `/{schema.}{table}`, omitting the default schema.
pub fn table_path(schema: &str, table: &str) -> String {
    if schema.is_empty() || schema == DEFAULT_SCHEMA {
        format!("/{}", table)
    } else {
        format!("/{}.{}", schema, table)
    }
}

/// Query for the newest stored row of `device`.
pub fn query_path(schema: &str, table: &str, device: &str) -> String {
    let device: String = form_urlencoded::byte_serialize(device.as_bytes()).collect();
    format!(
        "{}?select=timestamp&device=eq.{}&order=timestamp.desc&limit=1",
        table_path(schema, table),
        device
    )
}

/// Decode the query response body.
///
/// Anything other than a JSON array of objects decodes to
/// [`QueryResult::Empty`].
pub fn decode(body: &str) -> QueryResult {
    match serde_json::from_str::<Vec<LastRow>>(body) {
        Ok(rows) => match rows.into_iter().next() {
            Some(row) => QueryResult::Record {
                timestamp: row.timestamp,
            },
            None => QueryResult::Empty,
        },
        Err(_) => QueryResult::Empty,
    }
}

/// Safe restart watermark.
///
/// Never earlier than the configured start date or the oldest local record,
/// and floored to a multiple of `interval` so batches stay on cadence.
pub fn watermark(
    found: Option<UnixTime>,
    start_date: UnixTime,
    first_key: UnixTime,
    interval: u32,
) -> UnixTime {
    let mark = found.unwrap_or(0).max(start_date).max(first_key);
    if interval == 0 {
        return mark;
    }
    mark - mark % interval
}
