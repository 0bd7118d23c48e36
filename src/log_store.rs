//! Read access to the append-only meter log.

use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::timestamp::UnixTime;

/// One sample of the meter log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub unix_time: UnixTime,

    /// Cumulative hours during which the meter was logging.
    pub log_hours: f64,

    /// Per-channel accumulated value-hours.
    pub accum: Vec<f64>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LogError {
    #[error("log is empty")]
    Empty,

    #[error("log read failed at {key}: {message}")]
    Read { key: UnixTime, message: String },
}

/// Ordinal read access by timestamp key.
pub trait LogStore: Send + Sync {
    /// Read the record for `key`.
    ///
    /// Keys with no record of their own return the nearest earlier record
    /// retimed to `key`, so the pair carries no new logged hours.
    fn read_key(&self, key: UnixTime) -> Result<LogRecord, LogError>;

    fn first_key(&self) -> Option<UnixTime>;

    fn last_key(&self) -> Option<UnixTime>;
}

/// In-memory log, appended by a producer and read by uploaders.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: RwLock<BTreeMap<UnixTime, LogRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Records at or before the current last key are ignored.
    pub fn append(&self, record: LogRecord) -> bool {
        let Ok(mut records) = self.records.write() else {
            return false;
        };
        if records
            .last_key_value()
            .is_some_and(|(last, _)| *last >= record.unix_time)
        {
            return false;
        }
        records.insert(record.unix_time, record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<LogRecord> for MemoryLog {
    fn from_iter<I: IntoIterator<Item = LogRecord>>(iter: I) -> Self {
        let log = MemoryLog::new();
        for record in iter {
            log.append(record);
        }
        log
    }
}

impl LogStore for MemoryLog {
    fn read_key(&self, key: UnixTime) -> Result<LogRecord, LogError> {
        let records = self.records.read().map_err(|e| LogError::Read {
            key,
            message: e.to_string(),
        })?;

        let found = records
            .range(..=key)
            .next_back()
            .or_else(|| records.first_key_value())
            .map(|(_, record)| record)
            .ok_or(LogError::Empty)?;

        Ok(LogRecord {
            unix_time: key,
            ..found.clone()
        })
    }

    fn first_key(&self) -> Option<UnixTime> {
        self.records
            .read()
            .ok()
            .and_then(|r| r.first_key_value().map(|(k, _)| *k))
    }

    fn last_key(&self) -> Option<UnixTime> {
        self.records
            .read()
            .ok()
            .and_then(|r| r.last_key_value().map(|(k, _)| *k))
    }
}
