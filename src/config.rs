//! Configuration for the uploader.
//!
//! Two layers:
//!
//! - [`UploaderConfig`]: the uploader's JSON mapping (table, schema, device
//!   name template, token, cadence, outputs). Immutable once loaded.
//! - [`Settings`]: process-level knobs read from the environment (where the
//!   JSON lives, device identity, timeouts, time slice, buffer limit).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::timestamp::{self, UnixTime};
use crate::units::Unit;

/// Schema that is omitted from request paths.
pub const DEFAULT_SCHEMA: &str = "public";

/// Marker replaced with the runtime device identity.
pub const DEVICE_MARKER: &str = "$device";

/// Default PostgREST base URL
const DEFAULT_URL: &str = "http://localhost:3000";

/// Default upload interval in seconds
const DEFAULT_INTERVAL_SECS: u32 = 60;

/// Default bulk factor (intervals of data required before a batch is built)
const DEFAULT_BULK_SEND: u32 = 1;

/// Default decimal places for output values
const DEFAULT_PRECISION: usize = 2;

const DEFAULT_CONFIG_PATH: &str = "uploader.json";
const DEFAULT_DEVICE_IDENTITY: &str = "iotawatt";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_TIME_SLICE_MS: u64 = 10;
const MIN_TIME_SLICE_MS: u64 = 1;
const MAX_TIME_SLICE_MS: u64 = 1_000;

const DEFAULT_BUFFER_LIMIT: usize = 4_000;
const MIN_BUFFER_LIMIT: usize = 256;
const MAX_BUFFER_LIMIT: usize = 1024 * 1024;

/// Error type for configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("table name required")]
    MissingTable,

    #[error("invalid configuration JSON: {0}")]
    InvalidJson(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("Configuration error for {var}: {message}")]
    Env { var: String, message: String },

    #[error("cannot read {path}: {message}")]
    Read { path: PathBuf, message: String },
}

/// One configured output column group.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputSpec {
    /// Sensor name written to the `sensor` column
    pub name: String,

    /// Unit column the value lands in
    pub units: Unit,

    /// Meter log accumulator channel
    #[serde(default)]
    pub channel: usize,

    #[serde(default = "default_precision")]
    pub precision: usize,
}

fn default_precision() -> usize {
    DEFAULT_PRECISION
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    jwt_token: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    post_interval: Option<u32>,
    #[serde(default)]
    bulk_send: Option<u32>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    outputs: Vec<OutputSpec>,
}

/// Validated uploader configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct UploaderConfig {
    /// Remote table name
    pub table: String,

    /// Remote schema, `public` unless configured
    pub schema: String,

    /// Device name template, may contain [`DEVICE_MARKER`]
    pub device_name: String,

    /// Bearer token; requests are anonymous without it
    pub jwt_token: Option<String>,

    /// PostgREST base URL without a trailing slash
    pub url: String,

    /// Upload interval in seconds
    pub interval: u32,

    /// Bulk factor
    pub bulk_send: u32,

    /// Earliest timestamp eligible for upload
    pub start_date: UnixTime,

    pub outputs: Vec<OutputSpec>,
}

impl UploaderConfig {
    /// Parse and validate a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingTable`] when `table` is absent or empty,
    /// and [`ConfigError::InvalidValue`] for out-of-range settings.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::InvalidJson(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Validate an already-parsed JSON mapping.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::InvalidJson(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Read and validate the JSON configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let table = raw
            .table
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingTable)?;

        let schema = raw
            .schema
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SCHEMA.to_string());

        let device_name = raw
            .device_name
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEVICE_MARKER.to_string());

        let jwt_token = raw.jwt_token.filter(|t| !t.is_empty());

        let url = raw.url.unwrap_or_else(|| DEFAULT_URL.to_string());
        Url::parse(&url).map_err(|e| ConfigError::InvalidValue {
            key: "url",
            message: format!("'{}': {}", url, e),
        })?;
        let url = url.trim_end_matches('/').to_string();

        let interval = raw.post_interval.unwrap_or(DEFAULT_INTERVAL_SECS);
        if interval == 0 {
            return Err(ConfigError::InvalidValue {
                key: "postInterval",
                message: "interval must be greater than 0".to_string(),
            });
        }

        let bulk_send = raw.bulk_send.unwrap_or(DEFAULT_BULK_SEND);
        if bulk_send == 0 {
            return Err(ConfigError::InvalidValue {
                key: "bulkSend",
                message: "bulk factor must be at least 1".to_string(),
            });
        }

        let start_date = match raw.start_date {
            Some(text) => timestamp::parse(&text).ok_or_else(|| ConfigError::InvalidValue {
                key: "startDate",
                message: format!("'{}' is not a recognized timestamp", text),
            })?,
            None => 0,
        };

        let config = Self {
            table,
            schema,
            device_name,
            jwt_token,
            url,
            interval,
            bulk_send,
            start_date,
            outputs: raw.outputs,
        };

        info!(
            "Configured for table {}.{} {}",
            config.schema,
            config.table,
            if config.jwt_token.is_some() {
                "with JWT auth"
            } else {
                "(anonymous)"
            }
        );

        Ok(config)
    }

    /// Device name with the marker substituted by `identity`.
    pub fn resolve_device_name(&self, identity: &str) -> String {
        resolve_device_name(&self.device_name, identity)
    }
}

/// Replace every [`DEVICE_MARKER`] in `template` with `identity`.
pub fn resolve_device_name(template: &str, identity: &str) -> String {
    template.replace(DEVICE_MARKER, identity)
}

/// Cooperative budgets for one uploader instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Time a single step may spend assembling rows before yielding
    pub time_slice: Duration,

    /// Batch size in bytes after which no new record pairs are pulled
    pub buffer_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time_slice: Duration::from_millis(DEFAULT_TIME_SLICE_MS),
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

/// Process-level settings for the uploader binary.
///
/// All settings can be configured via environment variables:
/// - `UPLOADER_CONFIG_PATH`: uploader JSON file (default: uploader.json)
/// - `UPLOADER_DEVICE_NAME`: device identity substituted for `$device` (default: iotawatt)
/// - `UPLOADER_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
/// - `UPLOADER_TIME_SLICE_MS`: assembly time slice per step (default: 10)
/// - `UPLOADER_BUFFER_LIMIT`: batch size limit in bytes (default: 4000)
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub device_identity: String,
    pub request_timeout: Duration,
    pub limits: Limits,
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] when a numeric variable does not parse
    /// or falls outside its allowed range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("UPLOADER_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let device_identity = env::var("UPLOADER_DEVICE_NAME")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_DEVICE_IDENTITY.to_string());

        let request_timeout = Duration::from_secs(parse_bounded(
            "UPLOADER_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            600,
        )?);

        let time_slice = Duration::from_millis(parse_bounded(
            "UPLOADER_TIME_SLICE_MS",
            DEFAULT_TIME_SLICE_MS,
            MIN_TIME_SLICE_MS,
            MAX_TIME_SLICE_MS,
        )?);

        let buffer_limit = parse_bounded(
            "UPLOADER_BUFFER_LIMIT",
            DEFAULT_BUFFER_LIMIT as u64,
            MIN_BUFFER_LIMIT as u64,
            MAX_BUFFER_LIMIT as u64,
        )? as usize;

        Ok(Self {
            config_path,
            device_identity,
            request_timeout,
            limits: Limits {
                time_slice,
                buffer_limit,
            },
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            device_identity: DEFAULT_DEVICE_IDENTITY.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            limits: Limits::default(),
        }
    }
}

/// Parse an integer environment variable within `min..=max`.
fn parse_bounded(var: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    let value = match env::var(var) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };

    let parsed: u64 = value.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        message: format!("'{}' is not a valid number", value),
    })?;

    if parsed < min {
        return Err(ConfigError::Env {
            var: var.to_string(),
            message: format!("{} is below minimum ({})", parsed, min),
        });
    }
    if parsed > max {
        return Err(ConfigError::Env {
            var: var.to_string(),
            message: format!("{} exceeds maximum ({})", parsed, max),
        });
    }

    Ok(parsed)
}
