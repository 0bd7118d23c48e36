//! PostgREST Uploader Library
//!
//! This library streams samples from a local append-only meter log into a
//! remote table through a PostgREST HTTP interface:
//!
//! - **uploader**: The cooperative `Resolve → Write → Submit → Settle` state machine
//! - **resume**: Last-row query, response decoding and watermark alignment
//! - **row**: CSV row assembly from adjacent log record pairs
//! - **units**: Unit columns and the per-configuration CSV header
//! - **timestamp**: Timestamp parsing and formatting
//! - **config**: JSON uploader configuration and environment settings
//! - **script** / **log_store**: Script and meter log abstractions
//! - **transport** / **client**: Fire-and-poll HTTP transport and its reqwest implementation
//! - **driver**: Async loop that steps an uploader until shutdown
//! - **log_generator**: Simulated meter log for development
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use postgrest_uploader::client::HttpTransport;
//! use postgrest_uploader::config::UploaderConfig;
//! use postgrest_uploader::driver::{drive, DEFAULT_EVENT_POLL};
//! use postgrest_uploader::log_store::MemoryLog;
//! use postgrest_uploader::script::ScriptList;
//! use postgrest_uploader::uploader::Uploader;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = UploaderConfig::from_json(
//!         r#"{ "table": "readings", "outputs": [{ "name": "mains", "units": "Watts" }] }"#,
//!     )?;
//!     let scripts = ScriptList::from_outputs(&config.outputs);
//!     let transport = HttpTransport::new(config.url.clone(), std::time::Duration::from_secs(30))?;
//!     let log = Arc::new(MemoryLog::new());
//!
//!     let mut uploader = Uploader::new(config, scripts, log, transport, "iotawatt");
//!     drive(&mut uploader, DEFAULT_EVENT_POLL, async {
//!         tokio::signal::ctrl_c().await.ok();
//!     })
//!     .await;
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod client;
pub mod config;
pub mod driver;
pub mod log_generator;
pub mod log_store;
pub mod resume;
pub mod row;
pub mod script;
pub mod timestamp;
pub mod transport;
pub mod units;
pub mod uploader;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root for convenience
pub use client::{ClientError, HttpTransport};
pub use config::{ConfigError, Limits, Settings, UploaderConfig};
pub use log_store::{LogError, LogRecord, LogStore, MemoryLog};
pub use script::{ChannelScript, Script, ScriptList};
pub use transport::{HttpRequest, HttpResponse, InFlight, Readiness, Transport};
pub use units::{Unit, UnitSet};
pub use uploader::{Phase, Step, StopHandle, Uploader, UploaderStats};
