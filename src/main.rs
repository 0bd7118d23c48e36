//! PostgREST Uploader - streams meter log samples into a PostgREST table
//!
//! This service simulates an energy-meter log locally and uploads it, one
//! batch of CSV rows at a time, to a table exposed by PostgREST. Uploads
//! resume from the newest row already stored for this device.
//!
//! ## Features
//!
//! - Resume point discovery from the remote table
//! - Interval-aligned CSV batches with configurable bulk factor
//! - Cooperative stepping with bounded time slices
//! - Graceful shutdown on SIGINT
//!
//! ## Configuration
//!
//! The uploader itself is configured by a JSON file; the process by
//! environment variables:
//!
//! - `UPLOADER_CONFIG_PATH`: uploader JSON file (default: uploader.json)
//! - `UPLOADER_DEVICE_NAME`: device identity substituted for `$device` (default: iotawatt)
//! - `UPLOADER_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
//! - `UPLOADER_TIME_SLICE_MS`: assembly time slice per step (default: 10)
//! - `UPLOADER_BUFFER_LIMIT`: batch size limit in bytes (default: 4000)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use postgrest_uploader::client::HttpTransport;
use postgrest_uploader::config::{Settings, UploaderConfig};
use postgrest_uploader::driver::{drive, DEFAULT_EVENT_POLL};
use postgrest_uploader::log_generator::MeterSimulator;
use postgrest_uploader::log_store::{LogStore, MemoryLog};
use postgrest_uploader::script::ScriptList;
use postgrest_uploader::timestamp::{self, UnixTime};
use postgrest_uploader::uploader::Uploader;

/// Seconds between simulated meter log records
const SAMPLE_INTERVAL_SECS: u32 = 5;

/// History generated at startup so the first batch has data
const BACKFILL_SECS: u32 = 3_600;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting PostgREST uploader...");

    let settings = match Settings::from_env() {
        Ok(settings) => {
            info!(
                config_path = %settings.config_path.display(),
                device = %settings.device_identity,
                request_timeout_secs = settings.request_timeout.as_secs(),
                time_slice_ms = settings.limits.time_slice.as_millis() as u64,
                buffer_limit = settings.limits.buffer_limit,
                "Settings loaded"
            );
            settings
        }
        Err(e) => {
            error!(error = %e, "Failed to load settings");
            std::process::exit(1);
        }
    };

    let config = match UploaderConfig::load(&settings.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load uploader configuration");
            std::process::exit(1);
        }
    };

    let transport = match HttpTransport::new(config.url.clone(), settings.request_timeout) {
        Ok(transport) => {
            info!(base_url = %transport.base_url(), "HTTP transport initialized");
            transport
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP transport");
            std::process::exit(1);
        }
    };

    // Simulated meter log with an hour of history
    let log = Arc::new(MemoryLog::new());
    let started = now();
    let start = started.saturating_sub(BACKFILL_SECS);
    let mut simulator = MeterSimulator::with_defaults(start - start % SAMPLE_INTERVAL_SECS);
    let mut rng = StdRng::from_entropy();
    let backfilled = simulator.fill(&log, started, SAMPLE_INTERVAL_SECS, &mut rng);
    info!(
        records = backfilled,
        from = %timestamp::format(log.first_key().unwrap_or(started)),
        "Meter log simulator initialized"
    );

    let generator_log = log.clone();
    let generator_handle = tokio::spawn(async move {
        info!("Generator task started");
        run_generator(simulator, rng, generator_log).await;
    });

    let scripts = ScriptList::from_outputs(&config.outputs);
    let mut uploader = Uploader::new(
        config,
        scripts,
        log,
        transport,
        settings.device_identity.clone(),
    )
    .with_limits(settings.limits);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let uploader_handle = tokio::spawn(async move {
        info!("Uploader task started");
        let stats = drive(&mut uploader, DEFAULT_EVENT_POLL, async {
            shutdown_rx.await.ok();
        })
        .await;
        (stats, uploader.last_sent(), uploader.status_message().map(str::to_string))
    });

    // Wait for shutdown signal
    info!("Uploader running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());
    generator_handle.abort();

    let shutdown_timeout = Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, uploader_handle).await {
        Ok(Ok((stats, last_sent, status))) => {
            info!(
                batches_sent = stats.batches_sent,
                rows_sent = stats.rows_sent,
                failed_attempts = stats.failed_attempts,
                last_sent = %timestamp::format(last_sent),
                status = status.as_deref().unwrap_or("ok"),
                "Uploader shut down gracefully"
            );
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Uploader task panicked during shutdown");
        }
        Err(_) => {
            warn!("Uploader shutdown timed out after {:?}", shutdown_timeout);
        }
    }

    info!("PostgREST uploader stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

fn now() -> UnixTime {
    UnixTime::try_from(Utc::now().timestamp()).unwrap_or(UnixTime::MAX)
}

/// Append simulated meter records as wall-clock time advances.
///
/// Runs until the task is aborted.
async fn run_generator(mut simulator: MeterSimulator, mut rng: StdRng, log: Arc<MemoryLog>) {
    let mut ticker = interval(Duration::from_secs(u64::from(SAMPLE_INTERVAL_SECS)));
    let mut records_generated: u64 = 0;
    let mut last_report_time = std::time::Instant::now();
    let report_interval = Duration::from_secs(300);

    loop {
        ticker.tick().await;

        records_generated += simulator.fill(&log, now(), SAMPLE_INTERVAL_SECS, &mut rng) as u64;

        // Periodic progress report
        if last_report_time.elapsed() >= report_interval {
            info!(
                records_generated = records_generated,
                last_key = %timestamp::format(simulator.current_time()),
                "Generator progress"
            );
            records_generated = 0;
            last_report_time = std::time::Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_interval() {
        assert!(SAMPLE_INTERVAL_SECS > 0);
        assert!(SAMPLE_INTERVAL_SECS <= 60);
    }

    #[test]
    fn test_backfill_covers_whole_samples() {
        assert_eq!(BACKFILL_SECS % SAMPLE_INTERVAL_SECS, 0);
        assert!(BACKFILL_SECS >= 60 * SAMPLE_INTERVAL_SECS);
    }

    #[test]
    fn test_now_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now() > 1_577_836_800);
    }
}
