//! Async host loop for an [`Uploader`].
//!
//! The uploader itself never sleeps or awaits. This loop turns each
//! [`Step`] into the matching wait and races it against a shutdown signal
//! with `tokio::select!`.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::info;

use crate::log_store::LogStore;
use crate::transport::Transport;
use crate::uploader::{Step, Uploader, UploaderStats};

/// How often an in-flight request is polled by default.
pub const DEFAULT_EVENT_POLL: Duration = Duration::from_millis(20);

/// Interval between progress reports.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Step `uploader` until it stops or `shutdown` resolves.
///
/// On shutdown the uploader's stop flag is raised and it is stepped once
/// more so it can release its batch and any in-flight request. Returns the
/// final statistics.
pub async fn drive<L, T, F>(
    uploader: &mut Uploader<L, T>,
    event_poll: Duration,
    shutdown: F,
) -> UploaderStats
where
    L: LogStore,
    T: Transport,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let stop = uploader.stop_handle();
    let mut last_report = Instant::now();

    info!(
        table = %uploader.config().table,
        device = %uploader.device_name(),
        "Upload loop started"
    );

    loop {
        let wait = match uploader.step() {
            Step::Continue => {
                tokio::task::yield_now().await;
                continue;
            }
            Step::Retry { after } => after,
            Step::AwaitEvent => event_poll,
            Step::Stopped => break,
        };

        if last_report.elapsed() >= REPORT_INTERVAL {
            let stats = uploader.stats();
            info!(
                batches_sent = stats.batches_sent,
                rows_sent = stats.rows_sent,
                failed_attempts = stats.failed_attempts,
                last_sent = uploader.last_sent(),
                "Upload progress"
            );
            last_report = Instant::now();
        }

        tokio::select! {
            _ = &mut shutdown, if !stop.is_stopped() => {
                info!("Shutdown requested, stopping uploader");
                stop.stop();
            }
            _ = sleep(wait) => {}
        }
    }

    info!(last_sent = uploader.last_sent(), "Upload loop finished");
    uploader.stats().clone()
}
