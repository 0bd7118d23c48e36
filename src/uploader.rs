//! Cooperative batch uploader.
//!
//! [`Uploader`] moves through `Resolve → Write → Submit → Settle` and back to
//! `Write`. Every call to [`Uploader::step`] does a bounded amount of work and
//! tells the host when to call again. Requests are issued and then polled on
//! later steps, so a step never waits on the network.
//!
//! The watermark (`last_sent`) only advances on a `201 Created`. A failed
//! batch is rebuilt from the same start on the next attempt.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, Limits, UploaderConfig};
use crate::log_store::{LogError, LogRecord, LogStore};
use crate::resume;
use crate::row::{Assembly, RowAssembler};
use crate::script::ScriptList;
use crate::timestamp::{self, UnixTime};
use crate::transport::{HttpRequest, InFlight, Readiness, Transport, CONTENT_TYPE_CSV};
use crate::units::UnitSet;

/// Wait before retrying when the transport reports no connectivity.
const CONNECT_RETRY: Duration = Duration::from_secs(1);

/// Wait after a failed last-row query.
const QUERY_BACKOFF: Duration = Duration::from_secs(5);

/// Wait for the log to grow past the batch threshold.
const DATA_WAIT: Duration = Duration::from_secs(1);

/// Wait after building a batch with no rows.
const EMPTY_BATCH_WAIT: Duration = Duration::from_secs(5);

/// Wait after a failed POST or log read.
const WRITE_BACKOFF: Duration = Duration::from_secs(10);

/// Delay requested when the time slice runs out mid-batch.
const YIELD_DELAY: Duration = Duration::from_millis(10);

/// Longest status message kept, in bytes.
pub const MAX_STATUS_MESSAGE: usize = 256;

/// What the host should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Call again as soon as convenient.
    Continue,

    /// Call again after the delay.
    Retry { after: Duration },

    /// A request is in flight; call again when it may have completed.
    AwaitEvent,

    /// The uploader has stopped and will do nothing further.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolve,
    Write,
    Submit,
    Settle,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Resolve => "resolve",
            Phase::Write => "write",
            Phase::Submit => "submit",
            Phase::Settle => "settle",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared stop flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Statistics about upload operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploaderStats {
    /// Last-row queries issued
    pub queries: u64,

    /// Batches confirmed stored
    pub batches_sent: u64,

    /// Data rows confirmed stored
    pub rows_sent: u64,

    /// Failed queries, POSTs and log reads
    pub failed_attempts: u64,
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Loaded(LogRecord),
}

impl Slot {
    fn record(&self) -> Option<&LogRecord> {
        match self {
            Slot::Empty => None,
            Slot::Loaded(record) => Some(record),
        }
    }
}

/// The adjacent record pair being walked through the log.
#[derive(Debug, Default)]
struct Cursors {
    old: Slot,
    new: Slot,
}

impl Cursors {
    fn is_empty(&self) -> bool {
        matches!(self.new, Slot::Empty)
    }

    fn start(&mut self, first: LogRecord) {
        self.old = Slot::Empty;
        self.new = Slot::Loaded(first);
    }

    fn advance(&mut self, next: LogRecord) {
        self.old = mem::replace(&mut self.new, Slot::Loaded(next));
    }

    fn newest_time(&self) -> Option<UnixTime> {
        self.new.record().map(|r| r.unix_time)
    }

    fn pair(&self) -> Option<(&LogRecord, &LogRecord)> {
        Some((self.old.record()?, self.new.record()?))
    }

    fn release(&mut self) {
        self.old = Slot::Empty;
        self.new = Slot::Empty;
    }
}

/// CSV payload under construction.
#[derive(Debug)]
struct Batch {
    id: Uuid,
    text: String,
    rows: usize,
    /// Timestamp of the newest row written
    newest: Option<UnixTime>,
}

impl Batch {
    fn new(header: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: header.to_string(),
            rows: 0,
            newest: None,
        }
    }
}

/// A submitted batch awaiting its response.
#[derive(Debug)]
struct Submitted {
    id: Uuid,
    rows: usize,
    watermark: UnixTime,
}

/// Uploads one configuration's sensor rows to a PostgREST table.
pub struct Uploader<L, T> {
    config: UploaderConfig,
    scripts: ScriptList,
    units: UnitSet,
    assembler: RowAssembler,
    log: Arc<L>,
    transport: T,
    identity: String,
    limits: Limits,
    phase: Phase,
    last_sent: UnixTime,
    cursors: Cursors,
    batch: Option<Batch>,
    request: Option<Box<dyn InFlight>>,
    submitted: Option<Submitted>,
    status: Option<String>,
    stats: UploaderStats,
    stop: StopHandle,
}

impl<L: LogStore, T: Transport> Uploader<L, T> {
    /// Create an uploader starting in the `Resolve` phase.
    ///
    /// `scripts` is sorted and its active unit columns fixed here; they do
    /// not change for the life of the uploader.
    pub fn new(
        config: UploaderConfig,
        mut scripts: ScriptList,
        log: Arc<L>,
        transport: T,
        identity: impl Into<String>,
    ) -> Self {
        let units = UnitSet::resolve(&mut scripts);
        if scripts.is_empty() {
            warn!(table = %config.table, "No output scripts configured, batches will be empty");
        }
        let assembler = RowAssembler::new(&units);

        Self {
            config,
            scripts,
            units,
            assembler,
            log,
            transport,
            identity: identity.into(),
            limits: Limits::default(),
            phase: Phase::Resolve,
            last_sent: 0,
            cursors: Cursors::default(),
            batch: None,
            request: None,
            submitted: None,
            status: None,
            stats: UploaderStats::default(),
            stop: StopHandle::default(),
        }
    }

    /// Parse `json` and create an uploader from it.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] from validation; no uploader exists and
    /// nothing is sent.
    pub fn configure(
        json: &str,
        scripts: ScriptList,
        log: Arc<L>,
        transport: T,
        identity: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let config = UploaderConfig::from_json(json)?;
        Ok(Self::new(config, scripts, log, transport, identity))
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Timestamp through which rows are confirmed stored.
    pub fn last_sent(&self) -> UnixTime {
        self.last_sent
    }

    /// Diagnostic from the most recent failure, cleared on success.
    pub fn status_message(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn stats(&self) -> &UploaderStats {
        &self.stats
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// CSV header shared by every batch.
    pub fn header(&self) -> &str {
        self.units.header()
    }

    /// Device name as sent, with the marker substituted.
    pub fn device_name(&self) -> String {
        self.config.resolve_device_name(&self.identity)
    }

    /// Change the runtime identity; takes effect on the next request.
    pub fn set_device_identity(&mut self, identity: impl Into<String>) {
        self.identity = identity.into();
    }

    /// Advance the state machine by one bounded unit of work.
    pub fn step(&mut self) -> Step {
        if self.phase == Phase::Stopped {
            return Step::Stopped;
        }
        if self.stop.is_stopped() {
            self.halt();
            return Step::Stopped;
        }

        match self.phase {
            Phase::Resolve => self.resolve(),
            Phase::Write => self.write().unwrap_or_else(|err| self.log_failure(err)),
            Phase::Submit => self.submit(),
            Phase::Settle => self.settle(),
            Phase::Stopped => Step::Stopped,
        }
    }

    fn resolve(&mut self) -> Step {
        let Some(request) = self.request.as_mut() else {
            return self.issue_query();
        };

        match request.poll() {
            Readiness::Pending => Step::AwaitEvent,
            Readiness::Failed(err) => {
                self.request = None;
                self.fail(format!("Query failed: {}", err));
                Step::Retry {
                    after: QUERY_BACKOFF,
                }
            }
            Readiness::Ready(response) => {
                self.request = None;
                if response.status != StatusCode::OK {
                    self.fail(failure_message("Query", response.status, &response.body));
                    return Step::Retry {
                        after: QUERY_BACKOFF,
                    };
                }
                self.status = None;

                let found = resume::decode(&response.body).watermark();
                let first_key = self.log.first_key().unwrap_or(0);
                self.last_sent = resume::watermark(
                    found,
                    self.config.start_date,
                    first_key,
                    self.config.interval,
                );

                info!(
                    table = %self.config.table,
                    device = %self.device_name(),
                    "Start posting at {}",
                    timestamp::format(self.last_sent.saturating_add(self.config.interval))
                );
                self.phase = Phase::Write;
                Step::Continue
            }
        }
    }

    fn issue_query(&mut self) -> Step {
        if !self.transport.connected() {
            return Step::Retry {
                after: CONNECT_RETRY,
            };
        }

        let path = resume::query_path(&self.config.schema, &self.config.table, &self.device_name());
        let request = self.authorize(HttpRequest::get(path));
        match self.transport.issue(request) {
            Ok(inflight) => {
                self.request = Some(inflight);
                self.stats.queries += 1;
                Step::AwaitEvent
            }
            Err(err) => {
                self.fail(format!("Query failed: {}", err));
                Step::Retry {
                    after: QUERY_BACKOFF,
                }
            }
        }
    }

    fn write(&mut self) -> Result<Step, LogError> {
        let interval = self.config.interval;
        let threshold = self
            .last_sent
            .saturating_add(interval)
            .saturating_add(interval.saturating_mul(self.config.bulk_send));

        let last_key = match self.log.last_key() {
            Some(key) if key >= threshold => key,
            _ => {
                self.cursors.release();
                self.batch = None;
                return Ok(Step::Retry { after: DATA_WAIT });
            }
        };

        if self.cursors.is_empty() {
            self.batch = None;
            let first = self.log.read_key(self.last_sent.saturating_add(interval))?;
            self.cursors.start(first);
        }

        let device = self.device_name();
        let batch = self
            .batch
            .get_or_insert_with(|| Batch::new(self.units.header()));

        let started = Instant::now();
        let mut pairs = 0usize;
        while batch.text.len() < self.limits.buffer_limit {
            let Some(newest) = self.cursors.newest_time() else {
                break;
            };
            if newest >= last_key {
                break;
            }
            if pairs > 0 && started.elapsed() >= self.limits.time_slice {
                return Ok(Step::Retry { after: YIELD_DELAY });
            }
            pairs += 1;

            let next_key = newest.saturating_add(interval);
            let next = self.log.read_key(next_key)?;
            self.cursors.advance(next);
            let Some((old, new)) = self.cursors.pair() else {
                break;
            };

            match self
                .assembler
                .assemble(old, new, &self.scripts, &device, &mut batch.text)
            {
                Assembly::Degenerate => {
                    return Ok(if next_key.saturating_add(interval) <= last_key {
                        Step::Continue
                    } else {
                        Step::Retry { after: DATA_WAIT }
                    });
                }
                Assembly::Rows(rows) => {
                    batch.rows += rows;
                    batch.newest = Some(old.unix_time);
                }
            }
        }

        batch.text.push('\n');
        self.cursors.release();
        self.phase = Phase::Submit;
        Ok(Step::Continue)
    }

    fn submit(&mut self) -> Step {
        self.phase = Phase::Write;
        let Some(batch) = self.batch.take() else {
            return Step::Continue;
        };

        let Some(newest) = batch.newest.filter(|_| batch.rows > 0) else {
            debug!(batch_id = %batch.id, "Batch has no rows, skipping");
            return Step::Retry {
                after: EMPTY_BATCH_WAIT,
            };
        };

        if !self.transport.connected() {
            return Step::Retry {
                after: CONNECT_RETRY,
            };
        }

        debug!(
            batch_id = %batch.id,
            rows = batch.rows,
            bytes = batch.text.len(),
            "Submitting batch"
        );

        let path = resume::table_path(&self.config.schema, &self.config.table);
        let request = self.authorize(
            HttpRequest::post(path, batch.text, CONTENT_TYPE_CSV).header("Prefer", "return=minimal"),
        );
        match self.transport.issue(request) {
            Ok(inflight) => {
                self.request = Some(inflight);
                self.submitted = Some(Submitted {
                    id: batch.id,
                    rows: batch.rows,
                    watermark: newest,
                });
                self.phase = Phase::Settle;
                Step::AwaitEvent
            }
            Err(err) => {
                self.fail(format!("POST failed: {}", err));
                Step::Retry {
                    after: WRITE_BACKOFF,
                }
            }
        }
    }

    fn settle(&mut self) -> Step {
        // Nothing in flight means there is no outcome to record yet.
        let Some(request) = self.request.as_mut() else {
            self.phase = Phase::Write;
            self.submitted = None;
            return Step::Retry { after: DATA_WAIT };
        };

        let readiness = request.poll();

        let response = match readiness {
            Readiness::Pending => return Step::AwaitEvent,
            Readiness::Failed(err) => {
                self.finish_submit();
                self.fail(format!("POST failed: {}", err));
                return Step::Retry {
                    after: WRITE_BACKOFF,
                };
            }
            Readiness::Ready(response) => response,
        };

        let submitted = self.finish_submit();
        if response.status != StatusCode::CREATED {
            self.fail(failure_message("POST", response.status, &response.body));
            return Step::Retry {
                after: WRITE_BACKOFF,
            };
        }

        self.status = None;
        if let Some(submitted) = submitted {
            self.last_sent = submitted.watermark;
            self.stats.batches_sent += 1;
            self.stats.rows_sent += submitted.rows as u64;
            debug!(
                batch_id = %submitted.id,
                rows = submitted.rows,
                last_sent = %timestamp::format(self.last_sent),
                "Batch stored"
            );
        }
        Step::Continue
    }

    /// Drop the in-flight POST and return to `Write`.
    fn finish_submit(&mut self) -> Option<Submitted> {
        self.request = None;
        self.phase = Phase::Write;
        self.submitted.take()
    }

    fn log_failure(&mut self, err: LogError) -> Step {
        self.cursors.release();
        self.batch = None;
        self.fail(format!("Log read failed: {}", err));
        Step::Retry {
            after: WRITE_BACKOFF,
        }
    }

    fn halt(&mut self) {
        self.cursors.release();
        self.batch = None;
        self.request = None;
        self.submitted = None;
        self.phase = Phase::Stopped;
        info!(table = %self.config.table, last_sent = self.last_sent, "Uploader stopped");
    }

    fn authorize(&self, request: HttpRequest) -> HttpRequest {
        match &self.config.jwt_token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    fn fail(&mut self, message: String) {
        let message = bounded(message);
        warn!(phase = %self.phase, table = %self.config.table, "{}", message);
        self.stats.failed_attempts += 1;
        self.status = Some(message);
    }
}

fn failure_message(operation: &str, status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("{} failed, code {}", operation, status.as_u16())
    } else {
        format!("{} failed, code {}, response: {}", operation, status.as_u16(), body)
    }
}

/// Truncate to [`MAX_STATUS_MESSAGE`] bytes on a char boundary.
fn bounded(mut message: String) -> String {
    if message.len() > MAX_STATUS_MESSAGE {
        let mut end = MAX_STATUS_MESSAGE;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::log_store::MemoryLog;
    use crate::script::{ChannelScript, Script};
    use crate::testing::{fixed, record, MockTransport};
    use crate::units::Unit;
    use reqwest::Method;
    use serde_json::json;

    const HEADER: &str = "timestamp,device,sensor,Watts";

    /// Log with a record every `step` seconds in `0..=end`, drawing 1 kW on channel 0.
    fn meter_log(end: u32, step: u32) -> Arc<MemoryLog> {
        Arc::new(
            (0..=end)
                .step_by(step as usize)
                .map(|t| {
                    let hours = f64::from(t) / 3600.0;
                    record(t, hours, vec![hours * 1000.0])
                })
                .collect(),
        )
    }

    fn mains() -> ScriptList {
        ScriptList::from(vec![
            Arc::new(ChannelScript::new("mains", Unit::Watts, 0, 0)) as Arc<dyn Script>
        ])
    }

    fn config(extra: serde_json::Value) -> UploaderConfig {
        let mut value = json!({ "table": "readings", "postInterval": 60, "bulkSend": 2 });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            for (key, val) in extra {
                base.insert(key.clone(), val.clone());
            }
        }
        UploaderConfig::from_value(value).unwrap()
    }

    fn relaxed() -> Limits {
        Limits {
            time_slice: Duration::from_secs(60),
            buffer_limit: 4000,
        }
    }

    fn uploader(
        config: UploaderConfig,
        log: Arc<MemoryLog>,
        transport: &MockTransport,
    ) -> Uploader<MemoryLog, MockTransport> {
        Uploader::new(config, mains(), log, transport.clone(), "meter").with_limits(relaxed())
    }

    /// Step through a successful resolve with an empty remote table.
    fn resolve_empty(up: &mut Uploader<MemoryLog, MockTransport>, transport: &MockTransport) {
        transport.respond(200, "[]");
        assert_eq!(up.step(), Step::AwaitEvent);
        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.phase(), Phase::Write);
    }

    /// Step until a POST is in flight or `limit` steps pass.
    fn run_to_settle(up: &mut Uploader<MemoryLog, MockTransport>, limit: usize) {
        for _ in 0..limit {
            up.step();
            if up.phase() == Phase::Settle {
                return;
            }
        }
        panic!("no batch submitted, phase {}", up.phase());
    }

    fn body(request: &HttpRequest) -> &str {
        request.body.as_deref().unwrap_or_default()
    }

    fn row_times(request: &HttpRequest) -> Vec<String> {
        body(request)
            .lines()
            .skip(1)
            .map(|line| line.split(',').next().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_first_batch_end_to_end() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);

        transport.respond(200, "[]");
        transport.respond(201, "");

        assert_eq!(up.step(), Step::AwaitEvent);
        let requests = transport.requests();
        let query = &requests[0];
        assert_eq!(query.method, Method::GET);
        assert_eq!(
            query.path,
            "/readings?select=timestamp&device=eq.meter&order=timestamp.desc&limit=1"
        );

        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.last_sent(), 0);

        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.phase(), Phase::Submit);
        assert_eq!(up.step(), Step::AwaitEvent);
        assert_eq!(up.phase(), Phase::Settle);

        let requests = transport.requests();
        let post = &requests[1];
        assert_eq!(post.method, Method::POST);
        assert_eq!(post.path, "/readings");
        assert_eq!(post.header_value("Content-Type"), Some("text/csv"));
        assert_eq!(post.header_value("Prefer"), Some("return=minimal"));
        assert_eq!(post.header_value("Authorization"), None);
        assert_eq!(
            body(post),
            "timestamp,device,sensor,Watts\n\
             1970-01-01T00:01:00Z,meter,mains,1000\n\
             1970-01-01T00:02:00Z,meter,mains,1000\n"
        );

        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.phase(), Phase::Write);
        assert_eq!(up.last_sent(), 120);
        assert_eq!(up.status_message(), None);
        assert_eq!(
            up.stats(),
            &UploaderStats {
                queries: 1,
                batches_sent: 1,
                rows_sent: 2,
                failed_attempts: 0,
            }
        );

        // 120 + 60 + 120 = 300 is past the end of the log.
        assert_eq!(up.step(), Step::Retry { after: DATA_WAIT });
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn test_rejected_batch_is_resent_unchanged() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);
        resolve_empty(&mut up, &transport);

        transport.respond(500, "db error");
        run_to_settle(&mut up, 5);
        assert_eq!(up.step(), Step::Retry { after: WRITE_BACKOFF });

        let status = up.status_message().unwrap();
        assert!(status.contains("500"), "{}", status);
        assert!(status.contains("db error"), "{}", status);
        assert_eq!(status, "POST failed, code 500, response: db error");
        assert_eq!(up.last_sent(), 0);
        assert_eq!(up.phase(), Phase::Write);

        transport.respond(201, "");
        run_to_settle(&mut up, 5);
        assert_eq!(up.step(), Step::Continue);

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(body(&requests[1]), body(&requests[2]));
        assert_eq!(up.last_sent(), 120);
        assert_eq!(up.status_message(), None);
        assert_eq!(up.stats().failed_attempts, 1);
    }

    #[test]
    fn test_transport_failure_keeps_watermark() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);
        resolve_empty(&mut up, &transport);

        transport.fail(ClientError::Request("connection reset".to_string()));
        run_to_settle(&mut up, 5);

        assert_eq!(up.step(), Step::Retry { after: WRITE_BACKOFF });
        assert!(up.status_message().unwrap().starts_with("POST failed:"));
        assert!(up.status_message().unwrap().contains("connection reset"));
        assert_eq!(up.last_sent(), 0);
        assert_eq!(up.phase(), Phase::Write);
    }

    #[test]
    fn test_long_response_is_truncated() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);
        resolve_empty(&mut up, &transport);

        let long_body = "é".repeat(1_000);
        transport.respond(400, &long_body);
        run_to_settle(&mut up, 5);
        up.step();

        let status = up.status_message().unwrap();
        assert!(status.len() <= MAX_STATUS_MESSAGE);
        assert!(status.starts_with("POST failed, code 400, response: é"));
    }

    #[test]
    fn test_settle_waits_for_pending_response() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);
        resolve_empty(&mut up, &transport);

        transport.respond_after_pending(2, 201, "");
        run_to_settle(&mut up, 5);

        assert_eq!(up.step(), Step::AwaitEvent);
        assert_eq!(up.step(), Step::AwaitEvent);
        assert_eq!(up.last_sent(), 0);
        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.last_sent(), 120);
    }

    #[test]
    fn test_settle_without_request_waits_without_failing() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);
        resolve_empty(&mut up, &transport);
        up.phase = Phase::Settle;

        assert_eq!(up.step(), Step::Retry { after: DATA_WAIT });
        assert_eq!(up.phase(), Phase::Write);
        assert_eq!(up.stats().failed_attempts, 0);
        assert_eq!(up.status_message(), None);
        assert_eq!(up.last_sent(), 0);
    }

    #[test]
    fn test_query_failure_retries_resolve() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);

        transport.respond(503, "unavailable");
        assert_eq!(up.step(), Step::AwaitEvent);
        assert_eq!(up.step(), Step::Retry { after: QUERY_BACKOFF });
        assert_eq!(up.phase(), Phase::Resolve);
        assert_eq!(
            up.status_message(),
            Some("Query failed, code 503, response: unavailable")
        );

        transport.fail(ClientError::Timeout);
        assert_eq!(up.step(), Step::AwaitEvent);
        assert_eq!(up.step(), Step::Retry { after: QUERY_BACKOFF });
        assert_eq!(up.status_message(), Some("Query failed: Request timed out"));

        transport.respond(200, "[]");
        assert_eq!(up.step(), Step::AwaitEvent);
        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.status_message(), None);
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(up.stats().queries, 3);
    }

    #[test]
    fn test_resume_from_stored_row() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(600, 60), &transport);

        transport.respond(200, r#"[{"timestamp":"1970-01-01T00:02:05+00:00"}]"#);
        up.step();
        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.last_sent(), 120);

        transport.respond(201, "");
        run_to_settle(&mut up, 5);
        let requests = transport.requests();
        assert_eq!(row_times(&requests[1])[0], "1970-01-01T00:03:00Z");
    }

    #[test]
    fn test_resume_respects_start_date_and_log_start() {
        let transport = MockTransport::new();
        let mut up = uploader(
            config(json!({ "startDate": "1970-01-01 00:05:00" })),
            meter_log(600, 60),
            &transport,
        );
        resolve_empty(&mut up, &transport);
        assert_eq!(up.last_sent(), 300);

        let late_log: Arc<MemoryLog> = Arc::new(
            (3_600..=4_200)
                .step_by(60)
                .map(|t| record(t, f64::from(t) / 3600.0, vec![0.0]))
                .collect(),
        );
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), late_log, &transport);
        transport.respond(200, r#"[{"timestamp":"1970-01-01T00:02:00Z"}]"#);
        up.step();
        up.step();
        assert_eq!(up.last_sent(), 3_600);
    }

    #[test]
    fn test_unparseable_remote_timestamp_starts_from_beginning() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);

        transport.respond(200, r#"[{"timestamp":"not a time"}]"#);
        up.step();
        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.last_sent(), 0);
    }

    #[test]
    fn test_offline_resolve_sends_nothing() {
        let transport = MockTransport::new();
        transport.set_connected(false);
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);

        assert_eq!(up.step(), Step::Retry { after: CONNECT_RETRY });
        assert_eq!(up.step(), Step::Retry { after: CONNECT_RETRY });
        assert!(transport.requests().is_empty());

        transport.set_connected(true);
        assert_eq!(up.step(), Step::AwaitEvent);
    }

    #[test]
    fn test_offline_submit_drops_batch() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);
        resolve_empty(&mut up, &transport);

        transport.set_connected(false);
        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.step(), Step::Retry { after: CONNECT_RETRY });
        assert_eq!(up.phase(), Phase::Write);
        assert_eq!(transport.requests().len(), 1);

        transport.set_connected(true);
        transport.respond(201, "");
        run_to_settle(&mut up, 5);
        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.last_sent(), 120);
    }

    #[test]
    fn test_missing_table_builds_nothing() {
        let transport = MockTransport::new();
        let result = Uploader::configure(
            r#"{ "schema": "energy" }"#,
            mains(),
            meter_log(180, 60),
            transport.clone(),
            "meter",
        );

        assert!(matches!(result, Err(ConfigError::MissingTable)));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_waits_for_bulk_threshold() {
        let transport = MockTransport::new();
        let log = meter_log(120, 60);
        let mut up = uploader(config(json!({})), log.clone(), &transport);
        resolve_empty(&mut up, &transport);

        // Threshold is 180 with bulkSend 2.
        assert_eq!(up.step(), Step::Retry { after: DATA_WAIT });
        assert_eq!(up.phase(), Phase::Write);

        log.append(record(180, 180.0 / 3600.0, vec![50.0]));
        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.phase(), Phase::Submit);
    }

    #[test]
    fn test_degenerate_pair_skipped() {
        let transport = MockTransport::new();
        // No record at 120: reading it returns the 60 record with no new hours.
        let log: Arc<MemoryLog> = Arc::new(
            [0u32, 60, 180, 240, 300]
                .into_iter()
                .map(|t| {
                    let hours = f64::from(t) / 3600.0;
                    record(t, hours, vec![hours * 1000.0])
                })
                .collect(),
        );
        let mut up = uploader(config(json!({ "bulkSend": 1 })), log, &transport);
        resolve_empty(&mut up, &transport);

        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.phase(), Phase::Write);

        transport.respond(201, "");
        run_to_settle(&mut up, 5);
        let requests = transport.requests();
        assert_eq!(
            row_times(&requests[1]),
            vec![
                "1970-01-01T00:02:00Z",
                "1970-01-01T00:03:00Z",
                "1970-01-01T00:04:00Z"
            ]
        );

        up.step();
        assert_eq!(up.last_sent(), 240);
    }

    #[test]
    fn test_degenerate_pair_at_log_end_waits() {
        let transport = MockTransport::new();
        let log: Arc<MemoryLog> = Arc::new(
            [record(0, 0.0, vec![0.0]), record(60, 1.0, vec![1.0]), record(120, 1.0, vec![1.0])]
                .into_iter()
                .collect(),
        );
        let mut up = uploader(config(json!({ "bulkSend": 1 })), log, &transport);
        resolve_empty(&mut up, &transport);

        assert_eq!(up.step(), Step::Retry { after: DATA_WAIT });
        assert_eq!(up.phase(), Phase::Write);
    }

    #[test]
    fn test_time_slice_yield_resumes_without_loss() {
        let reference = {
            let transport = MockTransport::new();
            let mut up = uploader(config(json!({ "bulkSend": 1 })), meter_log(300, 60), &transport);
            resolve_empty(&mut up, &transport);
            run_to_settle(&mut up, 5);
            body(&transport.requests()[1]).to_string()
        };

        let transport = MockTransport::new();
        let mut up = Uploader::new(
            config(json!({ "bulkSend": 1 })),
            mains(),
            meter_log(300, 60),
            transport.clone(),
            "meter",
        )
        .with_limits(Limits {
            time_slice: Duration::ZERO,
            buffer_limit: 4000,
        });
        resolve_empty(&mut up, &transport);

        let mut yields = 0;
        loop {
            match up.step() {
                Step::Retry { after } => {
                    assert_eq!(after, YIELD_DELAY);
                    yields += 1;
                }
                Step::Continue => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(yields, 3);
        assert_eq!(up.phase(), Phase::Submit);

        up.step();
        assert_eq!(body(&transport.requests()[1]), reference);
        assert_eq!(row_times(&transport.requests()[1]).len(), 4);
    }

    #[test]
    fn test_buffer_limit_splits_batches() {
        let transport = MockTransport::new();
        let mut up = Uploader::new(
            config(json!({ "bulkSend": 1 })),
            mains(),
            meter_log(300, 60),
            transport.clone(),
            "meter",
        )
        .with_limits(Limits {
            time_slice: Duration::from_secs(60),
            buffer_limit: HEADER.len() + 1,
        });
        resolve_empty(&mut up, &transport);

        transport.respond(201, "");
        run_to_settle(&mut up, 5);
        assert_eq!(row_times(&transport.requests()[1]), vec!["1970-01-01T00:01:00Z"]);
        up.step();
        assert_eq!(up.last_sent(), 60);

        transport.respond(201, "");
        run_to_settle(&mut up, 5);
        assert_eq!(row_times(&transport.requests()[2]), vec!["1970-01-01T00:02:00Z"]);
        up.step();
        assert_eq!(up.last_sent(), 120);
    }

    #[test]
    fn test_empty_batch_is_not_posted() {
        let transport = MockTransport::new();
        let mut up = Uploader::new(
            config(json!({})),
            ScriptList::default(),
            meter_log(180, 60),
            transport.clone(),
            "meter",
        )
        .with_limits(relaxed());
        resolve_empty(&mut up, &transport);

        assert_eq!(up.step(), Step::Continue);
        assert_eq!(up.step(), Step::Retry { after: EMPTY_BATCH_WAIT });
        assert_eq!(up.phase(), Phase::Write);
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(up.last_sent(), 0);
    }

    #[test]
    fn test_stop_abandons_in_flight_batch() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);
        resolve_empty(&mut up, &transport);
        run_to_settle(&mut up, 5);

        up.stop_handle().stop();
        assert_eq!(up.step(), Step::Stopped);
        assert_eq!(up.phase(), Phase::Stopped);
        assert_eq!(up.step(), Step::Stopped);
        assert_eq!(up.last_sent(), 0);
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn test_stop_before_first_step() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({})), meter_log(180, 60), &transport);
        let handle = up.stop_handle();
        handle.stop();

        assert!(handle.is_stopped());
        assert_eq!(up.step(), Step::Stopped);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_auth_schema_and_device_template() {
        let transport = MockTransport::new();
        let mut up = uploader(
            config(json!({
                "schema": "energy",
                "jwtToken": "tok",
                "deviceName": "site-$device"
            })),
            meter_log(180, 60),
            &transport,
        );
        resolve_empty(&mut up, &transport);
        run_to_settle(&mut up, 5);

        let requests = transport.requests();
        assert_eq!(
            requests[0].path,
            "/energy.readings?select=timestamp&device=eq.site-meter&order=timestamp.desc&limit=1"
        );
        assert_eq!(requests[0].header_value("Authorization"), Some("Bearer tok"));
        assert_eq!(requests[1].path, "/energy.readings");
        assert_eq!(requests[1].header_value("Authorization"), Some("Bearer tok"));
        assert!(body(&requests[1]).contains(",site-meter,mains,"));
    }

    #[test]
    fn test_device_identity_change_applies_to_next_batch() {
        let transport = MockTransport::new();
        let mut up = uploader(config(json!({ "bulkSend": 1 })), meter_log(300, 60), &transport);
        resolve_empty(&mut up, &transport);
        up.set_device_identity("garage");
        assert_eq!(up.device_name(), "garage");

        run_to_settle(&mut up, 5);
        assert!(body(&transport.requests()[1]).contains(",garage,mains,"));
    }

    #[test]
    fn test_log_read_error_backs_off() {
        struct BrokenLog;
        impl LogStore for BrokenLog {
            fn read_key(&self, key: UnixTime) -> Result<LogRecord, LogError> {
                Err(LogError::Read {
                    key,
                    message: "checksum mismatch".to_string(),
                })
            }
            fn first_key(&self) -> Option<UnixTime> {
                Some(0)
            }
            fn last_key(&self) -> Option<UnixTime> {
                Some(600)
            }
        }

        let transport = MockTransport::new();
        let mut up = Uploader::new(
            config(json!({})),
            ScriptList::from(vec![fixed("mains", Unit::Watts, 1.0)]),
            Arc::new(BrokenLog),
            transport.clone(),
            "meter",
        );
        transport.respond(200, "[]");
        up.step();
        up.step();

        assert_eq!(up.step(), Step::Retry { after: WRITE_BACKOFF });
        assert_eq!(up.phase(), Phase::Write);
        assert!(up.status_message().unwrap().contains("checksum mismatch"));
        assert_eq!(up.stats().failed_attempts, 1);
    }

    #[test]
    fn test_header_is_fixed_at_construction() {
        let transport = MockTransport::new();
        let up = uploader(config(json!({})), meter_log(180, 60), &transport);
        assert_eq!(up.header(), HEADER);
    }

    #[test]
    fn test_bounded_respects_char_boundaries() {
        let message = format!("{}{}", "a".repeat(MAX_STATUS_MESSAGE - 1), "é");
        let truncated = bounded(message);
        assert_eq!(truncated.len(), MAX_STATUS_MESSAGE - 1);
        assert_eq!(bounded(String::from("short")), "short");
    }

    #[test]
    fn test_failure_message_without_body() {
        assert_eq!(
            failure_message("POST", StatusCode::BAD_GATEWAY, "  "),
            "POST failed, code 502"
        );
    }
}
