//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use reqwest::StatusCode;

use crate::client::ClientError;
use crate::log_store::LogRecord;
use crate::script::Script;
use crate::transport::{HttpRequest, HttpResponse, InFlight, Readiness, Transport};
use crate::units::Unit;

pub fn record(unix_time: u32, log_hours: f64, accum: Vec<f64>) -> LogRecord {
    LogRecord {
        unix_time,
        log_hours,
        accum,
    }
}

/// Script that always produces the same value.
pub struct FixedScript {
    name: String,
    unit: Unit,
    precision: usize,
    value: f64,
}

impl Script for FixedScript {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> Unit {
        self.unit
    }

    fn precision(&self) -> usize {
        self.precision
    }

    fn run(&self, _old: &LogRecord, _new: &LogRecord) -> f64 {
        self.value
    }
}

pub fn fixed(name: &str, unit: Unit, value: f64) -> Arc<dyn Script> {
    fixed_with_precision(name, unit, 2, value)
}

pub fn fixed_with_precision(name: &str, unit: Unit, precision: usize, value: f64) -> Arc<dyn Script> {
    Arc::new(FixedScript {
        name: name.to_string(),
        unit,
        precision,
        value,
    })
}

#[derive(Default)]
struct MockState {
    offline: bool,
    requests: Vec<HttpRequest>,
    replies: VecDeque<Vec<Readiness>>,
}

/// Transport that records requests and replays queued readiness sequences.
///
/// Each issued request takes the next queued sequence; its handle returns
/// the sequence one poll at a time and then repeats the last value. With
/// nothing queued a request stays pending forever.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().offline = !connected;
    }

    pub fn respond(&self, status: u16, body: &str) {
        self.respond_after_pending(0, status, body);
    }

    pub fn respond_after_pending(&self, pending_polls: usize, status: u16, body: &str) {
        let mut sequence = vec![Readiness::Pending; pending_polls];
        sequence.push(Readiness::Ready(HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
        }));
        self.lock().replies.push_back(sequence);
    }

    pub fn fail(&self, err: ClientError) {
        self.lock().replies.push_back(vec![Readiness::Failed(err)]);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().requests.clone()
    }
}

impl Transport for MockTransport {
    fn connected(&self) -> bool {
        !self.lock().offline
    }

    fn issue(&mut self, request: HttpRequest) -> Result<Box<dyn InFlight>, ClientError> {
        let mut state = self.lock();
        state.requests.push(request);
        let sequence = state.replies.pop_front().unwrap_or_default();
        Ok(Box::new(MockInFlight {
            sequence: sequence.into(),
            last: Readiness::Pending,
        }))
    }
}

struct MockInFlight {
    sequence: VecDeque<Readiness>,
    last: Readiness,
}

impl InFlight for MockInFlight {
    fn poll(&mut self) -> Readiness {
        if let Some(next) = self.sequence.pop_front() {
            self.last = next;
        }
        self.last.clone()
    }
}
