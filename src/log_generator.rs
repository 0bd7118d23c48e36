//! Simulated energy-meter log.
//!
//! Produces [`LogRecord`]s the way a metering device would: each record adds
//! the hours since the previous one to the cumulative logged hours and adds
//! the per-channel value-hours to the accumulators. Occasional outages add
//! time without logged hours, which the uploader sees as degenerate pairs.

use rand::Rng;

use crate::log_store::{LogRecord, MemoryLog};
use crate::timestamp::UnixTime;

/// Load on one simulated channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelProfile {
    /// Average reading (volts, watts, ...)
    pub base: f64,

    /// Relative jitter applied to each sample (0.1 = ±10%)
    pub jitter: f64,
}

impl ChannelProfile {
    pub fn new(base: f64, jitter: f64) -> Self {
        Self { base, jitter }
    }
}

/// Configuration for the meter simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// One profile per accumulator channel
    pub channels: Vec<ChannelProfile>,

    /// Probability (0.0 - 1.0) that a sample falls in a logging outage
    pub outage_rate: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            channels: vec![
                // Line voltage
                ChannelProfile::new(120.0, 0.02),
                // Whole-house load
                ChannelProfile::new(1_500.0, 0.4),
                // Solar inverter
                ChannelProfile::new(800.0, 0.6),
            ],
            outage_rate: 0.01,
        }
    }
}

/// Meter log generator.
#[derive(Debug, Clone)]
pub struct MeterSimulator {
    config: SimulatorConfig,
    unix_time: UnixTime,
    log_hours: f64,
    accum: Vec<f64>,
}

impl MeterSimulator {
    /// Create a simulator whose first record is at `start`.
    pub fn new(config: SimulatorConfig, start: UnixTime) -> Self {
        let accum = vec![0.0; config.channels.len()];
        Self {
            config,
            unix_time: start,
            log_hours: 0.0,
            accum,
        }
    }

    pub fn with_defaults(start: UnixTime) -> Self {
        Self::new(SimulatorConfig::default(), start)
    }

    /// Time of the most recent record.
    pub fn current_time(&self) -> UnixTime {
        self.unix_time
    }

    /// The record at the current time.
    pub fn current(&self) -> LogRecord {
        LogRecord {
            unix_time: self.unix_time,
            log_hours: self.log_hours,
            accum: self.accum.clone(),
        }
    }

    /// Advance the meter to `unix_time` and return the new record.
    ///
    /// Returns `None` when `unix_time` is not after the current time.
    pub fn record_at(&mut self, unix_time: UnixTime, rng: &mut impl Rng) -> Option<LogRecord> {
        if unix_time <= self.unix_time {
            return None;
        }
        let hours = f64::from(unix_time - self.unix_time) / 3600.0;
        self.unix_time = unix_time;

        if !rng.gen_bool(outage_probability(self.config.outage_rate)) {
            self.log_hours += hours;
            for (accum, profile) in self.accum.iter_mut().zip(&self.config.channels) {
                *accum += sample(rng, profile) * hours;
            }
        }

        Some(self.current())
    }

    /// Append records every `step` seconds up to and including `until`.
    ///
    /// Returns the number of records appended.
    pub fn fill(&mut self, log: &MemoryLog, until: UnixTime, step: u32, rng: &mut impl Rng) -> usize {
        let mut appended = 0;
        if log.is_empty() && log.append(self.current()) {
            appended += 1;
        }

        let step = step.max(1);
        while let Some(next) = self.unix_time.checked_add(step).filter(|t| *t <= until) {
            if let Some(record) = self.record_at(next, rng) {
                if log.append(record) {
                    appended += 1;
                }
            }
        }
        appended
    }
}

fn outage_probability(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn sample(rng: &mut impl Rng, profile: &ChannelProfile) -> f64 {
    let jitter = profile.jitter.abs();
    if jitter == 0.0 {
        return profile.base;
    }
    (profile.base * rng.gen_range(1.0 - jitter..1.0 + jitter)).max(0.0)
}
