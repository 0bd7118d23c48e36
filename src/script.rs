//! Output scripts: named, unit-tagged value producers evaluated over a pair
//! of adjacent log records.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::config::OutputSpec;
use crate::log_store::LogRecord;
use crate::units::Unit;

/// A value producer for one (sensor, unit) column.
pub trait Script: Send + Sync {
    /// Sensor name; scripts sharing a name are uploaded as one row.
    fn name(&self) -> &str;

    fn unit(&self) -> Unit;

    /// Decimal places used when formatting values.
    fn precision(&self) -> usize;

    /// Evaluate over the interval `old..new`.
    ///
    /// Returns NaN when there is no value at this instant.
    fn run(&self, old: &LogRecord, new: &LogRecord) -> f64;
}

impl fmt::Debug for dyn Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name())
            .field("unit", &self.unit())
            .field("precision", &self.precision())
            .finish()
    }
}

/// Order scripts by sensor name, then by canonical unit position.
pub fn compare_name_then_unit(a: &dyn Script, b: &dyn Script) -> Ordering {
    a.name()
        .cmp(b.name())
        .then_with(|| a.unit().index().cmp(&b.unit().index()))
}

/// Ordered list of output scripts.
#[derive(Clone, Default, Debug)]
pub struct ScriptList {
    scripts: Vec<Arc<dyn Script>>,
}

impl ScriptList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build channel scripts from configured outputs.
    pub fn from_outputs(outputs: &[OutputSpec]) -> Self {
        let mut list = Self::new();
        for output in outputs {
            list.push(Arc::new(ChannelScript::from(output)));
        }
        list
    }

    pub fn push(&mut self, script: Arc<dyn Script>) {
        self.scripts.push(script);
    }

    /// Stable in-place sort.
    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&dyn Script, &dyn Script) -> Ordering,
    {
        self.scripts.sort_by(|a, b| compare(a.as_ref(), b.as_ref()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Script> + '_ {
        self.scripts.iter().map(|script| script.as_ref())
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl From<Vec<Arc<dyn Script>>> for ScriptList {
    fn from(scripts: Vec<Arc<dyn Script>>) -> Self {
        Self { scripts }
    }
}

/// Script reading one accumulator channel of the meter log.
///
/// Energy units report the accumulated delta; every other unit reports the
/// average over the elapsed logged hours.
#[derive(Debug, Clone)]
pub struct ChannelScript {
    name: String,
    unit: Unit,
    precision: usize,
    channel: usize,
}

impl ChannelScript {
    pub fn new(name: impl Into<String>, unit: Unit, precision: usize, channel: usize) -> Self {
        Self {
            name: name.into(),
            unit,
            precision,
            channel,
        }
    }
}

impl From<&OutputSpec> for ChannelScript {
    fn from(output: &OutputSpec) -> Self {
        Self::new(
            output.name.clone(),
            output.units,
            output.precision,
            output.channel,
        )
    }
}

impl Script for ChannelScript {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> Unit {
        self.unit
    }

    fn precision(&self) -> usize {
        self.precision
    }

    fn run(&self, old: &LogRecord, new: &LogRecord) -> f64 {
        let hours = new.log_hours - old.log_hours;
        let (Some(before), Some(after)) = (old.accum.get(self.channel), new.accum.get(self.channel))
        else {
            return f64::NAN;
        };
        if hours <= 0.0 {
            return f64::NAN;
        }

        let delta = after - before;
        if self.unit.is_energy() {
            delta
        } else {
            delta / hours
        }
    }
}
