//! Row assembly: one adjacent record pair in, one CSV row per sensor out.

use std::borrow::Cow;
use std::fmt::Write;

use crate::log_store::LogRecord;
use crate::script::ScriptList;
use crate::timestamp;
use crate::units::{Unit, UnitSet};

/// Outcome of assembling one record pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assembly {
    /// No logged hours elapsed between the records; nothing was written.
    Degenerate,

    /// Number of rows appended to the buffer.
    Rows(usize),
}

/// Writes CSV rows for the active unit layout of one configuration.
#[derive(Debug, Clone)]
pub struct RowAssembler {
    active: [bool; Unit::COUNT],
}

impl RowAssembler {
    pub fn new(units: &UnitSet) -> Self {
        Self {
            active: *units.flags(),
        }
    }

    /// Append rows for the pair `old..new` to `out`.
    ///
    /// `scripts` must be sorted by (name, unit); each run of equal names
    /// becomes one row stamped with `old`'s time. A script evaluating to NaN
    /// leaves its column NULL. A second script for a unit already written in
    /// the current row is dropped.
    pub fn assemble(
        &self,
        old: &LogRecord,
        new: &LogRecord,
        scripts: &ScriptList,
        device: &str,
        out: &mut String,
    ) -> Assembly {
        let elapsed_hours = new.log_hours - old.log_hours;
        if elapsed_hours == 0.0 {
            return Assembly::Degenerate;
        }

        let stamp = timestamp::format(old.unix_time);
        let device = csv_field(device);

        let mut rows = 0;
        let mut sensor: Option<&str> = None;
        let mut cursor = 0;

        for script in scripts.iter() {
            if sensor != Some(script.name()) {
                if sensor.is_some() {
                    self.fill_nulls(&mut cursor, Unit::COUNT, out);
                }
                write!(out, "\n{},{},{}", stamp, device, csv_field(script.name())).ok();
                sensor = Some(script.name());
                cursor = 0;
                rows += 1;
            }

            let value = script.run(old, new);
            if !value.is_finite() {
                continue;
            }

            let position = script.unit().index();
            if position < cursor {
                continue;
            }
            self.fill_nulls(&mut cursor, position, out);
            write!(out, ",{:.*}", script.precision(), value).ok();
            cursor += 1;
        }

        if sensor.is_some() {
            self.fill_nulls(&mut cursor, Unit::COUNT, out);
        }

        Assembly::Rows(rows)
    }

    /// Emit NULL for each active column in `cursor..until`.
    fn fill_nulls(&self, cursor: &mut usize, until: usize, out: &mut String) {
        while *cursor < until {
            if self.active[*cursor] {
                out.push_str(",NULL");
            }
            *cursor += 1;
        }
    }
}

/// Quote a CSV field when it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}
