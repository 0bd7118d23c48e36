//! Measurement units and the per-configuration set of active unit columns.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::script::{compare_name_then_unit, ScriptList};

/// Unit kinds a script can produce, in canonical column order.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Unit {
    Volts,
    Watts,
    Wh,
    Amps,
    VA,
    VAh,
    VAR,
    VARh,
    PF,
    Hz,
}

impl Unit {
    /// Number of unit kinds.
    pub const COUNT: usize = 10;

    /// All unit kinds in canonical order.
    pub const ALL: [Unit; Unit::COUNT] = [
        Unit::Volts,
        Unit::Watts,
        Unit::Wh,
        Unit::Amps,
        Unit::VA,
        Unit::VAh,
        Unit::VAR,
        Unit::VARh,
        Unit::PF,
        Unit::Hz,
    ];

    /// Position of this unit in the canonical order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Column name used in the remote table.
    pub fn column(self) -> &'static str {
        match self {
            Unit::Volts => "Volts",
            Unit::Watts => "Watts",
            Unit::Wh => "Wh",
            Unit::Amps => "Amps",
            Unit::VA => "VA",
            Unit::VAh => "VAh",
            Unit::VAR => "VAR",
            Unit::VARh => "VARh",
            Unit::PF => "PF",
            Unit::Hz => "Hz",
        }
    }

    /// Whether the unit is an accumulated quantity rather than an average rate.
    pub fn is_energy(self) -> bool {
        matches!(self, Unit::Wh | Unit::VAh | Unit::VARh)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// The fixed set of unit columns present in every uploaded row.
///
/// Computed once per configuration. The CSV header is built at the same
/// time and reused verbatim for every batch, so the column layout cannot
/// drift during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSet {
    active: [bool; Unit::COUNT],
    header: String,
}

impl UnitSet {
    /// Sort `scripts` by (name, unit) and derive the active unit columns.
    ///
    /// The sort is stable, so resolving an already-sorted list leaves its
    /// order untouched.
    pub fn resolve(scripts: &mut ScriptList) -> Self {
        scripts.sort_by(compare_name_then_unit);

        let mut active = [false; Unit::COUNT];
        let mut previous: Option<(&str, Unit)> = None;
        for script in scripts.iter() {
            active[script.unit().index()] = true;

            let key = (script.name(), script.unit());
            if previous == Some(key) {
                warn!(
                    sensor = script.name(),
                    unit = %script.unit(),
                    "Duplicate unit for sensor; only the first value is uploaded"
                );
            }
            previous = Some(key);
        }

        let mut header = String::from("timestamp,device,sensor");
        for unit in Unit::ALL.iter().filter(|unit| active[unit.index()]) {
            header.push(',');
            header.push_str(unit.column());
        }

        debug!(header = %header, scripts = scripts.len(), "Resolved unit columns");

        Self { active, header }
    }

    pub fn is_active(&self, unit: Unit) -> bool {
        self.active[unit.index()]
    }

    /// Active flag for each unit position, in canonical order.
    pub fn flags(&self) -> &[bool; Unit::COUNT] {
        &self.active
    }

    /// Active units in canonical order.
    pub fn units(&self) -> impl Iterator<Item = Unit> + '_ {
        Unit::ALL.into_iter().filter(|unit| self.is_active(*unit))
    }

    pub fn header(&self) -> &str {
        &self.header
    }
}
