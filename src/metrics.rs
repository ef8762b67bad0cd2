use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;

/// The exported gauge families. Every family carries a single `phase` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    Current,
    Voltage,
    ActivePower,
    ApparentPower,
    PowerFactor,
    Frequency,
    TotalActiveEnergy,
    TotalActiveEnergyReturned,
}

impl Family {
    pub const ALL: [Family; 8] = [
        Family::Current,
        Family::Voltage,
        Family::ActivePower,
        Family::ApparentPower,
        Family::PowerFactor,
        Family::Frequency,
        Family::TotalActiveEnergy,
        Family::TotalActiveEnergyReturned,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Family::Current => "energy_meter_current",
            Family::Voltage => "energy_meter_voltage",
            Family::ActivePower => "energy_meter_active_power",
            Family::ApparentPower => "energy_meter_apparent_power",
            Family::PowerFactor => "energy_meter_pf",
            Family::Frequency => "energy_meter_freq",
            Family::TotalActiveEnergy => "energy_meter_total_active_energy",
            Family::TotalActiveEnergyReturned => "energy_meter_total_active_energy_returned",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Family::Current => "Momentary current in A by phase, or total for all phases",
            Family::Voltage => "Momentary voltage in V by phase",
            Family::ActivePower => "Momentary active power in W by phase, or total for all phases",
            Family::ApparentPower => {
                "Momentary apparent power in W by phase, or total for all phases"
            }
            Family::PowerFactor => "Momentary power factor by phase",
            Family::Frequency => "Momentary freq in Hz by phase",
            Family::TotalActiveEnergy => {
                "Total active energy in Wh by phase, or total for all phases"
            }
            Family::TotalActiveEnergyReturned => {
                "Total active energy returned in Wh by phase, or total for all phases"
            }
        }
    }
}

/// Value of the `phase` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    A,
    B,
    C,
    Total,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::A => "A",
            Phase::B => "B",
            Phase::C => "C",
            Phase::Total => "total",
        }
    }
}

/// Last-seen value of every (family, phase) gauge.
///
/// One lock covers the whole map, so a scrape sees each decoded message
/// either fully applied or not at all. Entries are never evicted: a gauge
/// keeps its last value after the meter stops reporting.
#[derive(Debug, Default)]
pub struct Registry {
    values: RwLock<BTreeMap<(Family, Phase), f64>>,
}

/// Exclusive write access to the registry; readers wait until it is dropped.
pub struct RegistryWriter<'a> {
    values: RwLockWriteGuard<'a, BTreeMap<(Family, Phase), f64>>,
}

impl RegistryWriter<'_> {
    /// Upsert a gauge value.
    pub fn set(&mut self, family: Family, phase: Phase, value: f64) {
        self.values.insert((family, phase), value);
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self) -> RegistryWriter<'_> {
        RegistryWriter {
            values: self.values.write(),
        }
    }

    /// Render all families in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let values = self.values.read();
        let mut out = String::with_capacity(2048);

        for family in Family::ALL {
            let name = family.name();
            out.push_str("# HELP ");
            out.push_str(name);
            out.push(' ');
            out.push_str(family.help());
            out.push('\n');
            out.push_str("# TYPE ");
            out.push_str(name);
            out.push_str(" gauge\n");

            for ((_, phase), value) in values.range((family, Phase::A)..=(family, Phase::Total)) {
                out.push_str(name);
                out.push_str("{phase=\"");
                out.push_str(phase.label());
                out.push_str("\"} ");
                out.push_str(&format_value(*value));
                out.push('\n');
            }
        }

        out
    }
}

#[cfg(test)]
impl Registry {
    pub fn get(&self, family: Family, phase: Phase) -> Option<f64> {
        self.values.read().get(&(family, phase)).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<(Family, Phase), f64> {
        self.values.read().clone()
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}
