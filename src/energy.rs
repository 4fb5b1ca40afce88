//! Energy counters integrated from instantaneous power readings.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::snapshot::Snapshot;

/// Picks the share of a signed power reading a channel is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignTransform {
    /// `max(p, 0)`: import, charge, production.
    Positive,
    /// `max(-p, 0)`: export, discharge.
    Negated,
}

impl SignTransform {
    pub fn apply(self, power: f64) -> f64 {
        match self {
            SignTransform::Positive => power.max(0.0),
            SignTransform::Negated => (-power).max(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyChannel {
    pub key: &'static str,
    pub name: &'static str,
    pub source: &'static str,
    pub transform: SignTransform,
}

pub const ENERGY_CHANNELS: &[EnergyChannel] = &[
    EnergyChannel {
        key: "grid_import",
        name: "Grid import energy",
        source: "grid_power",
        transform: SignTransform::Positive,
    },
    EnergyChannel {
        key: "grid_export",
        name: "Grid export energy",
        source: "grid_power",
        transform: SignTransform::Negated,
    },
    EnergyChannel {
        key: "battery_charge",
        name: "Battery charge energy",
        source: "battery_power",
        transform: SignTransform::Positive,
    },
    EnergyChannel {
        key: "battery_discharge",
        name: "Battery discharge energy",
        source: "battery_power",
        transform: SignTransform::Negated,
    },
    EnergyChannel {
        key: "solar_production",
        name: "PV energy",
        source: "pv_power",
        transform: SignTransform::Positive,
    },
    EnergyChannel {
        key: "wallbox_energy",
        name: "Wallbox energy",
        source: "wallbox_power",
        transform: SignTransform::Positive,
    },
    EnergyChannel {
        key: "wallbox_solar_energy",
        name: "Wallbox solar energy",
        source: "wallbox_solar_power",
        transform: SignTransform::Positive,
    },
];

/// Running kWh total for one channel.
#[derive(Debug, Clone)]
pub struct EnergyAccumulator {
    channel: EnergyChannel,
    energy_kwh: Option<f64>,
    last_update: DateTime<Utc>,
}

impl EnergyAccumulator {
    /// `prior` is the last persisted value. Anything that is not a finite,
    /// non-negative number counts as "no prior value".
    pub fn new(channel: EnergyChannel, prior: Option<&str>, now: DateTime<Utc>) -> Self {
        let energy_kwh = prior
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value >= 0.0);
        if prior.is_some() && energy_kwh.is_none() {
            debug!("Ignoring unusable prior value {prior:?} for {}", channel.key);
        }
        Self {
            channel,
            energy_kwh,
            last_update: now,
        }
    }

    pub fn channel(&self) -> &EnergyChannel {
        &self.channel
    }

    /// Rounded to Wh resolution; `None` until seeded or first integrated.
    pub fn value(&self) -> Option<f64> {
        self.energy_kwh.map(|kwh| (kwh * 1000.0).round() / 1000.0)
    }

    /// Full-precision value, as persisted.
    pub fn raw_value(&self) -> Option<f64> {
        self.energy_kwh
    }

    /// Integrates the channel's power over the time since the last call.
    pub fn integrate(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) {
        let elapsed = (now - self.last_update).num_microseconds().unwrap_or(0) as f64 / 1e6;
        self.last_update = now;
        if elapsed <= 0.0 {
            return;
        }

        let Some(power) = snapshot.number(self.channel.source) else {
            return;
        };
        let power = self.channel.transform.apply(power);
        let energy = self.energy_kwh.get_or_insert(0.0);
        *energy += (power / 1000.0) * (elapsed / 3600.0);
    }
}

/// Persisted accumulator values keyed by channel.
///
/// Values are kept as strings, the way a state store hands them back; a value
/// that does not parse is simply not restored.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyCheckpoint {
    pub saved_at: Option<DateTime<Utc>>,
    pub values: BTreeMap<String, String>,
}

impl EnergyCheckpoint {
    pub fn from_accumulators<'a>(
        accumulators: impl IntoIterator<Item = &'a EnergyAccumulator>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            saved_at: Some(now),
            values: accumulators
                .into_iter()
                .filter_map(|acc| {
                    acc.raw_value()
                        .map(|value| (acc.channel().key.to_string(), value.to_string()))
                })
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// A missing file is an empty checkpoint.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(BridgeError::Configuration(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&contents).map_err(|e| {
            BridgeError::Configuration(format!("cannot parse {}: {e}", path.display()))
        })
    }

    /// Writes through a temporary file so a crash never leaves half a checkpoint.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BridgeError::Configuration(format!("cannot encode checkpoint: {e}")))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| BridgeError::Configuration(format!("cannot write {}: {e}", path.display())))
    }
}
