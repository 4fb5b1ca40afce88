use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use std::collections::BTreeMap;

use crate::registers::MAX_WALLBOXES;

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RegisterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RegisterValue::Integer(v) => Some(*v as f64),
            RegisterValue::Float(v) => Some(*v),
            RegisterValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RegisterValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RegisterValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Result of one poll cycle.
///
/// `None` in `values` or `wallbox_ctrl` means the read failed during that cycle;
/// consumers must treat it as unknown, never as zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub values: BTreeMap<String, Option<RegisterValue>>,
    /// Raw control register per wallbox index, always `MAX_WALLBOXES` long.
    pub wallbox_ctrl: Vec<Option<u16>>,
    /// Empty when `ems_status` could not be read.
    pub ems: BTreeMap<String, bool>,
    /// Status flags per wallbox index; absent for wallboxes that failed to read.
    pub wallbox_status: BTreeMap<u8, BTreeMap<String, bool>>,
    pub autarky: Option<u8>,
    pub self_consumption: Option<u8>,
}

impl Snapshot {
    pub fn new(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            values: BTreeMap::new(),
            wallbox_ctrl: vec![None; usize::from(MAX_WALLBOXES)],
            ems: BTreeMap::new(),
            wallbox_status: BTreeMap::new(),
            autarky: None,
            self_consumption: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&RegisterValue> {
        self.values.get(name).and_then(Option::as_ref)
    }

    /// Numeric field, including the derived autarky and self-consumption percentages.
    pub fn number(&self, name: &str) -> Option<f64> {
        match name {
            "autarky" => self.autarky.map(f64::from),
            "self_consumption" => self.self_consumption.map(f64::from),
            _ => self.get(name).and_then(RegisterValue::as_f64),
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(RegisterValue::as_str)
    }

    pub fn ems_flag(&self, name: &str) -> Option<bool> {
        self.ems.get(name).copied()
    }

    pub fn wallbox_ctrl(&self, index: u8) -> Option<u16> {
        self.wallbox_ctrl.get(usize::from(index)).copied().flatten()
    }

    /// Live state of one wallbox control bit.
    pub fn wallbox_bit(&self, index: u8, bit: u8) -> Option<bool> {
        let mask = 1u16.checked_shl(u32::from(bit))?;
        self.wallbox_ctrl(index).map(|value| value & mask != 0)
    }

    pub fn wallbox_status(&self, index: u8, name: &str) -> Option<bool> {
        self.wallbox_status.get(&index)?.get(name).copied()
    }

    /// Number of fields that were actually read this cycle.
    pub fn populated(&self) -> usize {
        self.values.values().filter(|v| v.is_some()).count()
            + self.wallbox_ctrl.iter().filter(|v| v.is_some()).count()
    }

    pub fn manufacturer(&self) -> &str {
        match self.text("manufacturer") {
            Some(name) if !name.is_empty() => name,
            _ => "HagerEnergy / E3/DC",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new(Utc::now());
        snapshot
            .values
            .insert("grid_power".into(), Some(RegisterValue::Integer(-1200)));
        snapshot.values.insert("sg_ready_status".into(), None);
        snapshot
            .values
            .insert("model".into(), Some(RegisterValue::Text("S10 E".into())));
        snapshot.wallbox_ctrl[1] = Some(0b0100_0010);
        snapshot.autarky = Some(75);
        snapshot
    }

    #[test]
    fn test_absent_is_not_zero() {
        let snapshot = sample();
        assert_eq!(snapshot.number("grid_power"), Some(-1200.0));
        assert_eq!(snapshot.number("sg_ready_status"), None);
        assert_eq!(snapshot.number("never_read"), None);
        assert_eq!(snapshot.number("model"), None);
        assert_eq!(snapshot.text("model"), Some("S10 E"));
    }

    #[test]
    fn test_derived_numbers() {
        let snapshot = sample();
        assert_eq!(snapshot.number("autarky"), Some(75.0));
        assert_eq!(snapshot.number("self_consumption"), None);
    }

    #[test]
    fn test_wallbox_bits() {
        let snapshot = sample();
        assert_eq!(snapshot.wallbox_bit(1, 1), Some(true));
        assert_eq!(snapshot.wallbox_bit(1, 2), Some(false));
        assert_eq!(snapshot.wallbox_bit(1, 6), Some(true));
        assert_eq!(snapshot.wallbox_bit(0, 1), None);
        assert_eq!(snapshot.wallbox_bit(42, 1), None);
        // Past the 16-bit register
        assert_eq!(snapshot.wallbox_bit(1, 16), None);
        assert_eq!(snapshot.wallbox_bit(1, u8::MAX), None);
    }

    #[test]
    fn test_populated_and_manufacturer() {
        let snapshot = sample();
        assert_eq!(snapshot.populated(), 3);
        assert_eq!(snapshot.manufacturer(), "HagerEnergy / E3/DC");
    }

    #[test]
    fn test_serializes_absent_as_null() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["values"]["grid_power"], -1200);
        assert!(json["values"]["sg_ready_status"].is_null());
    }
}
