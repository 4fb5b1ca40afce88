//! E3/DC "Simple Mode" register layout.
//!
//! All addresses are 1-based, exactly as printed in the vendor Modbus
//! documentation. The transport subtracts one (and applies the configured
//! offset) when a register goes on the wire.

use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Magic word at 40001 that identifies an E3/DC in Simple Mode.
pub const SIGNATURE: u16 = 0xE3DC;
pub const SIGNATURE_ADDR: u16 = 40001;

/// Control register of wallbox 0; wallbox `n` lives at `WALLBOX_BASE_ADDR + n`.
pub const WALLBOX_BASE_ADDR: u16 = 40088;
pub const MAX_WALLBOXES: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Uint16,
    Int32,
    String,
}

impl ValueType {
    /// Word count a descriptor of this type must carry. `None` means any length.
    pub fn expected_words(self) -> Option<u16> {
        match self {
            ValueType::Uint16 => Some(1),
            ValueType::Int32 => Some(2),
            ValueType::String => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub address: u16,
    pub words: u16,
    pub value_type: ValueType,
    pub scale: Option<f64>,
}

impl RegisterDescriptor {
    pub const fn uint16(name: &'static str, address: u16) -> Self {
        Self {
            name,
            address,
            words: 1,
            value_type: ValueType::Uint16,
            scale: None,
        }
    }

    pub const fn int32(name: &'static str, address: u16) -> Self {
        Self {
            name,
            address,
            words: 2,
            value_type: ValueType::Int32,
            scale: None,
        }
    }

    pub const fn string(name: &'static str, address: u16, words: u16) -> Self {
        Self {
            name,
            address,
            words,
            value_type: ValueType::String,
            scale: None,
        }
    }

    pub const fn scaled(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }
}

// Power and status block. Int32 values are watts, signed: battery positive
// while charging, grid positive while importing.
pub const POWER_STATUS: &[RegisterDescriptor] = &[
    RegisterDescriptor::int32("pv_power", 40068),
    RegisterDescriptor::int32("battery_power", 40070),
    RegisterDescriptor::int32("house_power", 40072),
    RegisterDescriptor::int32("grid_power", 40074),
    RegisterDescriptor::int32("additional_feedin_power", 40076),
    RegisterDescriptor::int32("wallbox_power", 40078),
    RegisterDescriptor::int32("wallbox_solar_power", 40080),
    RegisterDescriptor::uint16("autarky_raw", 40082),
    RegisterDescriptor::uint16("battery_soc", 40083),
    RegisterDescriptor::uint16("emergency_power", 40084),
    RegisterDescriptor::uint16("ems_status", 40085),
];

pub const DC_STRINGS: &[RegisterDescriptor] = &[
    RegisterDescriptor::uint16("dc_string_1_voltage", 40096),
    RegisterDescriptor::uint16("dc_string_2_voltage", 40097),
    RegisterDescriptor::uint16("dc_string_3_voltage", 40098),
    // Currents come in 1/100 A
    RegisterDescriptor::uint16("dc_string_1_current", 40099).scaled(0.01),
    RegisterDescriptor::uint16("dc_string_2_current", 40100).scaled(0.01),
    RegisterDescriptor::uint16("dc_string_3_current", 40101).scaled(0.01),
    RegisterDescriptor::uint16("dc_string_1_power", 40102),
    RegisterDescriptor::uint16("dc_string_2_power", 40103),
    RegisterDescriptor::uint16("dc_string_3_power", 40104),
];

/// Power meter type 1 (grid connection point), per phase.
pub const PHASE_METER: &[RegisterDescriptor] = &[
    RegisterDescriptor::int32("grid_l1", 40138),
    RegisterDescriptor::int32("grid_l2", 40140),
    RegisterDescriptor::int32("grid_l3", 40142),
];

pub const SYSTEM_INFO: &[RegisterDescriptor] = &[
    RegisterDescriptor::uint16("modbus_firmware", 40002),
    RegisterDescriptor::uint16("register_count", 40003),
    RegisterDescriptor::string("manufacturer", 40004, 16),
    RegisterDescriptor::string("model", 40020, 16),
    RegisterDescriptor::string("serial_number", 40036, 16),
    RegisterDescriptor::string("firmware_release", 40052, 16),
];

/// Only present on newer firmware; older systems answer with an exception.
pub const SG_READY: &[RegisterDescriptor] = &[RegisterDescriptor::uint16("sg_ready_status", 40105)];

/// Every group the poller walks, in read order.
pub const REGISTER_GROUPS: &[(&str, &[RegisterDescriptor])] = &[
    ("power_status", POWER_STATUS),
    ("dc_strings", DC_STRINGS),
    ("phase_meter", PHASE_METER),
    ("system_info", SYSTEM_INFO),
    ("sg_ready", SG_READY),
];

pub fn all_descriptors() -> impl Iterator<Item = &'static RegisterDescriptor> {
    REGISTER_GROUPS.iter().flat_map(|(_, group)| group.iter())
}

pub fn find_descriptor(name: &str) -> Option<&'static RegisterDescriptor> {
    all_descriptors().find(|descriptor| descriptor.name == name)
}

/// Bit index to flag name, applied to a single `u16`.
pub type BitFieldTable = &'static [(u8, &'static str)];

/// EMS status word at 40085.
pub const EMS_BITS: BitFieldTable = &[
    (0, "battery_charge_locked"),
    (1, "battery_discharge_locked"),
    (2, "emergency_power_possible"),
    (3, "weather_based_charging"),
    (4, "feed_in_limited"),
    (5, "charge_lock_time_active"),
    (6, "discharge_lock_time_active"),
];

/// Read-only status bits inside a wallbox control register. Bits 1, 2, 6 and
/// 9 and up are either control bits or reserved.
pub const WALLBOX_STATUS_BITS: BitFieldTable = &[
    (0, "available"),
    (3, "car_charging"),
    (4, "type2_locked"),
    (5, "type2_plugged"),
    (7, "schuko_plugged"),
    (8, "schuko_locked"),
];

const CLASSIC_BITS: BitFieldTable = &[
    (1, "solar_mode"),
    (2, "charging_blocked"),
    (6, "schuko_on"),
    (12, "single_phase"),
];

// easy connect, multi connect and efy have no schuko socket
const NO_SCHUKO_BITS: BitFieldTable = &[(1, "solar_mode"), (2, "charging_blocked"), (12, "single_phase")];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WallboxModel {
    #[default]
    Classic,
    EasyConnect,
    MultiConnect,
    Efy,
}

impl WallboxModel {
    pub const ALL: [WallboxModel; 4] = [
        WallboxModel::Classic,
        WallboxModel::EasyConnect,
        WallboxModel::MultiConnect,
        WallboxModel::Efy,
    ];

    /// Control bits a user may toggle on this model.
    pub fn writable_bits(self) -> BitFieldTable {
        match self {
            WallboxModel::Classic => CLASSIC_BITS,
            WallboxModel::EasyConnect | WallboxModel::MultiConnect | WallboxModel::Efy => {
                NO_SCHUKO_BITS
            }
        }
    }

    pub fn is_writable(self, bit: u8) -> bool {
        self.writable_bits().iter().any(|(b, _)| *b == bit)
    }

    pub fn bit_by_name(self, name: &str) -> Option<u8> {
        self.writable_bits()
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(bit, _)| *bit)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WallboxModel::Classic => "classic",
            WallboxModel::EasyConnect => "easy_connect",
            WallboxModel::MultiConnect => "multi_connect",
            WallboxModel::Efy => "efy",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            WallboxModel::Classic => "Wallbox classic",
            WallboxModel::EasyConnect => "Wallbox easy connect",
            WallboxModel::MultiConnect => "Wallbox multi connect",
            WallboxModel::Efy => "Wallbox efy",
        }
    }
}

impl fmt::Display for WallboxModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WallboxModel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WallboxModel::ALL
            .into_iter()
            .find(|model| model.as_str() == s.trim())
            .ok_or_else(|| BridgeError::Configuration(format!("unknown wallbox model `{s}`")))
    }
}

pub fn wallbox_address(index: u8) -> u16 {
    WALLBOX_BASE_ADDR + u16::from(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_descriptor_names_are_unique() {
        let names: HashSet<_> = all_descriptors().map(|d| d.name).collect();
        assert_eq!(names.len(), all_descriptors().count());
    }

    #[test]
    fn test_descriptor_word_lengths_match_types() {
        for descriptor in all_descriptors() {
            assert!(
                matches!(descriptor.words, 1 | 2 | 16),
                "{} has {} words",
                descriptor.name,
                descriptor.words
            );
            if let Some(expected) = descriptor.value_type.expected_words() {
                assert_eq!(descriptor.words, expected, "{}", descriptor.name);
            }
        }
    }

    #[test]
    fn test_find_descriptor() {
        let pv = find_descriptor("pv_power").unwrap();
        assert_eq!(pv.address, 40068);
        assert_eq!(pv.value_type, ValueType::Int32);

        let current = find_descriptor("dc_string_2_current").unwrap();
        assert_eq!(current.scale, Some(0.01));

        assert!(find_descriptor("does_not_exist").is_none());
    }

    #[test]
    fn test_bit_tables() {
        assert_eq!(EMS_BITS.len(), 7);
        let status: Vec<u8> = WALLBOX_STATUS_BITS.iter().map(|(bit, _)| *bit).collect();
        assert_eq!(status, vec![0, 3, 4, 5, 7, 8]);
    }

    #[test]
    fn test_wallbox_models() {
        assert_eq!(WallboxModel::Classic.writable_bits().len(), 4);
        assert!(WallboxModel::Classic.is_writable(6));
        for model in [WallboxModel::EasyConnect, WallboxModel::MultiConnect, WallboxModel::Efy] {
            assert_eq!(model.writable_bits().len(), 3);
            assert!(!model.is_writable(6));
            assert_eq!(model.bit_by_name("schuko_on"), None);
            assert_eq!(model.bit_by_name("single_phase"), Some(12));
        }
        // Status bits are never writable
        for (bit, _) in WALLBOX_STATUS_BITS {
            assert!(!WallboxModel::Classic.is_writable(*bit));
        }
    }

    #[test]
    fn test_wallbox_model_parsing() {
        assert_eq!("efy".parse::<WallboxModel>().unwrap(), WallboxModel::Efy);
        assert_eq!(
            "multi_connect".parse::<WallboxModel>().unwrap(),
            WallboxModel::MultiConnect
        );
        assert!("premium".parse::<WallboxModel>().is_err());
        assert_eq!(WallboxModel::default(), WallboxModel::Classic);
        assert_eq!(WallboxModel::EasyConnect.to_string(), "easy_connect");
    }

    #[test]
    fn test_wallbox_address() {
        assert_eq!(wallbox_address(0), 40088);
        assert_eq!(wallbox_address(7), 40095);
    }
}
