//! Raw register words to values.

use std::collections::BTreeMap;

use crate::error::{BridgeError, Result};
use crate::registers::{BitFieldTable, RegisterDescriptor, ValueType};
use crate::snapshot::RegisterValue;

pub fn decode_uint16(words: &[u16]) -> Option<u16> {
    words.first().copied()
}

/// Two words, high half first, as a signed 32-bit integer.
pub fn decode_int32(words: &[u16]) -> Option<i32> {
    match words {
        [high, low, ..] => Some(((u32::from(*high) << 16) | u32::from(*low)) as i32),
        _ => None,
    }
}

/// Two ASCII characters per word, high byte first. Padding (NUL or blanks) is trimmed.
pub fn decode_string(words: &[u16]) -> String {
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();
    String::from_utf8_lossy(&bytes)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// Decodes `words` according to `descriptor` and applies its scale.
pub fn decode_value(descriptor: &RegisterDescriptor, words: &[u16]) -> Result<RegisterValue> {
    if let Some(expected) = descriptor.value_type.expected_words() {
        if descriptor.words != expected {
            return Err(BridgeError::Configuration(format!(
                "{} is {:?} but spans {} words",
                descriptor.name, descriptor.value_type, descriptor.words
            )));
        }
    }
    if words.len() < usize::from(descriptor.words) {
        return Err(BridgeError::protocol(
            descriptor.address,
            format!("got {} words, expected {}", words.len(), descriptor.words),
        ));
    }

    let raw = match descriptor.value_type {
        ValueType::Uint16 => decode_uint16(words).map(i64::from),
        ValueType::Int32 => decode_int32(words).map(i64::from),
        ValueType::String => return Ok(RegisterValue::Text(decode_string(words))),
    };
    // Length was checked above, so a missing value cannot happen here
    let raw = raw.ok_or_else(|| BridgeError::protocol(descriptor.address, "empty response"))?;

    Ok(match descriptor.scale {
        Some(scale) => RegisterValue::Float(raw as f64 * scale),
        None => RegisterValue::Integer(raw),
    })
}

/// Every flag of `table`, set or not, for the given word.
pub fn decode_bits(value: u16, table: BitFieldTable) -> BTreeMap<String, bool> {
    table
        .iter()
        .map(|(bit, name)| {
            let set = 1u16
                .checked_shl(u32::from(*bit))
                .is_some_and(|mask| value & mask != 0);
            (name.to_string(), set)
        })
        .collect()
}

/// Register 40082 packs autarky (high byte) and self-consumption (low byte), both in percent.
pub fn split_autarky(raw: u16) -> (u8, u8) {
    let [autarky, self_consumption] = raw.to_be_bytes();
    (autarky, self_consumption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{find_descriptor, EMS_BITS, WALLBOX_STATUS_BITS};

    #[test]
    fn test_decode_int32() {
        assert_eq!(decode_int32(&[0xFFFF, 0xFFFF]), Some(-1));
        assert_eq!(decode_int32(&[0x0000, 0x04D2]), Some(1234));
        assert_eq!(decode_int32(&[0x0001, 0x0000]), Some(65536));
        assert_eq!(decode_int32(&[0xFFFF, 0xFC18]), Some(-1000));
        assert_eq!(decode_int32(&[0x8000, 0x0000]), Some(i32::MIN));
        assert_eq!(decode_int32(&[0x1234]), None);
    }

    #[test]
    fn test_decode_uint16() {
        assert_eq!(decode_uint16(&[1234]), Some(1234));
        assert_eq!(decode_uint16(&[0xFFFF]), Some(65535));
        assert_eq!(decode_uint16(&[]), None);
    }

    #[test]
    fn test_decode_string() {
        // "E3/DC" followed by NUL padding
        let words = [0x4533, 0x2F44, 0x4300, 0x0000, 0x0000];
        assert_eq!(decode_string(&words), "E3/DC");

        let words = [0x5334, 0x3020, 0x2020];
        assert_eq!(decode_string(&words), "S40");

        assert_eq!(decode_string(&[0, 0]), "");
    }

    #[test]
    fn test_decode_value_by_type() {
        let pv = find_descriptor("pv_power").unwrap();
        assert_eq!(
            decode_value(pv, &[0xFFFF, 0xFFFF]).unwrap(),
            RegisterValue::Integer(-1)
        );

        let soc = find_descriptor("battery_soc").unwrap();
        assert_eq!(decode_value(soc, &[1234]).unwrap(), RegisterValue::Integer(1234));

        let current = find_descriptor("dc_string_1_current").unwrap();
        let value = decode_value(current, &[250]).unwrap().as_f64().unwrap();
        assert!((value - 2.5).abs() < 1e-9);

        let mut words = vec![0u16; 16];
        words[0] = 0x4833; // "H3"
        let model = find_descriptor("model").unwrap();
        assert_eq!(
            decode_value(model, &words).unwrap(),
            RegisterValue::Text("H3".into())
        );
    }

    #[test]
    fn test_decode_value_short_response() {
        let pv = find_descriptor("pv_power").unwrap();
        assert!(matches!(
            decode_value(pv, &[1]),
            Err(BridgeError::Protocol { address: 40068, .. })
        ));
    }

    #[test]
    fn test_decode_value_malformed_descriptor() {
        let broken = RegisterDescriptor {
            name: "broken",
            address: 40001,
            words: 1,
            value_type: ValueType::Int32,
            scale: None,
        };
        assert!(matches!(
            decode_value(&broken, &[1, 2]),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn test_decode_ems_bits() {
        let flags = decode_bits(0b0000101, EMS_BITS);
        assert_eq!(flags.len(), 7);
        assert_eq!(flags["battery_charge_locked"], true);
        assert_eq!(flags["emergency_power_possible"], true);
        let set: Vec<_> = flags.iter().filter(|(_, on)| **on).map(|(n, _)| n.as_str()).collect();
        assert_eq!(set, vec!["battery_charge_locked", "emergency_power_possible"]);
    }

    #[test]
    fn test_decode_wallbox_status_ignores_other_bits() {
        // Only the control bits 1, 2, 6 and reserved bit 15 are set
        let flags = decode_bits(0b1000_0000_0100_0110, WALLBOX_STATUS_BITS);
        assert_eq!(flags.len(), 6);
        assert!(flags.values().all(|on| !on));

        let flags = decode_bits(0b1_0011_1001, WALLBOX_STATUS_BITS);
        assert!(flags["available"]);
        assert!(flags["car_charging"]);
        assert!(flags["type2_locked"]);
        assert!(flags["type2_plugged"]);
        assert!(!flags["schuko_plugged"]);
        assert!(flags["schuko_locked"]);
    }

    #[test]
    fn test_split_autarky() {
        assert_eq!(split_autarky(0x4B1E), (75, 30));
        assert_eq!(split_autarky(0x6400), (100, 0));
    }
}
