use tracing::{debug, error};

use crate::error::{BridgeError, Result};
use crate::modbus_client::ModbusClient;
use crate::registers::{wallbox_address, WallboxModel, MAX_WALLBOXES};

/// `current` with exactly `bit` set or cleared. A bit past the register
/// width leaves `current` unchanged.
pub fn apply_bit(current: u16, bit: u8, desired: bool) -> u16 {
    let Some(mask) = 1u16.checked_shl(u32::from(bit)) else {
        return current;
    };
    if desired {
        current | mask
    } else {
        current & !mask
    }
}

/// A switch a consumer may expose: one whitelisted bit of one wallbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallboxSwitch {
    pub wallbox: u8,
    pub key: &'static str,
    pub bit: u8,
}

/// Read-modify-write access to the wallbox control registers.
#[derive(Debug, Clone, Copy)]
pub struct WallboxControl {
    model: WallboxModel,
    wallboxes: u8,
}

impl WallboxControl {
    pub fn new(model: WallboxModel, wallboxes: u8) -> Self {
        Self {
            model,
            wallboxes: wallboxes.min(MAX_WALLBOXES),
        }
    }

    pub fn model(&self) -> WallboxModel {
        self.model
    }

    /// Every controllable bit of every configured wallbox.
    pub fn switches(&self) -> Vec<WallboxSwitch> {
        (0..self.wallboxes)
            .flat_map(|wallbox| {
                self.model
                    .writable_bits()
                    .iter()
                    .map(move |&(bit, key)| WallboxSwitch { wallbox, key, bit })
            })
            .collect()
    }

    pub fn check(&self, wallbox: u8, bit: u8) -> Result<()> {
        if wallbox >= self.wallboxes {
            return Err(BridgeError::control(
                wallbox,
                format!("only {} wallbox(es) configured", self.wallboxes),
            ));
        }
        if !self.model.is_writable(bit) {
            return Err(BridgeError::control(
                wallbox,
                format!("bit {bit} is not controllable on a {} wallbox", self.model),
            ));
        }
        Ok(())
    }

    /// Sets or clears one control bit, leaving every other bit as the device
    /// reported it. Returns whether a write was needed.
    pub async fn set_bit(
        &self,
        client: &ModbusClient,
        wallbox: u8,
        bit: u8,
        desired: bool,
    ) -> Result<bool> {
        self.check(wallbox, bit)?;
        let address = wallbox_address(wallbox);

        let current = client
            .read_holding_registers(address, 1)
            .await
            .and_then(|words| {
                words
                    .first()
                    .copied()
                    .ok_or_else(|| BridgeError::protocol(address, "empty response"))
            })
            .map_err(|err| control_failure(wallbox, bit, "read", err))?;

        let new_value = apply_bit(current, bit, desired);
        if new_value == current {
            debug!("Wallbox {wallbox} bit {bit} already {desired}, not writing");
            return Ok(false);
        }

        client
            .write_register(address, new_value)
            .await
            .map_err(|err| control_failure(wallbox, bit, "write", err))?;
        debug!("Wallbox {wallbox} control {current:#06x} -> {new_value:#06x}");
        Ok(true)
    }
}

fn control_failure(wallbox: u8, bit: u8, op: &str, err: BridgeError) -> BridgeError {
    error!("Wallbox {wallbox} bit {bit} {op} failed: {err}");
    BridgeError::control(wallbox, format!("{op} failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_bit() {
        assert_eq!(apply_bit(0b000000, 1, true), 0b000010);
        assert_eq!(apply_bit(0b000010, 1, true), 0b000010);
        assert_eq!(apply_bit(0b000110, 1, false), 0b000100);
        assert_eq!(apply_bit(0xFFFF, 12, false), 0xEFFF);
        // Reserved high bits survive untouched
        assert_eq!(apply_bit(0x8001, 6, true), 0x8041);
        assert_eq!(apply_bit(0x1234, 16, true), 0x1234);
        assert_eq!(apply_bit(0x1234, u8::MAX, false), 0x1234);
    }

    #[test]
    fn test_switches_per_model() {
        let classic = WallboxControl::new(WallboxModel::Classic, 2);
        let switches = classic.switches();
        assert_eq!(switches.len(), 8);
        assert!(switches.contains(&WallboxSwitch {
            wallbox: 1,
            key: "schuko_on",
            bit: 6
        }));

        let efy = WallboxControl::new(WallboxModel::Efy, 1);
        let keys: Vec<_> = efy.switches().iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["solar_mode", "charging_blocked", "single_phase"]);

        assert!(WallboxControl::new(WallboxModel::Classic, 0).switches().is_empty());
        assert_eq!(WallboxControl::new(WallboxModel::Classic, 20).switches().len(), 32);
    }

    #[test]
    fn test_check_whitelist_and_range() {
        let control = WallboxControl::new(WallboxModel::EasyConnect, 2);
        assert!(control.check(0, 1).is_ok());
        assert!(control.check(1, 12).is_ok());
        // schuko_on does not exist on easy connect
        assert!(matches!(control.check(0, 6), Err(BridgeError::Control { .. })));
        // status bits are read-only
        assert!(control.check(0, 3).is_err());
        assert!(control.check(2, 1).is_err());
    }

    #[tokio::test]
    async fn test_rejected_bit_never_touches_the_device() {
        // Nothing listens on the client's address; a wire access would surface
        // as a control failure wrapping a connectivity error instead
        let client = ModbusClient::new("127.0.0.1", 1, 1, 0);
        client.close().await;
        let control = WallboxControl::new(WallboxModel::Efy, 1);
        let err = control.set_bit(&client, 0, 6, true).await.unwrap_err();
        assert!(err.to_string().contains("not controllable"), "{err}");
    }
}
