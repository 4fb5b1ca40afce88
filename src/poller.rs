use chrono::Utc;
use tracing::{debug, trace, warn};

use crate::decode::{decode_bits, split_autarky};
use crate::error::{BridgeError, Result};
use crate::modbus_client::ModbusClient;
use crate::registers::{
    wallbox_address, RegisterDescriptor, EMS_BITS, MAX_WALLBOXES, REGISTER_GROUPS,
    WALLBOX_STATUS_BITS,
};
use crate::snapshot::Snapshot;

pub type RegisterGroups = [(&'static str, &'static [RegisterDescriptor])];

/// Reads every known register once and builds a snapshot.
pub async fn poll_once(client: &ModbusClient) -> Result<Snapshot> {
    poll_groups(client, REGISTER_GROUPS).await
}

/// One poll cycle over `groups`.
///
/// A register the device rejects is recorded as absent and the cycle goes on.
/// Losing the session stops further reads: everything not read yet is absent.
/// The cycle only fails when not a single field could be read.
pub async fn poll_groups(client: &ModbusClient, groups: &RegisterGroups) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new(Utc::now());
    let mut lost: Option<BridgeError> = None;

    for (group, descriptors) in groups {
        for descriptor in descriptors.iter() {
            let value = if lost.is_some() {
                None
            } else {
                match client.read_value(descriptor).await {
                    Ok(value) => Some(value),
                    Err(err) if err.is_connectivity() => {
                        lost = Some(connection_lost(&snapshot, err)?);
                        None
                    }
                    Err(err) => {
                        debug!(
                            "Register {} ({}, group {group}) failed: {err}",
                            descriptor.name, descriptor.address
                        );
                        None
                    }
                }
            };
            snapshot.values.insert(descriptor.name.to_string(), value);
        }
    }

    // All eight control registers are read, whatever the configured wallbox count
    for index in 0..MAX_WALLBOXES {
        if lost.is_some() {
            break;
        }
        let address = wallbox_address(index);
        snapshot.wallbox_ctrl[usize::from(index)] =
            match client.read_holding_registers(address, 1).await {
                Ok(words) => words.first().copied(),
                Err(err) if err.is_connectivity() => {
                    lost = Some(connection_lost(&snapshot, err)?);
                    None
                }
                Err(err) => {
                    debug!("Wallbox CTRL {index} ({address}) failed: {err}");
                    None
                }
            };
    }

    if snapshot.populated() == 0 {
        return Err(lost.unwrap_or_else(|| {
            BridgeError::Connectivity("no register could be read".into())
        }));
    }

    derive_fields(&mut snapshot);
    trace!("Poll cycle read {} fields", snapshot.populated());
    Ok(snapshot)
}

/// Fails the cycle if nothing was read before the session went away,
/// otherwise hands the error back so the rest of the cycle is skipped.
fn connection_lost(snapshot: &Snapshot, err: BridgeError) -> Result<BridgeError> {
    if snapshot.populated() == 0 {
        return Err(err);
    }
    warn!(
        "Session lost after {} fields, publishing a partial snapshot: {err}",
        snapshot.populated()
    );
    Ok(err)
}

/// Fills in the fields computed from raw registers.
pub fn derive_fields(snapshot: &mut Snapshot) {
    snapshot.ems = match snapshot.get("ems_status").and_then(|v| v.as_i64()) {
        Some(raw) => decode_bits(raw as u16, EMS_BITS),
        None => Default::default(),
    };

    let (autarky, self_consumption) = match snapshot.get("autarky_raw").and_then(|v| v.as_i64()) {
        Some(raw) => {
            let (autarky, self_consumption) = split_autarky(raw as u16);
            (Some(autarky), Some(self_consumption))
        }
        None => (None, None),
    };
    snapshot.autarky = autarky;
    snapshot.self_consumption = self_consumption;

    snapshot.wallbox_status = (0..MAX_WALLBOXES)
        .filter_map(|index| {
            snapshot
                .wallbox_ctrl(index)
                .map(|raw| (index, decode_bits(raw, WALLBOX_STATUS_BITS)))
        })
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RegisterValue;

    #[test]
    fn test_derive_fields() {
        let mut snapshot = Snapshot::new(Utc::now());
        snapshot
            .values
            .insert("ems_status".into(), Some(RegisterValue::Integer(0b0000101)));
        snapshot
            .values
            .insert("autarky_raw".into(), Some(RegisterValue::Integer(0x4B1E)));
        snapshot.wallbox_ctrl[0] = Some(0b1001);

        derive_fields(&mut snapshot);

        assert_eq!(snapshot.ems.len(), 7);
        assert_eq!(snapshot.ems_flag("battery_charge_locked"), Some(true));
        assert_eq!(snapshot.ems_flag("battery_discharge_locked"), Some(false));
        assert_eq!(snapshot.ems_flag("emergency_power_possible"), Some(true));
        assert_eq!(snapshot.ems.values().filter(|on| **on).count(), 2);

        assert_eq!(snapshot.autarky, Some(75));
        assert_eq!(snapshot.self_consumption, Some(30));

        assert_eq!(snapshot.wallbox_status.len(), 1);
        assert_eq!(snapshot.wallbox_status(0, "available"), Some(true));
        assert_eq!(snapshot.wallbox_status(0, "car_charging"), Some(true));
        assert_eq!(snapshot.wallbox_status(0, "type2_plugged"), Some(false));
        assert_eq!(snapshot.wallbox_status(1, "available"), None);
    }

    #[test]
    fn test_derive_fields_without_sources() {
        let mut snapshot = Snapshot::new(Utc::now());
        snapshot.values.insert("ems_status".into(), None);
        derive_fields(&mut snapshot);

        assert!(snapshot.ems.is_empty());
        assert_eq!(snapshot.ems_flag("battery_charge_locked"), None);
        assert_eq!(snapshot.autarky, None);
        assert_eq!(snapshot.self_consumption, None);
        assert!(snapshot.wallbox_status.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_without_session_fails() {
        let client = ModbusClient::new("127.0.0.1", 1, 1, 0);
        client.close().await;
        let err = poll_once(&client).await.unwrap_err();
        assert!(err.is_connectivity(), "{err}");
    }
}
