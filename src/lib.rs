//! E3/DC Modbus Bridge Library
//!
//! Polls an E3/DC home power station over Modbus-TCP ("Simple Mode"),
//! decodes its registers into snapshots, integrates energy counters and
//! toggles wallbox control bits.

pub mod config;
pub mod coordinator;
pub mod decode;
pub mod energy;
pub mod error;
pub mod modbus_client;
pub mod poller;
pub mod registers;
pub mod snapshot;
pub mod wallbox;

// Re-export commonly used types for easier access
pub use config::{Config, ConfigLayer};
pub use coordinator::{Coordinator, PollState, UpdateStatus};
pub use energy::{EnergyAccumulator, EnergyCheckpoint};
pub use error::{BridgeError, Result};
pub use modbus_client::ModbusClient;
pub use registers::WallboxModel;
pub use snapshot::{RegisterValue, Snapshot};
pub use wallbox::WallboxControl;
