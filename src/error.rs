use thiserror::Error;

/// Everything the bridge can fail with.
///
/// Per-register failures inside a poll cycle are `Protocol` and never leave the
/// poller. `Connectivity` ends a cycle early, and fails it when nothing was read. `Control` is always handed back
/// to whoever asked for a wallbox bit change.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot reach device: {0}")]
    Connectivity(String),

    #[error("register {address}: {reason}")]
    Protocol { address: u16, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("wallbox {wallbox} control failed: {reason}")]
    Control { wallbox: u8, reason: String },
}

impl BridgeError {
    pub fn protocol(address: u16, reason: impl Into<String>) -> Self {
        Self::Protocol {
            address,
            reason: reason.into(),
        }
    }

    pub fn control(wallbox: u8, reason: impl Into<String>) -> Self {
        Self::Control {
            wallbox,
            reason: reason.into(),
        }
    }

    /// True when the session itself is gone, as opposed to a single rejected request.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BridgeError::protocol(40067, "Modbus exception: IllegalDataAddress");
        assert_eq!(
            err.to_string(),
            "register 40067: Modbus exception: IllegalDataAddress"
        );

        let err = BridgeError::control(2, "bit 6 not writable");
        assert_eq!(err.to_string(), "wallbox 2 control failed: bit 6 not writable");
    }

    #[test]
    fn test_is_connectivity() {
        assert!(BridgeError::Connectivity("refused".into()).is_connectivity());
        assert!(!BridgeError::protocol(1, "x").is_connectivity());
        assert!(!BridgeError::Configuration("x".into()).is_connectivity());
    }
}
