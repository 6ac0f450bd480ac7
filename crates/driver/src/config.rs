//! Driver configuration
//!
//! Static data the class driver needs: recognized interface signatures, the
//! mode-switch target, the serial handshake and the retry bound. File loading
//! lives in the host binary, which builds this from its TOML config.

use std::time::Duration;

use protocol::{DEFAULT_MODE_SWITCH_PAYLOAD, DeviceIdentity, decode_hex_payload};

use crate::error::{Error, Result};
use crate::machine::{MachineOptions, SerialMode};
use crate::mode_switch::{DEFAULT_MODE_SWITCH_TIMEOUT, ModeSwitchConfig};
use crate::recovery::DEFAULT_RETRY_LIMIT;
use crate::selector::{InterfaceSignature, default_signatures};

/// Command sent to the vendor serial function
pub const DEFAULT_SERIAL_COMMAND: &str = "ATi\r\n";

/// Vendor/product pair of the dongle that needs a mode switch
pub const DEFAULT_MODE_SWITCH_TARGET: DeviceIdentity = DeviceIdentity {
    vendor_id: 0x12d1,
    product_id: 0x155b,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub command: Vec<u8>,
    pub mode: SerialMode,
    /// Issue the vendor reset request before the command
    pub vendor_reset: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_SERIAL_COMMAND.as_bytes().to_vec(),
            mode: SerialMode::Continuous,
            vendor_reset: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub retry_limit: u8,
    pub signatures: Vec<InterfaceSignature>,
    /// `None` disables the mode switch
    pub mode_switch: Option<ModeSwitchConfig>,
    pub serial: SerialConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            signatures: default_signatures(),
            mode_switch: Some(default_mode_switch()),
            serial: SerialConfig::default(),
        }
    }
}

/// Built-in mode switch for the 12d1:155b dongle
pub fn default_mode_switch() -> ModeSwitchConfig {
    ModeSwitchConfig {
        identity: DEFAULT_MODE_SWITCH_TARGET,
        // Empty on decode failure; validate() rejects that
        payload: decode_hex_payload(DEFAULT_MODE_SWITCH_PAYLOAD).unwrap_or_default(),
        timeout: DEFAULT_MODE_SWITCH_TIMEOUT,
    }
}

impl DriverConfig {
    pub fn machine_options(&self) -> MachineOptions {
        MachineOptions {
            retry_limit: self.retry_limit,
            serial_mode: self.serial.mode,
            vendor_reset: self.serial.vendor_reset,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_limit == 0 {
            return Err(Error::Config("retry_limit must be at least 1".to_string()));
        }
        if self.signatures.is_empty() {
            return Err(Error::Config("no interface signatures configured".to_string()));
        }
        if let Some(mode_switch) = &self.mode_switch {
            if mode_switch.payload.is_empty() {
                return Err(Error::Config("mode switch payload is empty".to_string()));
            }
            if mode_switch.timeout == Duration::ZERO {
                return Err(Error::Config("mode switch timeout must be > 0".to_string()));
            }
        }
        if self.serial.command.is_empty() {
            return Err(Error::Config("serial command is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        let mode_switch = config.mode_switch.as_ref().unwrap();
        assert_eq!(mode_switch.payload.len(), 31);
        assert_eq!(mode_switch.identity.to_string(), "12d1:155b");
        assert_eq!(config.serial.command, b"ATi\r\n");
    }

    #[test]
    fn test_validation_rejects_zero_retry_limit() {
        let config = DriverConfig {
            retry_limit: 0,
            ..DriverConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_machine_options_follow_config() {
        let mut config = DriverConfig::default();
        config.retry_limit = 4;
        config.serial.mode = SerialMode::Drain;
        config.serial.vendor_reset = true;

        let options = config.machine_options();
        assert_eq!(options.retry_limit, 4);
        assert_eq!(options.serial_mode, SerialMode::Drain);
        assert!(options.vendor_reset);
    }
}
