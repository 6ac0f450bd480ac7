//! Host configuration management

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use driver::config::{DEFAULT_MODE_SWITCH_TARGET, DEFAULT_SERIAL_COMMAND};
use driver::recovery::DEFAULT_RETRY_LIMIT;
use driver::selector::default_signatures;
use driver::{DriverConfig, InterfaceSignature, ModeSwitchConfig, SerialConfig, SerialMode};
use protocol::{DEFAULT_MODE_SWITCH_PAYLOAD, DeviceIdentity, Personality, decode_hex_payload};
use serde::{Deserialize, Serialize};

use crate::usb::Timeouts;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub mode_switch: ModeSwitchSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
    /// Interface class/protocol pairs to bind, in place of the built-in pair
    #[serde(default = "SignatureSettings::defaults")]
    pub signatures: Vec<SignatureSettings>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: HostSettings::default(),
            device: DeviceSettings::default(),
            mode_switch: ModeSwitchSettings::default(),
            serial: SerialSettings::default(),
            storage: StorageSettings::default(),
            transfers: TransferSettings::default(),
            signatures: SignatureSettings::defaults(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
    /// Period of the class-driver tick
    pub tick_interval_ms: u64,
    /// Give up after this long; unset runs until Ctrl+C
    #[serde(default)]
    pub overall_timeout_secs: Option<u64>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            tick_interval_ms: 10,
            overall_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// VID:PID of the device to drive (e.g. "0x12d1:0x155b" or "0x0781:*")
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSwitchSettings {
    pub enabled: bool,
    pub vendor_id: String,
    pub product_id: String,
    /// Command sent verbatim on the bulk OUT endpoint, as hex digits
    pub payload_hex: String,
    pub timeout_ms: u64,
}

impl Default for ModeSwitchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            vendor_id: format!("0x{:04x}", DEFAULT_MODE_SWITCH_TARGET.vendor_id),
            product_id: format!("0x{:04x}", DEFAULT_MODE_SWITCH_TARGET.product_id),
            payload_hex: DEFAULT_MODE_SWITCH_PAYLOAD.to_string(),
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub command: String,
    #[serde(default)]
    pub mode: SerialMode,
    #[serde(default)]
    pub vendor_reset: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_SERIAL_COMMAND.to_string(),
            mode: SerialMode::Continuous,
            vendor_reset: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub retry_limit: u8,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    pub control_timeout_ms: u64,
    pub bulk_timeout_ms: u64,
    /// Wait per poll of an armed bulk IN transfer
    #[serde(default = "TransferSettings::default_receive_timeout")]
    pub receive_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            control_timeout_ms: 1000,
            bulk_timeout_ms: 1000,
            receive_timeout_ms: Self::default_receive_timeout(),
        }
    }
}

impl TransferSettings {
    fn default_receive_timeout() -> u64 {
        100
    }
}

/// One `[[signatures]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureSettings {
    /// bInterfaceClass, as hex (e.g. "0x08")
    pub class: String,
    /// bInterfaceProtocol, as hex (e.g. "0x50")
    pub protocol: String,
    pub personality: Personality,
}

impl SignatureSettings {
    fn defaults() -> Vec<Self> {
        default_signatures().into_iter().map(Self::from).collect()
    }

    pub fn to_signature(&self) -> Result<InterfaceSignature> {
        if self.personality == Personality::Unknown {
            return Err(anyhow!(
                "Signature {}/{} must bind MassStorageBot or VendorSerial",
                self.class,
                self.protocol
            ));
        }
        Ok(InterfaceSignature {
            class: parse_hex_byte(&self.class, "signature class")?,
            protocol: parse_hex_byte(&self.protocol, "signature protocol")?,
            personality: self.personality,
        })
    }
}

impl From<InterfaceSignature> for SignatureSettings {
    fn from(signature: InterfaceSignature) -> Self {
        Self {
            class: format!("0x{:02x}", signature.class),
            protocol: format!("0x{:02x}", signature.protocol),
            personality: signature.personality,
        }
    }
}

/// Parsed `VID:PID` filter; `None` parts are wildcards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn parse(filter: &str) -> Result<Self> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let part = |id: &str, name: &str| -> Result<Option<u16>> {
            if id == "*" {
                Ok(None)
            } else {
                parse_hex_id(id, name).map(Some)
            }
        };

        Ok(Self {
            vendor_id: part(parts[0], "VID")?,
            product_id: part(parts[1], "PID")?,
        })
    }

    pub fn matches(&self, identity: DeviceIdentity) -> bool {
        self.vendor_id.is_none_or(|vid| vid == identity.vendor_id)
            && self.product_id.is_none_or(|pid| pid == identity.product_id)
    }
}

/// Parse a hex ID (VID or PID), with or without the `0x` prefix
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);
    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

fn parse_hex_byte(id: &str, name: &str) -> Result<u8> {
    let value = parse_hex_id(id, name)?;
    u8::try_from(value).map_err(|_| anyhow!("Invalid {} '{}', must fit in one byte", name, id))
}

impl HostConfig {
    /// Load configuration from file
    ///
    /// Tries the given path, else the per-user path, else the system path.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-modeswitch-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{:#}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-modeswitch-host").join("host.toml")
        } else {
            PathBuf::from(".config/usb-modeswitch-host/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }
        if self.host.tick_interval_ms == 0 {
            return Err(anyhow!("tick_interval_ms must be greater than 0"));
        }
        if self.host.overall_timeout_secs == Some(0) {
            return Err(anyhow!("overall_timeout_secs must be greater than 0"));
        }

        if let Some(filter) = &self.device.filter {
            DeviceFilter::parse(filter)?;
        }

        if self.mode_switch.enabled {
            self.mode_switch_identity()?;
            decode_hex_payload(&self.mode_switch.payload_hex)
                .context("Invalid mode switch payload_hex")?;
            if self.mode_switch.timeout_ms == 0 {
                return Err(anyhow!("mode_switch.timeout_ms must be greater than 0"));
            }
        }

        if self.serial.command.is_empty() {
            return Err(anyhow!("serial.command must not be empty"));
        }
        if self.storage.retry_limit == 0 {
            return Err(anyhow!("storage.retry_limit must be at least 1"));
        }

        let t = &self.transfers;
        if t.control_timeout_ms == 0 || t.bulk_timeout_ms == 0 || t.receive_timeout_ms == 0 {
            return Err(anyhow!("Transfer timeouts must be greater than 0"));
        }

        self.interface_signatures()?;

        Ok(())
    }

    fn interface_signatures(&self) -> Result<Vec<InterfaceSignature>> {
        if self.signatures.is_empty() {
            return Err(anyhow!("At least one [[signatures]] entry is required"));
        }
        self.signatures
            .iter()
            .map(SignatureSettings::to_signature)
            .collect()
    }

    fn mode_switch_identity(&self) -> Result<DeviceIdentity> {
        Ok(DeviceIdentity {
            vendor_id: parse_hex_id(&self.mode_switch.vendor_id, "mode_switch.vendor_id")?,
            product_id: parse_hex_id(&self.mode_switch.product_id, "mode_switch.product_id")?,
        })
    }

    /// Configured device filter, if any
    pub fn device_filter(&self) -> Result<Option<DeviceFilter>> {
        self.device
            .filter
            .as_deref()
            .map(DeviceFilter::parse)
            .transpose()
    }

    /// Build the class-driver configuration
    pub fn driver_config(&self) -> Result<DriverConfig> {
        let mode_switch = if self.mode_switch.enabled {
            Some(ModeSwitchConfig {
                identity: self.mode_switch_identity()?,
                payload: decode_hex_payload(&self.mode_switch.payload_hex)
                    .context("Invalid mode switch payload_hex")?,
                timeout: Duration::from_millis(self.mode_switch.timeout_ms),
            })
        } else {
            None
        };

        let config = DriverConfig {
            retry_limit: self.storage.retry_limit,
            signatures: self.interface_signatures()?,
            mode_switch,
            serial: SerialConfig {
                command: self.serial.command.as_bytes().to_vec(),
                mode: self.serial.mode,
                vendor_reset: self.serial.vendor_reset,
            },
        };
        config.validate().context("Invalid driver configuration")?;
        Ok(config)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            control: Duration::from_millis(self.transfers.control_timeout_ms),
            bulk: Duration::from_millis(self.transfers.bulk_timeout_ms),
            receive: Duration::from_millis(self.transfers.receive_timeout_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.host.tick_interval_ms)
    }

    pub fn overall_timeout(&self) -> Option<Duration> {
        self.host.overall_timeout_secs.map(Duration::from_secs)
    }
}
