//! USB and class-driver status types
//!
//! Every step of the class driver communicates its outcome through one of these
//! status values; none of them carries an error payload, since the driver consumes
//! them on the next tick rather than unwinding.

use serde::{Deserialize, Serialize};

/// Protocol role a multi-mode device currently operates under
///
/// Chosen once at bind time and immutable for the lifetime of the binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Personality {
    #[default]
    Unknown,
    /// Bulk-only mass storage (SCSI transparent command set)
    MassStorageBot,
    /// Vendor communications function reached after a mode switch
    VendorSerial,
}

/// Host channel handle handed out by the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle(pub u8);

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

/// Status of a (re-entrant) control request
///
/// The engine returns `Busy` until the request completes; callers keep submitting
/// the same setup packet on every tick until it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlStatus {
    Ok,
    Busy,
    /// Device stalled the request: the class command is not supported
    NotSupported,
    Fail,
}

/// Result of handing a bulk transfer to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitStatus {
    /// Accepted; progress is observed via [`UrbState`]
    Ok,
    Busy,
    Fail,
}

/// Polled state of the last transfer submitted on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UrbState {
    /// Submitted, no outcome yet
    Idle,
    Done,
    /// Device NAKed
    NotReady,
    Nyet,
    Error,
    Stall,
}

/// Outcome of a SCSI probe command, as reported by the BOT layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MscStatus {
    Ok,
    Busy,
    /// CSW reported command failure; sense data explains why
    Fail,
    /// Transport desynchronized; never retried
    PhaseError,
}

/// Sub-phase of a SCSI command, owned by the state machine and advanced by the
/// BOT layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommandPhase {
    #[default]
    Send,
    Wait,
}

/// Status reported upward for each tick of the class driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickStatus {
    Busy,
    Ok,
    UnrecoveredError,
    /// The application asked for the class to be de-initialized
    ApplyDeinit,
}

/// Decoded return value of the application callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppStatus {
    Continue,
    Deinit,
}

impl AppStatus {
    /// `0` continues, `1` de-initializes, anything else is reserved
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(AppStatus::Continue),
            1 => Some(AppStatus::Deinit),
            _ => None,
        }
    }
}
