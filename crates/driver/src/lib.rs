//! USB host class driver for mass-storage and mode-switched serial dongles
//!
//! The driver binds to one interface of an enumerated device and walks it to a
//! ready state, one non-blocking [`ClassDriver::tick`] at a time. Transfers, the
//! SCSI envelope layer and the application are collaborators behind the
//! [`TransferEngine`], [`ScsiProber`] and [`Application`] traits.

pub mod application;
pub mod binding;
pub mod buffers;
pub mod class;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod machine;
pub mod mode_switch;
pub mod recovery;
pub mod scsi;
pub mod selector;
pub mod test_utils;

pub use application::Application;
pub use binding::EndpointBinding;
pub use class::ClassDriver;
pub use config::{DriverConfig, SerialConfig};
pub use engine::TransferEngine;
pub use error::{EngineError, Error, Result};
pub use logging::setup_logging;
pub use machine::{Machine, MachineOptions, SerialMode, State};
pub use mode_switch::{ModeSwitchConfig, ModeSwitchInitiator};
pub use scsi::{ScsiCommand, ScsiProber};
pub use selector::{InterfaceSignature, Selection, select_interface};
