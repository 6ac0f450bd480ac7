//! USB backend
//!
//! Everything that touches libusb: device discovery, the transfer engine and the
//! Bulk-Only Transport used by the storage readiness probe.

pub mod bot;
pub mod device;
pub mod engine;
pub mod io;

pub use bot::BotProber;
pub use device::{OpenDevice, find_device, list_devices};
pub use engine::{RusbEngine, Timeouts};
