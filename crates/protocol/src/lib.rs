//! Protocol library for usb-modeswitch-host
//!
//! This crate defines the wire-level vocabulary shared by the class driver and the
//! host binary: control-request setup packets and their builders, the interface and
//! endpoint descriptor model, transfer/command status values, and decoding of the
//! opaque mode-switch payload.
//!
//! # Example
//!
//! ```
//! use protocol::setup::{self, Direction, RequestKind, Recipient};
//!
//! let reset = setup::bot_reset(0);
//! assert_eq!(reset.direction, Direction::HostToDevice);
//! assert_eq!(reset.kind, RequestKind::Class);
//! assert_eq!(reset.recipient, Recipient::Interface);
//! assert_eq!(reset.request_type(), 0x21);
//! assert_eq!(reset.length, 0);
//! ```
//!
//! # Mode-switch payload
//!
//! ```
//! use protocol::{DEFAULT_MODE_SWITCH_PAYLOAD, decode_hex_payload};
//!
//! let payload = decode_hex_payload(DEFAULT_MODE_SWITCH_PAYLOAD).unwrap();
//! assert_eq!(payload.len(), 31);
//! assert_eq!(&payload[..4], b"USBC");
//! ```

pub mod descriptor;
pub mod error;
pub mod payload;
pub mod setup;
pub mod types;

pub use descriptor::{
    DeviceIdentity, DeviceInfo, EndpointDescriptor, InterfaceDescriptor, TransferKind,
};
pub use error::{ProtocolError, Result};
pub use payload::{DEFAULT_MODE_SWITCH_PAYLOAD, MAX_PAYLOAD_LEN, decode_hex_payload};
pub use setup::SetupPacket;
pub use types::{
    AppStatus, ChannelHandle, CommandPhase, ControlStatus, DeviceSpeed, MscStatus, Personality,
    SubmitStatus, TickStatus, UrbState,
};
