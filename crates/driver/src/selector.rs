//! Interface selection
//!
//! Picks the interface the class driver binds to and the bulk endpoint pair it will
//! use. Selection is pure; channel allocation happens in [`crate::binding`].

use protocol::{EndpointDescriptor, InterfaceDescriptor, Personality};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Mass storage interface class
pub const MSC_CLASS: u8 = 0x08;
/// Bulk-only transport protocol
pub const MSC_PROTOCOL_BOT: u8 = 0x50;
/// Vendor-specific interface class
pub const VENDOR_CLASS: u8 = 0xFF;
/// Protocol tag of the dongle's serial function once switched
pub const VENDOR_SERIAL_PROTOCOL: u8 = 0x62;

/// Class/protocol tag identifying a personality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSignature {
    pub class: u8,
    pub protocol: u8,
    pub personality: Personality,
}

impl InterfaceSignature {
    pub const MASS_STORAGE: Self = Self {
        class: MSC_CLASS,
        protocol: MSC_PROTOCOL_BOT,
        personality: Personality::MassStorageBot,
    };

    pub const VENDOR_SERIAL: Self = Self {
        class: VENDOR_CLASS,
        protocol: VENDOR_SERIAL_PROTOCOL,
        personality: Personality::VendorSerial,
    };

    pub fn matches(&self, interface: &InterfaceDescriptor) -> bool {
        interface.class == self.class && interface.protocol == self.protocol
    }
}

/// Recognized signatures, mass storage first
pub fn default_signatures() -> Vec<InterfaceSignature> {
    vec![
        InterfaceSignature::MASS_STORAGE,
        InterfaceSignature::VENDOR_SERIAL,
    ]
}

/// Outcome of a successful interface scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Position of the interface in the descriptor list
    pub position: usize,
    pub interface_number: u8,
    pub personality: Personality,
    pub bulk_in: EndpointDescriptor,
    pub bulk_out: EndpointDescriptor,
}

/// First bulk IN and first bulk OUT endpoint, in descriptor order
fn bulk_pair(interface: &InterfaceDescriptor) -> Option<(EndpointDescriptor, EndpointDescriptor)> {
    let mut bulk = interface.endpoints.iter().filter(|ep| ep.is_bulk());
    let bulk_in = bulk.clone().find(|ep| ep.is_in())?;
    let bulk_out = bulk.find(|ep| !ep.is_in())?;
    Some((*bulk_in, *bulk_out))
}

/// Select the lowest-indexed interface matching any signature that has both a
/// bulk IN and a bulk OUT endpoint
pub fn select_interface(
    interfaces: &[InterfaceDescriptor],
    signatures: &[InterfaceSignature],
) -> Result<Selection> {
    for (position, interface) in interfaces.iter().enumerate() {
        let Some(signature) = signatures.iter().find(|s| s.matches(interface)) else {
            trace!(
                "Interface {} ({:#04x}/{:#04x}) matches no signature",
                interface.number, interface.class, interface.protocol
            );
            continue;
        };

        match bulk_pair(interface) {
            Some((bulk_in, bulk_out)) => {
                debug!(
                    "Selected interface {} as {:?}: in={:#04x} out={:#04x}",
                    interface.number, signature.personality, bulk_in.address, bulk_out.address
                );
                return Ok(Selection {
                    position,
                    interface_number: interface.number,
                    personality: signature.personality,
                    bulk_in,
                    bulk_out,
                });
            }
            None => {
                debug!(
                    "Interface {} matches {:?} but lacks a bulk endpoint pair",
                    interface.number, signature.personality
                );
            }
        }
    }

    Err(Error::InterfaceNotSupported)
}
