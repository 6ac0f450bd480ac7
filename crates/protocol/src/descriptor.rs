//! Descriptor model
//!
//! Only the parts of the device, interface and endpoint descriptors that interface
//! selection needs are modelled here. Parsing raw descriptors is the enumeration
//! layer's job; these types are what it hands to the class driver.

use serde::{Deserialize, Serialize};

use crate::types::DeviceSpeed;

/// Endpoint transfer type (bits 1..0 of `bmAttributes`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Decode from an endpoint's `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }

    /// Encode into the low bits of `bmAttributes`
    pub fn attributes(self) -> u8 {
        match self {
            TransferKind::Control => 0,
            TransferKind::Isochronous => 1,
            TransferKind::Bulk => 2,
            TransferKind::Interrupt => 3,
        }
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`, bit 7 set for IN endpoints
    pub address: u8,
    /// `bmAttributes`
    pub attributes: u8,
    /// `wMaxPacketSize`
    pub max_packet_size: u16,
    /// `bInterval`
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn transfer_kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }

    /// Device-to-host endpoint
    pub fn is_in(&self) -> bool {
        (self.address & 0x80) != 0
    }

    pub fn is_bulk(&self) -> bool {
        self.transfer_kind() == TransferKind::Bulk
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }
}

/// Interface descriptor together with its endpoints, in descriptor order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// `bInterfaceNumber`
    pub number: u8,
    /// `bAlternateSetting`
    pub alternate_setting: u8,
    /// `bInterfaceClass`
    pub class: u8,
    /// `bInterfaceSubClass`
    pub subclass: u8,
    /// `bInterfaceProtocol`
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Vendor/product identifier pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// What the enumeration layer knows about an addressed device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub identity: DeviceIdentity,
    /// Bus address assigned during enumeration
    pub address: u8,
    pub speed: DeviceSpeed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction() {
        let ep_in = EndpointDescriptor {
            address: 0x81,
            attributes: 0x02,
            max_packet_size: 512,
            interval: 0,
        };
        let ep_out = EndpointDescriptor {
            address: 0x02,
            ..ep_in
        };
        assert!(ep_in.is_in());
        assert!(!ep_out.is_in());
        assert_eq!(ep_in.number(), 1);
        assert_eq!(ep_out.number(), 2);
    }

    #[test]
    fn test_transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
        // Upper bits (sync/usage type) are ignored
        assert_eq!(TransferKind::from_attributes(0x0D), TransferKind::Isochronous);
        assert_eq!(TransferKind::Bulk.attributes(), 0x02);
    }

    #[test]
    fn test_identity_display() {
        let id = DeviceIdentity {
            vendor_id: 0x12d1,
            product_id: 0x155b,
        };
        assert_eq!(id.to_string(), "12d1:155b");
    }
}
