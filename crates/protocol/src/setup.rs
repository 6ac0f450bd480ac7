//! Control-request setup packets
//!
//! A [`SetupPacket`] is built per request and handed to the transfer engine; it is
//! never retained by the driver. The builder functions at the bottom of this module
//! produce the few fixed requests the class driver issues.

use serde::{Deserialize, Serialize};

/// Data stage direction (bit 7 of `bmRequestType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

/// Request type (bits 6..5 of `bmRequestType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
}

/// Request recipient (bits 4..0 of `bmRequestType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Standard `bRequest` code for CLEAR_FEATURE
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;

/// Bulk-only mass storage reset (class request)
pub const REQUEST_BOT_RESET: u8 = 0xFF;

/// Get max LUN (class request)
pub const REQUEST_GET_MAX_LUN: u8 = 0xFE;

/// Vendor request resetting the serial function of the modem dongle
pub const REQUEST_VENDOR_SERIAL_RESET: u8 = 0xA3;

/// Feature selector for ENDPOINT_HALT
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

/// USB control request setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    pub direction: Direction,
    pub kind: RequestKind,
    pub recipient: Recipient,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`
    pub length: u16,
}

impl SetupPacket {
    /// Encode the `bmRequestType` byte
    pub fn request_type(&self) -> u8 {
        let direction = match self.direction {
            Direction::HostToDevice => 0x00,
            Direction::DeviceToHost => 0x80,
        };
        let kind = match self.kind {
            RequestKind::Standard => 0x00,
            RequestKind::Class => 0x20,
            RequestKind::Vendor => 0x40,
        };
        let recipient = match self.recipient {
            Recipient::Device => 0x00,
            Recipient::Interface => 0x01,
            Recipient::Endpoint => 0x02,
            Recipient::Other => 0x03,
        };
        direction | kind | recipient
    }

    /// Whether the data stage (if any) flows from device to host
    pub fn is_in(&self) -> bool {
        self.direction == Direction::DeviceToHost
    }

    /// Serialize to the 8-byte little-endian layout sent in the SETUP stage
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type(),
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// Bulk-Only Mass Storage Reset for `interface`
///
/// Readies the device for the next CBW. Expected to stall on devices that do not
/// implement it.
pub fn bot_reset(interface: u8) -> SetupPacket {
    SetupPacket {
        direction: Direction::HostToDevice,
        kind: RequestKind::Class,
        recipient: Recipient::Interface,
        request: REQUEST_BOT_RESET,
        value: 0,
        index: u16::from(interface),
        length: 0,
    }
}

/// Get Max LUN for `interface`, reading a single byte
pub fn get_max_lun(interface: u8) -> SetupPacket {
    SetupPacket {
        direction: Direction::DeviceToHost,
        kind: RequestKind::Class,
        recipient: Recipient::Interface,
        request: REQUEST_GET_MAX_LUN,
        value: 0,
        index: u16::from(interface),
        length: 1,
    }
}

/// CLEAR_FEATURE(ENDPOINT_HALT) for `endpoint`
///
/// With endpoint `0x00` this clears a stalled default control pipe.
pub fn clear_endpoint_halt(endpoint: u8) -> SetupPacket {
    SetupPacket {
        direction: Direction::HostToDevice,
        kind: RequestKind::Standard,
        recipient: Recipient::Endpoint,
        request: REQUEST_CLEAR_FEATURE,
        value: FEATURE_ENDPOINT_HALT,
        index: u16::from(endpoint),
        length: 0,
    }
}

/// Vendor serial-function reset used by the dongle's communications personality
pub fn vendor_serial_reset() -> SetupPacket {
    SetupPacket {
        direction: Direction::HostToDevice,
        kind: RequestKind::Vendor,
        recipient: Recipient::Interface,
        request: REQUEST_VENDOR_SERIAL_RESET,
        value: 0,
        index: 2,
        length: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_encoding() {
        assert_eq!(bot_reset(0).request_type(), 0b0_01_00001);
        assert_eq!(get_max_lun(0).request_type(), 0b1_01_00001);
        assert_eq!(clear_endpoint_halt(0).request_type(), 0b0_00_00010);
        assert_eq!(vendor_serial_reset().request_type(), 0b0_10_00001);
    }

    #[test]
    fn test_bot_reset_targets_interface() {
        let setup = bot_reset(3);
        assert_eq!(setup.request, 0xFF);
        assert_eq!(setup.index, 3);
        assert_eq!(setup.length, 0);
        assert!(!setup.is_in());
    }

    #[test]
    fn test_get_max_lun_reads_one_byte() {
        let setup = get_max_lun(1);
        assert_eq!(setup.request, 0xFE);
        assert_eq!(setup.index, 1);
        assert_eq!(setup.length, 1);
        assert!(setup.is_in());
    }

    #[test]
    fn test_clear_feature_layout() {
        let bytes = clear_endpoint_halt(0x81).to_bytes();
        assert_eq!(bytes, [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00]);
    }
}
