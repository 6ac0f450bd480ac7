//! Integration tests for the wire vocabulary
//!
//! Covers setup-packet encoding as it appears on the bus, descriptor helpers and
//! mode-switch payload decoding.

use protocol::setup::{self, Direction, Recipient, RequestKind};
use protocol::{
    DEFAULT_MODE_SWITCH_PAYLOAD, EndpointDescriptor, MAX_PAYLOAD_LEN, ProtocolError,
    TransferKind, decode_hex_payload,
};

mod setup_packets {
    use super::*;

    #[test]
    fn test_bot_reset_bytes() {
        assert_eq!(
            setup::bot_reset(0).to_bytes(),
            [0x21, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_get_max_lun_bytes() {
        assert_eq!(
            setup::get_max_lun(2).to_bytes(),
            [0xA1, 0xFE, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn test_vendor_serial_reset_bytes() {
        let reset = setup::vendor_serial_reset();
        assert_eq!(reset.kind, RequestKind::Vendor);
        assert_eq!(reset.recipient, Recipient::Interface);
        assert_eq!(reset.direction, Direction::HostToDevice);
        assert_eq!(
            reset.to_bytes(),
            [0x41, 0xA3, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn test_clear_halt_on_default_pipe() {
        let clear = setup::clear_endpoint_halt(0x00);
        assert_eq!(clear.request, setup::REQUEST_CLEAR_FEATURE);
        assert_eq!(clear.value, setup::FEATURE_ENDPOINT_HALT);
        assert_eq!(clear.index, 0);
    }
}

mod descriptors {
    use super::*;

    #[test]
    fn test_interrupt_endpoint_is_not_bulk() {
        let ep = EndpointDescriptor {
            address: 0x83,
            attributes: TransferKind::Interrupt.attributes(),
            max_packet_size: 16,
            interval: 9,
        };
        assert!(ep.is_in());
        assert!(!ep.is_bulk());
        assert_eq!(ep.number(), 3);
    }
}

mod payload {
    use super::*;

    #[test]
    fn test_default_payload_is_cbw_shaped() {
        let payload = decode_hex_payload(DEFAULT_MODE_SWITCH_PAYLOAD).unwrap();
        assert_eq!(payload.len(), 31);
        assert_eq!(&payload[0..4], b"USBC");
        assert_eq!(&payload[4..8], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(payload[15], 0x11);
        assert_eq!(payload[16], 0x06);
    }

    #[test]
    fn test_whitespace_between_pairs_is_ignored() {
        assert_eq!(
            decode_hex_payload("55 53 42 43").unwrap(),
            b"USBC".to_vec()
        );
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            decode_hex_payload("555"),
            Err(ProtocolError::OddLengthPayload { len: 3 })
        );
        assert_eq!(decode_hex_payload(""), Err(ProtocolError::EmptyPayload));
        assert!(matches!(
            decode_hex_payload("5x"),
            Err(ProtocolError::InvalidHexDigit { found: 'x', .. })
        ));
        assert_eq!(
            decode_hex_payload(&"ab".repeat(MAX_PAYLOAD_LEN + 1)),
            Err(ProtocolError::PayloadTooLarge {
                size: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN
            })
        );
    }
}
