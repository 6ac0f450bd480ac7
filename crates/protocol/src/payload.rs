//! Mode-switch payload decoding
//!
//! The mode-switch command is configured as hex text and sent verbatim. Decoding
//! is strict: an odd digit count or a non-hex character is an error rather than
//! a silently shortened payload.

use crate::error::{ProtocolError, Result};

/// Largest payload accepted for the one-shot bulk command
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Command that switches the 12d1:155b dongle out of storage emulation
///
/// It is shaped like a CBW (`USBC` signature, tag `0x78563412`) carrying vendor
/// opcode `0x11` with parameter `0x06`.
pub const DEFAULT_MODE_SWITCH_PAYLOAD: &str =
    "55534243123456780000000000000011062000000100000000000000000000";

/// Decode hex text into raw bytes
///
/// Whitespace between digit pairs is ignored.
pub fn decode_hex_payload(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<(usize, char)> = text
        .char_indices()
        .filter(|(_, c)| !c.is_ascii_whitespace())
        .collect();

    if digits.len() % 2 != 0 {
        return Err(ProtocolError::OddLengthPayload { len: digits.len() });
    }

    let size = digits.len() / 2;
    if size == 0 {
        return Err(ProtocolError::EmptyPayload);
    }
    if size > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_LEN,
        });
    }

    digits
        .chunks(2)
        .map(|pair| -> Result<u8> { Ok((nibble(pair[0])? << 4) | nibble(pair[1])?) })
        .collect()
}

fn nibble((position, c): (usize, char)) -> Result<u8> {
    c.to_digit(16)
        .map(|d| d as u8)
        .ok_or(ProtocolError::InvalidHexDigit { position, found: c })
}
