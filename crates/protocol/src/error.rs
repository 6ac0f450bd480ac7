//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Hex payload has an odd number of digits
    #[error("Hex payload has odd length: {len} digits")]
    OddLengthPayload { len: usize },

    /// Non-hex character found in payload text
    #[error("Invalid hex digit {found:?} at position {position}")]
    InvalidHexDigit { position: usize, found: char },

    /// Decoded payload exceeds what a single bulk command may carry
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Payload decoded to zero bytes
    #[error("Payload is empty")]
    EmptyPayload,
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidHexDigit {
            position: 3,
            found: 'z',
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid hex digit"));
        assert!(msg.contains("'z'"));
        assert!(msg.contains("3"));
    }

    #[test]
    fn test_payload_too_large_error() {
        let err = ProtocolError::PayloadTooLarge { size: 100, max: 64 };
        let msg = format!("{}", err);
        assert!(msg.contains("Payload too large"));
        assert!(msg.contains("100"));
    }
}
