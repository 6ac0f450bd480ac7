//! Class driver error types

use protocol::ChannelHandle;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// No interface matched a known personality with both bulk roles present
    #[error("No supported interface found")]
    InterfaceNotSupported,

    #[error("Transfer engine error: {0}")]
    Engine(#[from] EngineError),

    /// Mode-switch command was not accepted by the engine
    #[error("Mode switch submission rejected")]
    ModeSwitchRejected,

    /// Mode-switch command did not complete before its deadline
    #[error("Mode switch timed out after {waited_ms} ms")]
    ModeSwitchTimeout { waited_ms: u64 },

    /// Mode-switch transfer finished with an error state
    #[error("Mode switch transfer failed: {0}")]
    ModeSwitchFailed(String),

    /// A received length exceeds the fixed buffer it must fit in
    #[error("Buffer overflow: {len} bytes (capacity: {capacity})")]
    BufferOverflow { len: usize, capacity: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors surfaced by a [`TransferEngine`](crate::engine::TransferEngine) implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("No free host channel")]
    NoFreeChannel,

    #[error("Unknown channel {0:?}")]
    UnknownChannel(ChannelHandle),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, Error>;
