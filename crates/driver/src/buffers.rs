//! Fixed-capacity buffers
//!
//! Both buffers live inside the per-device context and never grow. Lengths coming
//! from the transfer engine are checked against the capacity before the bytes are
//! looked at, and only the validated prefix is ever interpreted as text.

use std::borrow::Cow;

use crate::error::{Error, Result};

/// Capacity of the control/sense receive buffer
pub const RECEIVE_BUFFER_CAPACITY: usize = 64;

/// Capacity of the vendor-serial text buffer
pub const TEXT_BUFFER_CAPACITY: usize = 200;

/// Length to arm a serial receive with on an endpoint of `max_packet_size`
///
/// The text capacity rounded up to whole packets. A bulk IN transfer shorter
/// than a packet multiple overflows when the device sends a full packet, so the
/// transfer is sized for the endpoint and [`TextBuffer::load`] does the clamping.
pub fn receive_length(max_packet_size: u16) -> usize {
    let packet = usize::from(max_packet_size).max(1);
    TEXT_BUFFER_CAPACITY.div_ceil(packet) * packet
}

/// Receive buffer for short control-request data stages (max LUN, sense data)
#[derive(Debug, Clone)]
pub struct ReceiveBuffer {
    data: [u8; RECEIVE_BUFFER_CAPACITY],
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0; RECEIVE_BUFFER_CAPACITY],
        }
    }

    /// Zeroed window of `len` bytes for a data stage
    pub fn window(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > RECEIVE_BUFFER_CAPACITY {
            return Err(Error::BufferOverflow {
                len,
                capacity: RECEIVE_BUFFER_CAPACITY,
            });
        }
        let window = &mut self.data[..len];
        window.fill(0);
        Ok(window)
    }

    pub fn first(&self) -> u8 {
        self.data[0]
    }
}

/// Text buffer for responses from the vendor serial function
#[derive(Debug, Clone)]
pub struct TextBuffer {
    data: [u8; TEXT_BUFFER_CAPACITY],
    len: usize,
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0; TEXT_BUFFER_CAPACITY],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Load up to `reported` bytes through `fill`
    ///
    /// `reported` is the length the engine claims to have transferred. It is clamped
    /// to the capacity, and `fill` may still copy fewer bytes than it is offered;
    /// the buffer keeps whichever is smaller. Returns the clamped-away byte count
    /// as an error so callers can log it, while the buffer still holds the prefix.
    pub fn load<F>(&mut self, reported: usize, fill: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let offered = reported.min(TEXT_BUFFER_CAPACITY);
        let copied = fill(&mut self.data[..offered]).min(offered);
        self.len = copied;

        if reported > TEXT_BUFFER_CAPACITY {
            return Err(Error::BufferOverflow {
                len: reported,
                capacity: TEXT_BUFFER_CAPACITY,
            });
        }
        Ok(copied)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Validated contents as text; invalid UTF-8 is replaced, never trusted
    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }
}
