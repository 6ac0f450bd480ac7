//! Endpoint binding
//!
//! Turns a [`Selection`] into open host channels. Channels are allocated OUT first,
//! then IN, and both are released together when the class is de-initialized.

use protocol::{ChannelHandle, DeviceInfo, Personality, TransferKind};
use tracing::{debug, warn};

use crate::engine::TransferEngine;
use crate::error::Result;
use crate::selector::Selection;

/// Bulk endpoint pair bound to host channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointBinding {
    pub interface_number: u8,
    pub personality: Personality,
    pub in_address: u8,
    pub in_max_packet: u16,
    pub in_channel: ChannelHandle,
    pub out_address: u8,
    pub out_max_packet: u16,
    pub out_channel: ChannelHandle,
}

impl EndpointBinding {
    /// Allocate and open both bulk channels
    ///
    /// Any channel already allocated is freed again if a later step fails, so a
    /// failed bind leaves the engine as it found it.
    pub fn open<E: TransferEngine>(
        engine: &mut E,
        device: &DeviceInfo,
        selection: &Selection,
    ) -> Result<Self> {
        let out = selection.bulk_out;
        let inp = selection.bulk_in;

        let out_channel = engine.allocate_channel(out.address)?;
        let in_channel = match engine.allocate_channel(inp.address) {
            Ok(channel) => channel,
            Err(e) => {
                engine.free_channel(out_channel);
                return Err(e.into());
            }
        };

        let opened = engine
            .open_channel(
                out_channel,
                device.address,
                device.speed,
                TransferKind::Bulk,
                out.max_packet_size,
            )
            .and_then(|()| {
                engine.open_channel(
                    in_channel,
                    device.address,
                    device.speed,
                    TransferKind::Bulk,
                    inp.max_packet_size,
                )
            });

        if let Err(e) = opened {
            warn!("Failed to open bulk channels: {}", e);
            engine.free_channel(out_channel);
            engine.free_channel(in_channel);
            return Err(e.into());
        }

        debug!(
            "Bound interface {}: out {:#04x} -> {:?}, in {:#04x} -> {:?}",
            selection.interface_number, out.address, out_channel, inp.address, in_channel
        );

        Ok(Self {
            interface_number: selection.interface_number,
            personality: selection.personality,
            in_address: inp.address,
            in_max_packet: inp.max_packet_size,
            in_channel,
            out_address: out.address,
            out_max_packet: out.max_packet_size,
            out_channel,
        })
    }

    /// Halt and free both channels
    pub fn release<E: TransferEngine>(&self, engine: &mut E) {
        for channel in [self.out_channel, self.in_channel] {
            engine.halt_channel(channel);
            engine.free_channel(channel);
        }
        debug!("Released channels of interface {}", self.interface_number);
    }
}
