//! Transfer engine seam
//!
//! The host-controller transfer engine is an external collaborator: it owns host
//! channels, executes control and bulk transfers, and reports their progress only
//! through polling. The class driver never blocks on it.

use protocol::{
    ChannelHandle, ControlStatus, DeviceSpeed, SetupPacket, SubmitStatus, TransferKind, UrbState,
};

use crate::error::EngineError;

/// Host-side transfer engine used by one class-driver instance
pub trait TransferEngine {
    /// Reserve a host channel for `endpoint_address`
    fn allocate_channel(&mut self, endpoint_address: u8) -> Result<ChannelHandle, EngineError>;

    /// Configure a previously allocated channel for a device endpoint
    fn open_channel(
        &mut self,
        channel: ChannelHandle,
        device_address: u8,
        speed: DeviceSpeed,
        kind: TransferKind,
        max_packet_size: u16,
    ) -> Result<(), EngineError>;

    /// Submit (or continue) a control request on the default pipe
    ///
    /// Re-entrant: returns [`ControlStatus::Busy`] until the request completes, and
    /// the caller keeps invoking it with the same setup packet. For IN requests the
    /// data stage lands in `buffer`.
    fn submit_control_request(&mut self, setup: &SetupPacket, buffer: &mut [u8]) -> ControlStatus;

    /// Queue `data` for transmission on a bulk OUT channel
    fn submit_bulk_send(&mut self, channel: ChannelHandle, data: &[u8]) -> SubmitStatus;

    /// Arm a bulk IN transfer of up to `length` bytes
    fn submit_bulk_receive(&mut self, channel: ChannelHandle, length: usize) -> SubmitStatus;

    /// Current state of the last transfer on `channel`
    fn poll_transfer_state(&mut self, channel: ChannelHandle) -> UrbState;

    /// Bytes moved by the last completed transfer on `channel`
    fn transferred_length(&self, channel: ChannelHandle) -> usize;

    /// Copy the data of the last completed IN transfer into `buffer`
    ///
    /// Returns the number of bytes copied, never more than `buffer.len()`.
    fn read_received(&mut self, channel: ChannelHandle, buffer: &mut [u8]) -> usize;

    fn halt_channel(&mut self, channel: ChannelHandle);

    fn free_channel(&mut self, channel: ChannelHandle);

    fn is_device_connected(&self) -> bool;
}
