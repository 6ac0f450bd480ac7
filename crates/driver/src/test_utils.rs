//! Test utilities for the class driver
//!
//! Scriptable stand-ins for the three collaborators plus descriptor builders, used
//! by the unit tests here and by the integration tests of this and the host crate.
//!
//! # Example
//!
//! ```
//! use driver::test_utils::{MockEngine, MockProber, RecordingApplication, device_info, storage_interface};
//! use driver::{ClassDriver, DriverConfig};
//! use protocol::Personality;
//!
//! let mut driver = ClassDriver::new(
//!     MockEngine::new(),
//!     MockProber::new(),
//!     RecordingApplication::default(),
//!     DriverConfig::default(),
//! );
//! let binding = driver.interface_init(device_info(), &[storage_interface()]).unwrap();
//! assert_eq!(binding.personality, Personality::MassStorageBot);
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use protocol::{
    ChannelHandle, CommandPhase, ControlStatus, DeviceIdentity, DeviceInfo, DeviceSpeed,
    EndpointDescriptor, InterfaceDescriptor, MscStatus, SetupPacket, SubmitStatus, TickStatus,
    TransferKind, UrbState,
};

use crate::application::Application;
use crate::binding::EndpointBinding;
use crate::class::ClassDriver;
use crate::engine::TransferEngine;
use crate::error::EngineError;
use crate::scsi::{ScsiCommand, ScsiProber};
use crate::selector::{MSC_CLASS, MSC_PROTOCOL_BOT, VENDOR_CLASS, VENDOR_SERIAL_PROTOCOL};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver wired to the mocks
pub type MockDriver = ClassDriver<MockEngine, MockProber, RecordingApplication>;

/// Transfer engine with scripted outcomes and a log of everything it was asked
#[derive(Debug)]
pub struct MockEngine {
    pub connected: bool,
    /// Channels that may be live at once
    pub channel_limit: usize,
    next_channel: u8,
    live: usize,
    inbound_channels: Vec<ChannelHandle>,

    /// Endpoint addresses, in allocation order
    pub allocated: Vec<u8>,
    pub opened: Vec<(ChannelHandle, TransferKind, u16)>,
    pub halted: Vec<ChannelHandle>,
    pub freed: Vec<ChannelHandle>,

    pub control_log: Vec<SetupPacket>,
    /// Per-`bRequest` status script; an empty script answers `Ok`
    pub control_responses: HashMap<u8, VecDeque<ControlStatus>>,
    /// First data-stage byte per `bRequest`
    pub control_data: HashMap<u8, u8>,

    pub send_status: SubmitStatus,
    pub bulk_sent: Vec<(ChannelHandle, Vec<u8>)>,
    /// States reported for OUT channels; `Idle` once exhausted
    pub outbound_states: VecDeque<UrbState>,

    pub receive_status: SubmitStatus,
    pub receives_armed: Vec<(ChannelHandle, usize)>,
    /// States and data reported for IN channels; `Idle` once exhausted
    ///
    /// Data longer than the armed length completes as `Error`, as an overflowing
    /// transfer does on a real controller.
    pub inbound: VecDeque<(UrbState, Vec<u8>)>,
    last_received: Vec<u8>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            connected: true,
            channel_limit: 8,
            next_channel: 0,
            live: 0,
            inbound_channels: Vec::new(),
            allocated: Vec::new(),
            opened: Vec::new(),
            halted: Vec::new(),
            freed: Vec::new(),
            control_log: Vec::new(),
            control_responses: HashMap::new(),
            control_data: HashMap::new(),
            send_status: SubmitStatus::Ok,
            bulk_sent: Vec::new(),
            outbound_states: VecDeque::new(),
            receive_status: SubmitStatus::Ok,
            receives_armed: Vec::new(),
            inbound: VecDeque::new(),
            last_received: Vec::new(),
        }
    }

    /// Queue statuses for control requests with code `request`
    pub fn script_control(&mut self, request: u8, statuses: &[ControlStatus]) {
        self.control_responses
            .entry(request)
            .or_default()
            .extend(statuses.iter().copied());
    }

    /// Queue one completed inbound transfer carrying `data`
    pub fn push_inbound(&mut self, data: &[u8]) {
        self.inbound.push_back((UrbState::Done, data.to_vec()));
    }

    /// Control requests issued with code `request`, resubmissions included
    pub fn control_count(&self, request: u8) -> usize {
        self.control_log
            .iter()
            .filter(|setup| setup.request == request)
            .count()
    }
}

impl TransferEngine for MockEngine {
    fn allocate_channel(&mut self, endpoint_address: u8) -> Result<ChannelHandle, EngineError> {
        if self.live >= self.channel_limit {
            return Err(EngineError::NoFreeChannel);
        }
        let channel = ChannelHandle(self.next_channel);
        self.next_channel += 1;
        self.live += 1;
        self.allocated.push(endpoint_address);
        if endpoint_address & 0x80 != 0 {
            self.inbound_channels.push(channel);
        }
        Ok(channel)
    }

    fn open_channel(
        &mut self,
        channel: ChannelHandle,
        _device_address: u8,
        _speed: DeviceSpeed,
        kind: TransferKind,
        max_packet_size: u16,
    ) -> Result<(), EngineError> {
        if !self.connected {
            return Err(EngineError::Disconnected);
        }
        self.opened.push((channel, kind, max_packet_size));
        Ok(())
    }

    fn submit_control_request(&mut self, setup: &SetupPacket, buffer: &mut [u8]) -> ControlStatus {
        self.control_log.push(*setup);
        let status = self
            .control_responses
            .get_mut(&setup.request)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ControlStatus::Ok);

        if status == ControlStatus::Ok && setup.is_in() {
            if let Some(first) = buffer.first_mut() {
                *first = self.control_data.get(&setup.request).copied().unwrap_or(0);
            }
        }
        status
    }

    fn submit_bulk_send(&mut self, channel: ChannelHandle, data: &[u8]) -> SubmitStatus {
        self.bulk_sent.push((channel, data.to_vec()));
        self.send_status
    }

    fn submit_bulk_receive(&mut self, channel: ChannelHandle, length: usize) -> SubmitStatus {
        self.receives_armed.push((channel, length));
        self.receive_status
    }

    fn poll_transfer_state(&mut self, channel: ChannelHandle) -> UrbState {
        if self.inbound_channels.contains(&channel) {
            match self.inbound.pop_front() {
                Some((UrbState::Done, data)) => {
                    let armed = self.receives_armed.last().map_or(0, |(_, len)| *len);
                    if data.len() > armed {
                        return UrbState::Error;
                    }
                    self.last_received = data;
                    UrbState::Done
                }
                Some((state, _)) => state,
                None => UrbState::Idle,
            }
        } else {
            self.outbound_states.pop_front().unwrap_or(UrbState::Idle)
        }
    }

    fn transferred_length(&self, channel: ChannelHandle) -> usize {
        if self.inbound_channels.contains(&channel) {
            self.last_received.len()
        } else {
            self.bulk_sent.last().map(|(_, data)| data.len()).unwrap_or(0)
        }
    }

    fn read_received(&mut self, _channel: ChannelHandle, buffer: &mut [u8]) -> usize {
        let n = buffer.len().min(self.last_received.len());
        buffer[..n].copy_from_slice(&self.last_received[..n]);
        n
    }

    fn halt_channel(&mut self, channel: ChannelHandle) {
        self.halted.push(channel);
    }

    fn free_channel(&mut self, channel: ChannelHandle) {
        self.live = self.live.saturating_sub(1);
        self.freed.push(channel);
    }

    fn is_device_connected(&self) -> bool {
        self.connected
    }
}

/// SCSI layer with per-command status scripts
///
/// Commands without a script succeed. With `two_phase` set, every command first
/// reports `Busy` in the send phase, like a real CBW/CSW exchange would.
#[derive(Debug, Default)]
pub struct MockProber {
    scripts: HashMap<ScsiCommand, VecDeque<MscStatus>>,
    pub calls: Vec<ScsiCommand>,
    pub init_calls: usize,
    pub bound: Option<EndpointBinding>,
    pub two_phase: bool,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&mut self, command: ScsiCommand, statuses: &[MscStatus]) {
        self.scripts
            .entry(command)
            .or_default()
            .extend(statuses.iter().copied());
    }

    /// Times `command` was invoked
    pub fn calls_of(&self, command: ScsiCommand) -> usize {
        self.calls.iter().filter(|c| **c == command).count()
    }

    fn run(&mut self, command: ScsiCommand, phase: &mut CommandPhase) -> MscStatus {
        self.calls.push(command);
        if self.two_phase && *phase == CommandPhase::Send {
            *phase = CommandPhase::Wait;
            return MscStatus::Busy;
        }
        let status = self
            .scripts
            .get_mut(&command)
            .and_then(VecDeque::pop_front)
            .unwrap_or(MscStatus::Ok);
        if status != MscStatus::Busy {
            *phase = CommandPhase::Send;
        }
        status
    }
}

impl ScsiProber for MockProber {
    fn init(&mut self, binding: &EndpointBinding) {
        self.init_calls += 1;
        self.bound = Some(*binding);
    }

    fn test_unit_ready(&mut self, phase: &mut CommandPhase) -> MscStatus {
        self.run(ScsiCommand::TestUnitReady, phase)
    }

    fn read_capacity10(&mut self, phase: &mut CommandPhase) -> MscStatus {
        self.run(ScsiCommand::ReadCapacity10, phase)
    }

    fn mode_sense6(&mut self, phase: &mut CommandPhase) -> MscStatus {
        self.run(ScsiCommand::ModeSense6, phase)
    }

    fn request_sense(&mut self, phase: &mut CommandPhase) -> MscStatus {
        self.run(ScsiCommand::RequestSense, phase)
    }
}

/// Application that records every callback
#[derive(Debug, Default)]
pub struct RecordingApplication {
    pub not_supported: usize,
    pub app_calls: usize,
    pub responses: Vec<String>,
    /// Return values for `user_application`; `0` once exhausted
    pub script: VecDeque<u8>,
}

impl Application for RecordingApplication {
    fn device_not_supported(&mut self) {
        self.not_supported += 1;
    }

    fn user_application(&mut self) -> u8 {
        self.app_calls += 1;
        self.script.pop_front().unwrap_or(0)
    }

    fn serial_response(&mut self, text: &str) {
        self.responses.push(text.to_string());
    }
}

pub fn endpoint(address: u8, kind: TransferKind, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        attributes: kind.attributes(),
        max_packet_size,
        interval: 0,
    }
}

pub fn bulk_in(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    endpoint(address | 0x80, TransferKind::Bulk, max_packet_size)
}

pub fn bulk_out(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    endpoint(address & 0x7F, TransferKind::Bulk, max_packet_size)
}

pub fn interrupt_in(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    endpoint(address | 0x80, TransferKind::Interrupt, max_packet_size)
}

pub fn interface(
    number: u8,
    class: u8,
    protocol: u8,
    endpoints: Vec<EndpointDescriptor>,
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        alternate_setting: 0,
        class,
        subclass: 0x06,
        protocol,
        endpoints,
    }
}

/// Bulk-only storage interface: IN 0x81, OUT 0x01, 512-byte packets
pub fn storage_interface() -> InterfaceDescriptor {
    interface(
        0,
        MSC_CLASS,
        MSC_PROTOCOL_BOT,
        vec![bulk_in(0x81, 512), bulk_out(0x01, 512)],
    )
}

/// Vendor serial interface: IN 0x82, OUT 0x02, 64-byte packets
pub fn serial_interface() -> InterfaceDescriptor {
    interface(
        0,
        VENDOR_CLASS,
        VENDOR_SERIAL_PROTOCOL,
        vec![bulk_in(0x82, 64), bulk_out(0x02, 64)],
    )
}

/// Generic high-speed device at address 1
pub fn device_info() -> DeviceInfo {
    device_with_identity(0x0781, 0x5581)
}

/// The 12d1:155b dongle that needs a mode switch
pub fn modem_device_info() -> DeviceInfo {
    device_with_identity(0x12d1, 0x155b)
}

pub fn device_with_identity(vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        identity: DeviceIdentity {
            vendor_id,
            product_id,
        },
        address: 1,
        speed: DeviceSpeed::High,
    }
}

/// Tick until `done` holds or `max_ticks` ticks have run; returns the last status
pub fn tick_until<F>(driver: &mut MockDriver, max_ticks: usize, mut done: F) -> TickStatus
where
    F: FnMut(&MockDriver, TickStatus) -> bool,
{
    let mut status = TickStatus::Busy;
    for _ in 0..max_ticks {
        status = driver.tick(Instant::now());
        if done(driver, status) {
            break;
        }
    }
    status
}

/// Timeout wrapper for async tests
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
