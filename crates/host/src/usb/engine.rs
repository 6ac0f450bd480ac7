//! Transfer engine over libusb
//!
//! libusb transfers are synchronous, so "submitting" a bulk send performs it and
//! records the outcome for the next poll. A bulk receive is armed on submit and
//! attempted on each poll with a short timeout; a timeout reads as `NotReady`.

use std::sync::Arc;
use std::time::Duration;

use driver::{EngineError, TransferEngine};
use protocol::{
    ChannelHandle, ControlStatus, DeviceSpeed, SetupPacket, SubmitStatus, TransferKind, UrbState,
};
use tracing::{debug, trace, warn};

use super::io::UsbIo;

/// Number of channel slots, matching a small host controller
pub const MAX_CHANNELS: usize = 8;

/// Timeouts applied to the underlying libusb calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub control: Duration,
    pub bulk: Duration,
    /// Wait per poll of an armed receive
    pub receive: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_millis(1000),
            bulk: Duration::from_millis(1000),
            receive: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct Channel {
    endpoint: u8,
    kind: Option<TransferKind>,
    max_packet: u16,
    state: UrbState,
    /// Length of an armed receive that has not completed yet
    pending_receive: Option<usize>,
    data: Vec<u8>,
    transferred: usize,
}

impl Channel {
    fn new(endpoint: u8) -> Self {
        Self {
            endpoint,
            kind: None,
            max_packet: 0,
            state: UrbState::Idle,
            pending_receive: None,
            data: Vec::new(),
            transferred: 0,
        }
    }
}

pub struct RusbEngine<IO> {
    io: Arc<IO>,
    timeouts: Timeouts,
    channels: [Option<Channel>; MAX_CHANNELS],
    connected: bool,
}

impl<IO: UsbIo> RusbEngine<IO> {
    pub fn new(io: Arc<IO>, timeouts: Timeouts) -> Self {
        Self {
            io,
            timeouts,
            channels: Default::default(),
            connected: true,
        }
    }

    fn channel_mut(&mut self, handle: ChannelHandle) -> Option<&mut Channel> {
        self.channels
            .get_mut(usize::from(handle.0))
            .and_then(Option::as_mut)
    }

    fn channel(&self, handle: ChannelHandle) -> Option<&Channel> {
        self.channels.get(usize::from(handle.0)).and_then(Option::as_ref)
    }

    /// Note a lost device; later calls short-circuit
    fn observe(&mut self, err: rusb::Error) {
        if err == rusb::Error::NoDevice {
            if self.connected {
                warn!("Device disconnected");
            }
            self.connected = false;
        }
    }
}

/// Map a failed bulk transfer onto the polled state the driver understands
pub fn map_bulk_error(err: rusb::Error) -> UrbState {
    match err {
        rusb::Error::Timeout => UrbState::NotReady,
        rusb::Error::Pipe => UrbState::Stall,
        _ => UrbState::Error,
    }
}

/// Map a failed control transfer onto a control status
pub fn map_control_error(err: rusb::Error) -> ControlStatus {
    match err {
        rusb::Error::Pipe => ControlStatus::NotSupported,
        rusb::Error::Timeout => ControlStatus::Busy,
        _ => ControlStatus::Fail,
    }
}

impl<IO: UsbIo> TransferEngine for RusbEngine<IO> {
    fn allocate_channel(&mut self, endpoint_address: u8) -> Result<ChannelHandle, EngineError> {
        let slot = self
            .channels
            .iter()
            .position(Option::is_none)
            .ok_or(EngineError::NoFreeChannel)?;
        self.channels[slot] = Some(Channel::new(endpoint_address));
        // MAX_CHANNELS fits in a u8
        let handle = ChannelHandle(slot as u8);
        debug!("Allocated {:?} for endpoint {:#04x}", handle, endpoint_address);
        Ok(handle)
    }

    fn open_channel(
        &mut self,
        channel: ChannelHandle,
        device_address: u8,
        speed: DeviceSpeed,
        kind: TransferKind,
        max_packet_size: u16,
    ) -> Result<(), EngineError> {
        let ch = self
            .channel_mut(channel)
            .ok_or(EngineError::UnknownChannel(channel))?;
        ch.kind = Some(kind);
        ch.max_packet = max_packet_size;
        debug!(
            "Opened {:?}: endpoint={:#04x} device={} speed={:?} kind={:?} mps={}",
            channel, ch.endpoint, device_address, speed, kind, max_packet_size
        );
        Ok(())
    }

    fn submit_control_request(&mut self, setup: &SetupPacket, buffer: &mut [u8]) -> ControlStatus {
        if !self.connected {
            return ControlStatus::Fail;
        }
        let request_type = setup.request_type();
        let len = usize::from(setup.length).min(buffer.len());
        trace!(
            "Control: request_type={:#04x} request={:#04x} value={:#06x} index={:#06x} len={}",
            request_type, setup.request, setup.value, setup.index, len
        );

        let result = if setup.is_in() {
            self.io.read_control(
                request_type,
                setup.request,
                setup.value,
                setup.index,
                &mut buffer[..len],
                self.timeouts.control,
            )
        } else {
            self.io.write_control(
                request_type,
                setup.request,
                setup.value,
                setup.index,
                &buffer[..len],
                self.timeouts.control,
            )
        };

        match result {
            Ok(_) => ControlStatus::Ok,
            Err(e) => {
                debug!("Control request {:#04x} failed: {}", setup.request, e);
                self.observe(e);
                map_control_error(e)
            }
        }
    }

    fn submit_bulk_send(&mut self, channel: ChannelHandle, data: &[u8]) -> SubmitStatus {
        if !self.connected {
            return SubmitStatus::Fail;
        }
        let timeout = self.timeouts.bulk;
        let io = Arc::clone(&self.io);
        let Some(ch) = self.channel_mut(channel) else {
            return SubmitStatus::Fail;
        };
        if ch.kind != Some(TransferKind::Bulk) {
            return SubmitStatus::Fail;
        }

        let result = io.write_bulk(ch.endpoint, data, timeout);
        let err = match result {
            Ok(n) => {
                ch.state = UrbState::Done;
                ch.transferred = n;
                None
            }
            Err(e) => {
                debug!("Bulk OUT {:#04x} failed: {}", ch.endpoint, e);
                ch.state = map_bulk_error(e);
                ch.transferred = 0;
                Some(e)
            }
        };
        if let Some(e) = err {
            self.observe(e);
        }
        SubmitStatus::Ok
    }

    fn submit_bulk_receive(&mut self, channel: ChannelHandle, length: usize) -> SubmitStatus {
        if !self.connected {
            return SubmitStatus::Fail;
        }
        let Some(ch) = self.channel_mut(channel) else {
            return SubmitStatus::Fail;
        };
        if ch.kind != Some(TransferKind::Bulk) {
            return SubmitStatus::Fail;
        }
        // libusb overflows a transfer that ends mid-packet
        let packet = usize::from(ch.max_packet).max(1);
        let length = length.max(1).div_ceil(packet) * packet;
        trace!(
            "Armed receive on {:?}: {} bytes (mps {})",
            channel, length, ch.max_packet
        );
        ch.pending_receive = Some(length);
        ch.state = UrbState::Idle;
        ch.transferred = 0;
        ch.data.clear();
        SubmitStatus::Ok
    }

    fn poll_transfer_state(&mut self, channel: ChannelHandle) -> UrbState {
        let connected = self.connected;
        let timeout = self.timeouts.receive;
        let io = Arc::clone(&self.io);
        let Some(ch) = self.channel_mut(channel) else {
            return UrbState::Error;
        };
        let Some(length) = ch.pending_receive else {
            return ch.state;
        };
        if !connected {
            ch.pending_receive = None;
            ch.state = UrbState::Error;
            return ch.state;
        }

        let mut buf = vec![0u8; length];
        let err = match io.read_bulk(ch.endpoint, &mut buf, timeout) {
            Ok(n) => {
                buf.truncate(n);
                ch.data = buf;
                ch.transferred = n;
                ch.pending_receive = None;
                ch.state = UrbState::Done;
                None
            }
            Err(rusb::Error::Timeout) => {
                ch.state = UrbState::NotReady;
                None
            }
            Err(e) => {
                debug!("Bulk IN {:#04x} failed: {}", ch.endpoint, e);
                ch.pending_receive = None;
                ch.state = map_bulk_error(e);
                Some(e)
            }
        };
        let state = ch.state;
        if let Some(e) = err {
            self.observe(e);
        }
        state
    }

    fn transferred_length(&self, channel: ChannelHandle) -> usize {
        self.channel(channel).map_or(0, |ch| ch.transferred)
    }

    fn read_received(&mut self, channel: ChannelHandle, buffer: &mut [u8]) -> usize {
        let Some(ch) = self.channel(channel) else {
            return 0;
        };
        let n = ch.data.len().min(buffer.len());
        buffer[..n].copy_from_slice(&ch.data[..n]);
        n
    }

    fn halt_channel(&mut self, channel: ChannelHandle) {
        if let Some(ch) = self.channel_mut(channel) {
            ch.pending_receive = None;
            ch.state = UrbState::Idle;
        }
    }

    fn free_channel(&mut self, channel: ChannelHandle) {
        if let Some(slot) = self.channels.get_mut(usize::from(channel.0)) {
            if slot.take().is_some() {
                debug!("Freed {:?}", channel);
            }
        }
    }

    fn is_device_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::io::fake::FakeIo;
    use protocol::setup;

    fn engine() -> RusbEngine<FakeIo> {
        RusbEngine::new(Arc::new(FakeIo::default()), Timeouts::default())
    }

    fn open_pair(engine: &mut RusbEngine<FakeIo>) -> (ChannelHandle, ChannelHandle) {
        let out = engine.allocate_channel(0x01).unwrap();
        let inp = engine.allocate_channel(0x81).unwrap();
        for ch in [out, inp] {
            engine
                .open_channel(ch, 3, DeviceSpeed::High, TransferKind::Bulk, 512)
                .unwrap();
        }
        (out, inp)
    }

    #[test]
    fn test_map_bulk_error() {
        assert_eq!(map_bulk_error(rusb::Error::Timeout), UrbState::NotReady);
        assert_eq!(map_bulk_error(rusb::Error::Pipe), UrbState::Stall);
        assert_eq!(map_bulk_error(rusb::Error::Io), UrbState::Error);
    }

    #[test]
    fn test_map_control_error() {
        assert_eq!(map_control_error(rusb::Error::Pipe), ControlStatus::NotSupported);
        assert_eq!(map_control_error(rusb::Error::Timeout), ControlStatus::Busy);
        assert_eq!(map_control_error(rusb::Error::NoDevice), ControlStatus::Fail);
    }

    #[test]
    fn test_channels_exhaust_and_recycle() {
        let mut engine = engine();
        for i in 0..MAX_CHANNELS {
            assert_eq!(engine.allocate_channel(0x81).unwrap(), ChannelHandle(i as u8));
        }
        assert_eq!(engine.allocate_channel(0x81), Err(EngineError::NoFreeChannel));

        engine.free_channel(ChannelHandle(3));
        assert_eq!(engine.allocate_channel(0x02).unwrap(), ChannelHandle(3));
    }

    #[test]
    fn test_open_unknown_channel_fails() {
        let mut engine = engine();
        let result = engine.open_channel(
            ChannelHandle(5),
            1,
            DeviceSpeed::Full,
            TransferKind::Bulk,
            64,
        );
        assert_eq!(result, Err(EngineError::UnknownChannel(ChannelHandle(5))));
    }

    #[test]
    fn test_control_in_reads_data_stage() {
        let mut engine = engine();
        engine.io.push_control(Ok(vec![0]));
        let mut buf = [0xFFu8; 64];
        let setup = setup::get_max_lun(2);

        assert_eq!(engine.submit_control_request(&setup, &mut buf), ControlStatus::Ok);
        assert_eq!(buf[0], 0);
        let log = engine.io.control.borrow();
        assert_eq!(log[0], (0xA1, 0xFE, 0, 2, 1));
    }

    #[test]
    fn test_control_stall_is_not_supported() {
        let mut engine = engine();
        engine.io.push_control(Err(rusb::Error::Pipe));
        let mut buf = [0u8; 64];
        assert_eq!(
            engine.submit_control_request(&setup::bot_reset(0), &mut buf),
            ControlStatus::NotSupported
        );
        assert!(engine.is_device_connected());
    }

    #[test]
    fn test_bulk_send_outcome_is_polled() {
        let mut engine = engine();
        let (out, _) = open_pair(&mut engine);

        assert_eq!(engine.submit_bulk_send(out, b"ATi\r\n"), SubmitStatus::Ok);
        assert_eq!(engine.poll_transfer_state(out), UrbState::Done);
        assert_eq!(engine.transferred_length(out), 5);
        assert_eq!(engine.io.written.borrow()[0], (0x01, b"ATi\r\n".to_vec()));

        engine.io.fail_next_write(rusb::Error::Pipe);
        engine.submit_bulk_send(out, b"x");
        assert_eq!(engine.poll_transfer_state(out), UrbState::Stall);
    }

    #[test]
    fn test_receive_times_out_until_data_arrives() {
        let mut engine = engine();
        let (_, inp) = open_pair(&mut engine);

        assert_eq!(engine.submit_bulk_receive(inp, 64), SubmitStatus::Ok);
        assert_eq!(engine.poll_transfer_state(inp), UrbState::NotReady);

        engine.io.push_read(b"OK\r\n");
        assert_eq!(engine.poll_transfer_state(inp), UrbState::Done);
        assert_eq!(engine.transferred_length(inp), 4);

        let mut buf = [0u8; 2];
        assert_eq!(engine.read_received(inp, &mut buf), 2);
        assert_eq!(&buf, b"OK");

        // Completed receive is not read again; both reads cover a whole packet
        assert_eq!(engine.poll_transfer_state(inp), UrbState::Done);
        assert_eq!(engine.io.read_lengths.borrow().as_slice(), &[512, 512]);
    }

    #[test]
    fn test_no_device_marks_disconnected() {
        let mut engine = engine();
        let (_, inp) = open_pair(&mut engine);
        engine.submit_bulk_receive(inp, 64);
        engine.io.push_read_error(rusb::Error::NoDevice);

        assert_eq!(engine.poll_transfer_state(inp), UrbState::Error);
        assert!(!engine.is_device_connected());
        assert_eq!(engine.submit_bulk_receive(inp, 64), SubmitStatus::Fail);
    }

    #[test]
    fn test_receive_is_sized_in_whole_packets() {
        let mut engine = engine();
        let (_, inp) = open_pair(&mut engine);

        engine.submit_bulk_receive(inp, 200);
        engine.poll_transfer_state(inp);
        engine.submit_bulk_receive(inp, 513);
        engine.poll_transfer_state(inp);
        assert_eq!(engine.io.read_lengths.borrow().as_slice(), &[512, 1024]);
    }

    #[test]
    fn test_overflowing_read_is_an_error() {
        let mut engine = engine();
        let (_, inp) = open_pair(&mut engine);
        engine.submit_bulk_receive(inp, 512);
        engine.io.push_read(&[0u8; 600]);

        assert_eq!(engine.poll_transfer_state(inp), UrbState::Error);
        assert_eq!(engine.transferred_length(inp), 0);
        assert!(engine.is_device_connected());
    }

    #[test]
    fn test_halt_cancels_pending_receive() {
        let mut engine = engine();
        let (_, inp) = open_pair(&mut engine);
        engine.submit_bulk_receive(inp, 64);
        engine.halt_channel(inp);

        assert_eq!(engine.poll_transfer_state(inp), UrbState::Idle);
        assert!(engine.io.read_lengths.borrow().is_empty());
    }

    mod serial_driver {
        use std::time::Instant;

        use driver::buffers::TEXT_BUFFER_CAPACITY;
        use driver::selector::{VENDOR_CLASS, VENDOR_SERIAL_PROTOCOL};
        use driver::test_utils::{
            MockProber, RecordingApplication, bulk_in, bulk_out, device_info, interface,
        };
        use driver::{ClassDriver, DriverConfig, State};

        use super::*;

        type SerialDriver = ClassDriver<RusbEngine<FakeIo>, MockProber, RecordingApplication>;

        fn high_speed_serial() -> SerialDriver {
            let mut driver = ClassDriver::new(
                engine(),
                MockProber::new(),
                RecordingApplication::default(),
                DriverConfig::default(),
            );
            let serial = interface(
                0,
                VENDOR_CLASS,
                VENDOR_SERIAL_PROTOCOL,
                vec![bulk_in(0x82, 512), bulk_out(0x02, 512)],
            );
            driver.interface_init(device_info(), &[serial]).unwrap();
            driver
        }

        fn tick_until_response(driver: &mut SerialDriver) {
            for _ in 0..20 {
                driver.tick(Instant::now());
                if !driver.app().responses.is_empty() {
                    return;
                }
            }
        }

        #[test]
        fn test_long_reply_is_truncated_not_dropped() {
            let mut driver = high_speed_serial();
            driver.engine().io.push_read(&[b'A'; 300]);

            tick_until_response(&mut driver);

            let responses = &driver.app().responses;
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].len(), TEXT_BUFFER_CAPACITY);
            assert_eq!(driver.last_response().len(), TEXT_BUFFER_CAPACITY);
            assert_eq!(driver.state(), State::ReceiveResponse);

            let lengths = driver.engine().io.read_lengths.borrow();
            assert!(!lengths.is_empty());
            assert!(lengths.iter().all(|len| len % 512 == 0));
        }

        #[test]
        fn test_short_reply_passes_through() {
            let mut driver = high_speed_serial();
            driver.engine().io.push_read(b"\r\nOK\r\n");

            tick_until_response(&mut driver);
            assert_eq!(driver.app().responses, vec!["\r\nOK\r\n"]);
            assert_eq!(
                driver.engine().io.written.borrow()[0],
                (0x02, b"ATi\r\n".to_vec())
            );
        }
    }
}
