//! Bulk-Only Transport layer for the readiness probe
//!
//! Each SCSI command is wrapped in a 31-byte Command Block Wrapper, optionally
//! followed by a data-in stage, and answered by a 13-byte Command Status Wrapper.
//! The CBW goes out in the `Send` phase; the data and status stages are read in
//! the `Wait` phase, one tick at a time, so a slow device only yields `Busy`.

use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use driver::{EndpointBinding, ScsiCommand, ScsiProber};
use protocol::{CommandPhase, MscStatus};
use tracing::{debug, info, trace, warn};

use super::io::UsbIo;

/// "USBC"
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// "USBS"
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

const CBW_FLAG_DATA_IN: u8 = 0x80;

pub const CSW_STATUS_PASSED: u8 = 0;
pub const CSW_STATUS_FAILED: u8 = 1;
pub const CSW_STATUS_PHASE_ERROR: u8 = 2;

/// Allocation length used for MODE SENSE(6)
pub const MODE_SENSE_ALLOC: u8 = 0xC0;
/// Fixed-format sense data length
pub const SENSE_ALLOC: u8 = 18;
const READ_CAPACITY_LEN: usize = 8;

/// SCSI command descriptor blocks
pub mod cdb {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const READ_CAPACITY_10: u8 = 0x25;

    /// Return all mode pages
    pub const ALL_PAGES: u8 = 0x3F;

    pub fn test_unit_ready() -> [u8; 6] {
        [TEST_UNIT_READY, 0, 0, 0, 0, 0]
    }

    pub fn request_sense(alloc: u8) -> [u8; 6] {
        [REQUEST_SENSE, 0, 0, 0, alloc, 0]
    }

    pub fn mode_sense6(alloc: u8) -> [u8; 6] {
        [MODE_SENSE_6, 0, ALL_PAGES, 0, alloc, 0]
    }

    pub fn read_capacity10() -> [u8; 10] {
        [READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]
    }
}

/// Command Block Wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBlock {
    pub tag: u32,
    pub data_len: u32,
    pub data_in: bool,
    pub lun: u8,
    pub cdb: Vec<u8>,
}

impl CommandBlock {
    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut buf = [0u8; CBW_LEN];
        LittleEndian::write_u32(&mut buf[0..4], CBW_SIGNATURE);
        LittleEndian::write_u32(&mut buf[4..8], self.tag);
        LittleEndian::write_u32(&mut buf[8..12], self.data_len);
        buf[12] = if self.data_in { CBW_FLAG_DATA_IN } else { 0 };
        buf[13] = self.lun & 0x0F;
        let len = self.cdb.len().min(16);
        buf[14] = len as u8;
        buf[15..15 + len].copy_from_slice(&self.cdb[..len]);
        buf
    }
}

/// Command Status Wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

impl CommandStatus {
    /// `None` unless `buf` is exactly one well-signed CSW
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != CSW_LEN || LittleEndian::read_u32(&buf[0..4]) != CSW_SIGNATURE {
            return None;
        }
        Some(Self {
            tag: LittleEndian::read_u32(&buf[4..8]),
            residue: LittleEndian::read_u32(&buf[8..12]),
            status: buf[12],
        })
    }
}

/// READ CAPACITY(10) response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub last_lba: u32,
    pub block_size: u32,
}

impl Capacity {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < READ_CAPACITY_LEN {
            return None;
        }
        Some(Self {
            last_lba: BigEndian::read_u32(&data[0..4]),
            block_size: BigEndian::read_u32(&data[4..8]),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        (u64::from(self.last_lba) + 1) * u64::from(self.block_size)
    }
}

/// Fixed-format sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 14 {
            return None;
        }
        match data[0] & 0x7F {
            0x70 | 0x71 => Some(Self {
                key: data[2] & 0x0F,
                asc: data[12],
                ascq: data[13],
            }),
            _ => None,
        }
    }
}

/// Write-protect bit of the MODE SENSE(6) parameter header
pub fn parse_write_protect(data: &[u8]) -> Option<bool> {
    if data.len() < 4 {
        return None;
    }
    Some(data[2] & 0x80 != 0)
}

fn plan(command: ScsiCommand) -> (Vec<u8>, usize) {
    match command {
        ScsiCommand::TestUnitReady => (cdb::test_unit_ready().to_vec(), 0),
        ScsiCommand::ReadCapacity10 => (cdb::read_capacity10().to_vec(), READ_CAPACITY_LEN),
        ScsiCommand::ModeSense6 => (
            cdb::mode_sense6(MODE_SENSE_ALLOC).to_vec(),
            usize::from(MODE_SENSE_ALLOC),
        ),
        ScsiCommand::RequestSense => (
            cdb::request_sense(SENSE_ALLOC).to_vec(),
            usize::from(SENSE_ALLOC),
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Data,
    Status,
}

#[derive(Debug)]
struct Pending {
    command: ScsiCommand,
    tag: u32,
    data_len: usize,
    stage: Stage,
    data: Vec<u8>,
    status_retried: bool,
}

#[derive(Debug, Clone, Copy)]
struct Endpoints {
    bulk_in: u8,
    bulk_out: u8,
}

/// BOT transport bound to one interface's bulk pair
pub struct BotProber<IO> {
    io: Arc<IO>,
    timeout: Duration,
    endpoints: Option<Endpoints>,
    lun: u8,
    tag: u32,
    pending: Option<Pending>,
    capacity: Option<Capacity>,
    sense: Option<SenseData>,
    write_protected: Option<bool>,
}

impl<IO: UsbIo> BotProber<IO> {
    pub fn new(io: Arc<IO>, timeout: Duration) -> Self {
        Self {
            io,
            timeout,
            endpoints: None,
            lun: 0,
            tag: 0,
            pending: None,
            capacity: None,
            sense: None,
            write_protected: None,
        }
    }

    pub fn capacity(&self) -> Option<Capacity> {
        self.capacity
    }

    pub fn last_sense(&self) -> Option<SenseData> {
        self.sense
    }

    pub fn write_protected(&self) -> Option<bool> {
        self.write_protected
    }

    fn next_tag(&mut self) -> u32 {
        self.tag = self.tag.wrapping_add(1);
        self.tag
    }

    fn run(&mut self, command: ScsiCommand, phase: &mut CommandPhase) -> MscStatus {
        let Some(endpoints) = self.endpoints else {
            warn!("{} issued before the transport was bound", command);
            return MscStatus::PhaseError;
        };
        match *phase {
            CommandPhase::Send => self.send(command, endpoints, phase),
            CommandPhase::Wait => self.wait(command, endpoints, phase),
        }
    }

    fn send(
        &mut self,
        command: ScsiCommand,
        endpoints: Endpoints,
        phase: &mut CommandPhase,
    ) -> MscStatus {
        let (cdb, data_len) = plan(command);
        let tag = self.next_tag();
        let block = CommandBlock {
            tag,
            data_len: data_len as u32,
            data_in: data_len > 0,
            lun: self.lun,
            cdb,
        };
        trace!("CBW {} tag={} len={}", command, tag, data_len);

        match self
            .io
            .write_bulk(endpoints.bulk_out, &block.to_bytes(), self.timeout)
        {
            Ok(CBW_LEN) => {
                self.pending = Some(Pending {
                    command,
                    tag,
                    data_len,
                    stage: if data_len > 0 { Stage::Data } else { Stage::Status },
                    data: Vec::new(),
                    status_retried: false,
                });
                *phase = CommandPhase::Wait;
                MscStatus::Busy
            }
            Ok(n) => {
                warn!("Short CBW write for {}: {} bytes", command, n);
                MscStatus::PhaseError
            }
            Err(rusb::Error::Timeout) => MscStatus::Busy,
            Err(rusb::Error::Pipe) => {
                debug!("CBW stalled, clearing {:#04x}", endpoints.bulk_out);
                self.clear(endpoints.bulk_out);
                MscStatus::Fail
            }
            Err(e) => {
                warn!("CBW write for {} failed: {}", command, e);
                MscStatus::PhaseError
            }
        }
    }

    fn wait(
        &mut self,
        command: ScsiCommand,
        endpoints: Endpoints,
        phase: &mut CommandPhase,
    ) -> MscStatus {
        let io = Arc::clone(&self.io);
        let timeout = self.timeout;
        let Some(pending) = self.pending.as_mut() else {
            // Nothing in flight; start over
            *phase = CommandPhase::Send;
            return MscStatus::Busy;
        };
        if pending.command != command {
            warn!("{} polled while {} is in flight", command, pending.command);
            return self.finish(phase, MscStatus::PhaseError);
        }

        if pending.stage == Stage::Data {
            let mut buf = vec![0u8; pending.data_len];
            match io.read_bulk(endpoints.bulk_in, &mut buf, timeout) {
                Ok(n) => {
                    buf.truncate(n);
                    pending.data = buf;
                    pending.stage = Stage::Status;
                }
                Err(rusb::Error::Pipe) => {
                    debug!("Data stage stalled, clearing {:#04x}", endpoints.bulk_in);
                    self.clear(endpoints.bulk_in);
                    if let Some(pending) = self.pending.as_mut() {
                        pending.stage = Stage::Status;
                    }
                }
                Err(rusb::Error::Timeout) => return MscStatus::Busy,
                Err(e) => {
                    warn!("Data stage of {} failed: {}", command, e);
                    return self.finish(phase, MscStatus::PhaseError);
                }
            }
        }

        let mut buf = [0u8; CSW_LEN];
        let n = match io.read_bulk(endpoints.bulk_in, &mut buf, timeout) {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => return MscStatus::Busy,
            Err(rusb::Error::Pipe) => {
                let retried = self.pending.as_ref().is_some_and(|p| p.status_retried);
                if retried {
                    warn!("CSW stalled twice for {}", command);
                    return self.finish(phase, MscStatus::PhaseError);
                }
                self.clear(endpoints.bulk_in);
                if let Some(pending) = self.pending.as_mut() {
                    pending.status_retried = true;
                }
                return MscStatus::Busy;
            }
            Err(e) => {
                warn!("CSW read for {} failed: {}", command, e);
                return self.finish(phase, MscStatus::PhaseError);
            }
        };

        let Some(pending) = self.pending.take() else {
            return self.finish(phase, MscStatus::PhaseError);
        };
        let status = match CommandStatus::parse(&buf[..n]) {
            Some(csw) if csw.tag != pending.tag => {
                warn!("CSW tag {} does not match CBW tag {}", csw.tag, pending.tag);
                MscStatus::PhaseError
            }
            Some(csw) => match csw.status {
                CSW_STATUS_PASSED => {
                    trace!("{} passed, residue {}", command, csw.residue);
                    self.record(command, &pending.data);
                    MscStatus::Ok
                }
                CSW_STATUS_FAILED => MscStatus::Fail,
                CSW_STATUS_PHASE_ERROR => MscStatus::PhaseError,
                other => {
                    warn!("Reserved CSW status {:#04x}", other);
                    MscStatus::PhaseError
                }
            },
            None => {
                warn!("Invalid CSW ({} bytes) for {}", n, command);
                MscStatus::PhaseError
            }
        };
        trace!("CSW {} tag={} -> {:?}", command, pending.tag, status);
        self.finish(phase, status)
    }

    fn finish(&mut self, phase: &mut CommandPhase, status: MscStatus) -> MscStatus {
        self.pending = None;
        *phase = CommandPhase::Send;
        status
    }

    fn clear(&self, endpoint: u8) {
        if let Err(e) = self.io.clear_halt(endpoint) {
            warn!("Failed to clear halt on {:#04x}: {}", endpoint, e);
        }
    }

    fn record(&mut self, command: ScsiCommand, data: &[u8]) {
        match command {
            ScsiCommand::ReadCapacity10 => {
                self.capacity = Capacity::parse(data);
                if let Some(cap) = self.capacity {
                    info!(
                        "Capacity: {} blocks of {} bytes ({} bytes)",
                        u64::from(cap.last_lba) + 1,
                        cap.block_size,
                        cap.total_bytes()
                    );
                }
            }
            ScsiCommand::ModeSense6 => {
                self.write_protected = parse_write_protect(data);
                debug!("Write protected: {:?}", self.write_protected);
            }
            ScsiCommand::RequestSense => {
                self.sense = SenseData::parse(data);
                if let Some(sense) = self.sense {
                    debug!(
                        "Sense key={:#04x} asc={:#04x} ascq={:#04x}",
                        sense.key, sense.asc, sense.ascq
                    );
                }
            }
            ScsiCommand::TestUnitReady => {}
        }
    }
}

impl<IO: UsbIo> ScsiProber for BotProber<IO> {
    fn init(&mut self, binding: &EndpointBinding) {
        self.endpoints = Some(Endpoints {
            bulk_in: binding.in_address,
            bulk_out: binding.out_address,
        });
        self.pending = None;
        self.capacity = None;
        self.sense = None;
        self.write_protected = None;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::io::fake::FakeIo;
    use protocol::{ChannelHandle, Personality};

    fn binding() -> EndpointBinding {
        EndpointBinding {
            interface_number: 0,
            personality: Personality::MassStorageBot,
            in_address: 0x81,
            in_max_packet: 512,
            in_channel: ChannelHandle(1),
            out_address: 0x01,
            out_max_packet: 512,
            out_channel: ChannelHandle(0),
        }
    }

    fn prober() -> BotProber<FakeIo> {
        let mut prober = BotProber::new(Arc::new(FakeIo::default()), Duration::from_millis(10));
        prober.init(&binding());
        prober
    }

    fn csw(tag: u32, residue: u32, status: u8) -> Vec<u8> {
        let mut buf = vec![0u8; CSW_LEN];
        LittleEndian::write_u32(&mut buf[0..4], CSW_SIGNATURE);
        LittleEndian::write_u32(&mut buf[4..8], tag);
        LittleEndian::write_u32(&mut buf[8..12], residue);
        buf[12] = status;
        buf
    }

    #[test]
    fn test_cbw_layout() {
        let block = CommandBlock {
            tag: 0x0102_0304,
            data_len: 8,
            data_in: true,
            lun: 0,
            cdb: cdb::read_capacity10().to_vec(),
        };
        let bytes = block.to_bytes();
        assert_eq!(&bytes[0..4], b"USBC");
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &[8, 0, 0, 0]);
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[14], 10);
        assert_eq!(bytes[15], cdb::READ_CAPACITY_10);
        assert!(bytes[25..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_csw_parse() {
        let parsed = CommandStatus::parse(&csw(7, 2, CSW_STATUS_FAILED)).unwrap();
        assert_eq!(parsed.tag, 7);
        assert_eq!(parsed.residue, 2);
        assert_eq!(parsed.status, CSW_STATUS_FAILED);

        let mut bad = csw(7, 0, 0);
        bad[3] = b'C';
        assert!(CommandStatus::parse(&bad).is_none());
        assert!(CommandStatus::parse(&csw(7, 0, 0)[..12]).is_none());
    }

    #[test]
    fn test_capacity_and_sense_parse() {
        let cap = Capacity::parse(&[0, 0, 0x0F, 0xFF, 0, 0, 0x02, 0x00]).unwrap();
        assert_eq!(cap.last_lba, 4095);
        assert_eq!(cap.block_size, 512);
        assert_eq!(cap.total_bytes(), 4096 * 512);
        assert!(Capacity::parse(&[0; 4]).is_none());

        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = 0x02;
        sense[12] = 0x3A;
        assert_eq!(
            SenseData::parse(&sense),
            Some(SenseData {
                key: 0x02,
                asc: 0x3A,
                ascq: 0
            })
        );
        sense[0] = 0x72;
        assert!(SenseData::parse(&sense).is_none());

        assert_eq!(parse_write_protect(&[3, 0, 0x80, 0]), Some(true));
        assert_eq!(parse_write_protect(&[3, 0, 0x00, 0]), Some(false));
    }

    #[test]
    fn test_test_unit_ready_two_phases() {
        let mut prober = prober();
        let mut phase = CommandPhase::Send;

        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::Busy);
        assert_eq!(phase, CommandPhase::Wait);
        {
            let written = prober.io.written.borrow();
            assert_eq!(written.len(), 1);
            assert_eq!(written[0].0, 0x01);
            assert_eq!(written[0].1[12], 0);
            assert_eq!(written[0].1[15], cdb::TEST_UNIT_READY);
        }

        // No status yet
        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::Busy);
        assert_eq!(phase, CommandPhase::Wait);

        prober.io.push_read(&csw(1, 0, CSW_STATUS_PASSED));
        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::Ok);
        assert_eq!(phase, CommandPhase::Send);
        assert_eq!(prober.io.read_lengths.borrow().as_slice(), &[CSW_LEN, CSW_LEN]);
    }

    #[test]
    fn test_read_capacity_records_result() {
        let mut prober = prober();
        let mut phase = CommandPhase::Send;
        prober.read_capacity10(&mut phase);

        prober.io.push_read(&[0, 0, 0x1F, 0xFF, 0, 0, 0x02, 0x00]);
        prober.io.push_read(&csw(1, 0, CSW_STATUS_PASSED));
        assert_eq!(prober.read_capacity10(&mut phase), MscStatus::Ok);
        assert_eq!(
            prober.capacity(),
            Some(Capacity {
                last_lba: 0x1FFF,
                block_size: 512
            })
        );
    }

    #[test]
    fn test_failed_status_and_sense() {
        let mut prober = prober();
        let mut phase = CommandPhase::Send;
        prober.test_unit_ready(&mut phase);
        prober.io.push_read(&csw(1, 0, CSW_STATUS_FAILED));
        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::Fail);

        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = 0x06;
        sense[12] = 0x28;
        prober.request_sense(&mut phase);
        prober.io.push_read(&sense);
        prober.io.push_read(&csw(2, 0, CSW_STATUS_PASSED));
        assert_eq!(prober.request_sense(&mut phase), MscStatus::Ok);
        assert_eq!(prober.last_sense().map(|s| s.key), Some(0x06));
        assert_eq!(prober.last_sense().map(|s| s.asc), Some(0x28));
    }

    #[test]
    fn test_tag_mismatch_is_phase_error() {
        let mut prober = prober();
        let mut phase = CommandPhase::Send;
        prober.test_unit_ready(&mut phase);
        prober.io.push_read(&csw(99, 0, CSW_STATUS_PASSED));
        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::PhaseError);
        assert_eq!(phase, CommandPhase::Send);
    }

    #[test]
    fn test_csw_phase_error_status() {
        let mut prober = prober();
        let mut phase = CommandPhase::Send;
        prober.test_unit_ready(&mut phase);
        prober.io.push_read(&csw(1, 0, CSW_STATUS_PHASE_ERROR));
        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::PhaseError);
    }

    #[test]
    fn test_data_stall_is_cleared_before_status() {
        let mut prober = prober();
        let mut phase = CommandPhase::Send;
        prober.mode_sense6(&mut phase);

        prober.io.push_read_error(rusb::Error::Pipe);
        prober.io.push_read(&csw(1, 0xC0, CSW_STATUS_FAILED));
        assert_eq!(prober.mode_sense6(&mut phase), MscStatus::Fail);
        assert_eq!(prober.io.cleared.borrow().as_slice(), &[0x81]);
        assert_eq!(prober.write_protected(), None);
    }

    #[test]
    fn test_status_stall_retried_once() {
        let mut prober = prober();
        let mut phase = CommandPhase::Send;
        prober.test_unit_ready(&mut phase);

        prober.io.push_read_error(rusb::Error::Pipe);
        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::Busy);
        prober.io.push_read_error(rusb::Error::Pipe);
        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::PhaseError);
        assert_eq!(prober.io.cleared.borrow().len(), 1);
    }

    #[test]
    fn test_cbw_stall_fails_command() {
        let mut prober = prober();
        let mut phase = CommandPhase::Send;
        prober.io.fail_next_write(rusb::Error::Pipe);

        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::Fail);
        assert_eq!(phase, CommandPhase::Send);
        assert_eq!(prober.io.cleared.borrow().as_slice(), &[0x01]);
    }

    #[test]
    fn test_tags_increase_per_command() {
        let mut prober = prober();
        let mut phase = CommandPhase::Send;
        prober.test_unit_ready(&mut phase);
        prober.io.push_read(&csw(1, 0, CSW_STATUS_PASSED));
        prober.test_unit_ready(&mut phase);
        prober.test_unit_ready(&mut phase);

        let written = prober.io.written.borrow();
        assert_eq!(LittleEndian::read_u32(&written[0].1[4..8]), 1);
        assert_eq!(LittleEndian::read_u32(&written[1].1[4..8]), 2);
    }

    #[test]
    fn test_unbound_prober_reports_phase_error() {
        let mut prober = BotProber::new(Arc::new(FakeIo::default()), Duration::from_millis(10));
        let mut phase = CommandPhase::Send;
        assert_eq!(prober.test_unit_ready(&mut phase), MscStatus::PhaseError);
        assert!(prober.io.written.borrow().is_empty());
    }
}
