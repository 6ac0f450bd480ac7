//! SCSI readiness probe seam
//!
//! Command-envelope encoding (CBW/CSW) belongs to the BOT layer behind this trait.
//! Each call is re-entrant in the same way as control requests: the layer advances
//! the [`CommandPhase`] it is handed and reports [`MscStatus::Busy`] until the
//! command has a final outcome.

use protocol::{CommandPhase, MscStatus};

use crate::binding::EndpointBinding;

/// SCSI commands the readiness sequence issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScsiCommand {
    TestUnitReady,
    ReadCapacity10,
    ModeSense6,
    RequestSense,
}

impl std::fmt::Display for ScsiCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScsiCommand::TestUnitReady => "TEST UNIT READY",
            ScsiCommand::ReadCapacity10 => "READ CAPACITY(10)",
            ScsiCommand::ModeSense6 => "MODE SENSE(6)",
            ScsiCommand::RequestSense => "REQUEST SENSE",
        };
        f.write_str(name)
    }
}

/// Bulk-only transport layer issuing the readiness probe commands
pub trait ScsiProber {
    /// Prepare transport state for a freshly bound interface
    fn init(&mut self, binding: &EndpointBinding);

    fn test_unit_ready(&mut self, phase: &mut CommandPhase) -> MscStatus;

    fn read_capacity10(&mut self, phase: &mut CommandPhase) -> MscStatus;

    fn mode_sense6(&mut self, phase: &mut CommandPhase) -> MscStatus;

    fn request_sense(&mut self, phase: &mut CommandPhase) -> MscStatus;

    /// Dispatch by command
    fn execute(&mut self, command: ScsiCommand, phase: &mut CommandPhase) -> MscStatus {
        match command {
            ScsiCommand::TestUnitReady => self.test_unit_ready(phase),
            ScsiCommand::ReadCapacity10 => self.read_capacity10(phase),
            ScsiCommand::ModeSense6 => self.mode_sense6(phase),
            ScsiCommand::RequestSense => self.request_sense(phase),
        }
    }
}
