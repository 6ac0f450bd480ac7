//! Class driver state machine
//!
//! The machine is plain data. [`Machine::request`] says what the current state
//! needs done by the collaborators, and [`transition`] folds the observed outcome
//! back into a new machine plus an optional effect for the application. Neither
//! touches the transfer engine, so every path can be driven from a unit test.
//!
//! Mass storage:
//!
//! ```text
//! Init -> [ModeSwitch] -> BotReset -> GetMaxLun -> TestUnitReady -> ReadCapacity
//!      -> ModeSense -> ApplicationReady
//! ```
//!
//! with `CtrlErrorRecovery` after a stalled control request, `RequestSense` after a
//! failed probe and `UnrecoveredError` once recovery is exhausted.
//!
//! Vendor serial:
//!
//! ```text
//! Init -> [ModeSwitch] -> CdcInit -> SendCommand -> WaitSendComplete
//!      -> ReceiveResponse (loop) | Poll -> Finish
//! ```

use protocol::{
    AppStatus, CommandPhase, ControlStatus, MscStatus, Personality, SubmitStatus, TickStatus,
    UrbState,
};
use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::mode_switch::ModeSwitchProgress;
use crate::recovery::{self, DEFAULT_RETRY_LIMIT, ErrorCounter, Recovery};
use crate::scsi::ScsiCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Init,
    ModeSwitch,
    BotReset,
    GetMaxLun,
    CtrlErrorRecovery,
    TestUnitReady,
    ReadCapacity,
    ModeSense,
    RequestSense,
    ApplicationReady,
    UnrecoveredError,
    CdcInit,
    SendCommand,
    WaitSendComplete,
    ReceiveResponse,
    Poll,
    Finish,
}

impl State {
    /// States the machine never leaves on its own
    pub fn is_terminal(self) -> bool {
        matches!(self, State::UnrecoveredError | State::Finish)
    }
}

/// How the vendor serial handshake ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialMode {
    /// Keep re-arming receives forever
    #[default]
    Continuous,
    /// After the first response, read while data keeps arriving, then finish
    Drain,
}

/// Control requests the machine issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    BotReset,
    GetMaxLun,
    /// Clear halt on the default control endpoint
    ClearFeature,
    VendorSerialReset,
}

/// Work the current state needs from the collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Prepare the SCSI layer and decide whether a mode switch applies
    Initialize,
    ModeSwitch,
    Control(ControlRequest),
    Probe(ScsiCommand),
    Application,
    SendCommand,
    PollSend,
    ArmReceive,
    PollReceive,
    None,
}

/// Outcome of executing a [`Request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Initialized { mode_switch: bool },
    ModeSwitch(ModeSwitchProgress),
    /// `value` is the first byte of the data stage, if any
    Control { status: ControlStatus, value: u8 },
    Probe { status: MscStatus, phase: CommandPhase },
    Application(u8),
    Submitted(SubmitStatus),
    Outbound(UrbState),
    Inbound { state: UrbState, len: usize },
    /// Nothing was executed
    Idle,
}

/// Follow-up the driver performs after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    DeviceNotSupported,
    /// `len` bytes arrived on the serial IN endpoint
    Response { len: usize },
}

/// Per-binding behaviour knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineOptions {
    pub retry_limit: u8,
    pub serial_mode: SerialMode,
    pub vendor_reset: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            serial_mode: SerialMode::Continuous,
            vendor_reset: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    state: State,
    resume: Option<State>,
    phase: CommandPhase,
    errors: ErrorCounter,
    personality: Personality,
    max_lun: u8,
    lun_reported: bool,
    rx_armed: bool,
    options: MachineOptions,
}

impl Machine {
    pub fn new(personality: Personality, options: MachineOptions) -> Self {
        Self {
            state: State::Init,
            resume: None,
            phase: CommandPhase::Send,
            errors: ErrorCounter::new(options.retry_limit),
            personality,
            max_lun: 0,
            lun_reported: false,
            rx_armed: false,
            options,
        }
    }

    /// Back to `Init` with no retries, no resume target and nothing armed
    pub fn reset(&mut self) {
        *self = Self::new(self.personality, self.options);
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn resume_target(&self) -> Option<State> {
        self.resume
    }

    pub fn phase(&self) -> CommandPhase {
        self.phase
    }

    pub fn error_count(&self) -> u8 {
        self.errors.count()
    }

    pub fn personality(&self) -> Personality {
        self.personality
    }

    pub fn max_lun(&self) -> u8 {
        self.max_lun
    }

    pub fn options(&self) -> MachineOptions {
        self.options
    }

    /// What the current state needs executed this tick
    pub fn request(&self) -> Request {
        match self.state {
            State::Init => Request::Initialize,
            State::ModeSwitch => Request::ModeSwitch,
            State::BotReset => Request::Control(ControlRequest::BotReset),
            State::GetMaxLun if self.lun_reported => Request::None,
            State::GetMaxLun => Request::Control(ControlRequest::GetMaxLun),
            State::CtrlErrorRecovery => Request::Control(ControlRequest::ClearFeature),
            State::TestUnitReady => Request::Probe(ScsiCommand::TestUnitReady),
            State::ReadCapacity => Request::Probe(ScsiCommand::ReadCapacity10),
            State::ModeSense => Request::Probe(ScsiCommand::ModeSense6),
            State::RequestSense => Request::Probe(ScsiCommand::RequestSense),
            State::ApplicationReady => Request::Application,
            State::CdcInit if self.options.vendor_reset => {
                Request::Control(ControlRequest::VendorSerialReset)
            }
            State::SendCommand => Request::SendCommand,
            State::WaitSendComplete => Request::PollSend,
            State::ReceiveResponse | State::Poll if self.rx_armed => Request::PollReceive,
            State::ReceiveResponse | State::Poll => Request::ArmReceive,
            State::CdcInit | State::UnrecoveredError | State::Finish => Request::None,
        }
    }

    fn enter_branch(&mut self) {
        self.state = match self.personality {
            Personality::MassStorageBot => State::BotReset,
            Personality::VendorSerial => State::CdcInit,
            Personality::Unknown => {
                error!("No personality bound, cannot start class sequence");
                State::UnrecoveredError
            }
        };
    }

    fn recover_control(&mut self, resume: State) {
        self.resume = Some(resume);
        self.state = State::CtrlErrorRecovery;
    }

    fn control_failed(&mut self) -> TickStatus {
        match recovery::classify_control_failure(&mut self.errors) {
            Recovery::Unrecovered => self.unrecovered(),
            _ => {
                warn!(
                    "{:?} request failed ({}/{}), reissuing",
                    self.state,
                    self.errors.count(),
                    self.errors.limit()
                );
                TickStatus::Busy
            }
        }
    }

    fn unrecovered(&mut self) -> TickStatus {
        error!("Unrecovered error in {:?}", self.state);
        self.state = State::UnrecoveredError;
        self.resume = None;
        TickStatus::UnrecoveredError
    }

    fn resume_or(&mut self, fallback: State) -> State {
        self.resume.take().unwrap_or_else(|| {
            warn!("No resume state recorded, continuing at {:?}", fallback);
            fallback
        })
    }

    fn probe_outcome(&mut self, status: MscStatus, phase: CommandPhase) -> TickStatus {
        self.phase = phase;
        match status {
            MscStatus::Ok => {
                self.phase = CommandPhase::Send;
                self.state = match self.state {
                    State::TestUnitReady => State::ReadCapacity,
                    State::ReadCapacity => State::ModeSense,
                    State::ModeSense => State::ApplicationReady,
                    _ => return self.sense_complete(),
                };
                self.errors.reset();
                TickStatus::Ok
            }
            failure => match recovery::classify(failure, &mut self.errors) {
                Recovery::NoChange => TickStatus::Busy,
                Recovery::RequestSense => {
                    warn!(
                        "{:?} failed ({}/{}), requesting sense data",
                        self.state,
                        self.errors.count(),
                        self.errors.limit()
                    );
                    if self.state != State::RequestSense {
                        self.resume = Some(self.state);
                    }
                    self.state = State::RequestSense;
                    self.phase = CommandPhase::Send;
                    TickStatus::Busy
                }
                Recovery::Unrecovered => self.unrecovered(),
            },
        }
    }

    fn sense_complete(&mut self) -> TickStatus {
        self.state = self.resume_or(State::TestUnitReady);
        TickStatus::Ok
    }

    fn apply(&mut self, event: Event, effect: &mut Effect) -> TickStatus {
        match (self.state, event) {
            (State::Init, Event::Initialized { mode_switch }) => {
                if mode_switch {
                    self.state = State::ModeSwitch;
                } else {
                    self.enter_branch();
                }
                TickStatus::Busy
            }

            (State::ModeSwitch, Event::ModeSwitch(ModeSwitchProgress::Complete)) => {
                self.enter_branch();
                TickStatus::Busy
            }

            (State::BotReset, Event::Control { status, .. }) => match status {
                ControlStatus::Ok => {
                    self.errors.reset();
                    self.state = State::GetMaxLun;
                    TickStatus::Ok
                }
                ControlStatus::NotSupported => {
                    self.errors.reset();
                    self.recover_control(State::GetMaxLun);
                    TickStatus::Busy
                }
                ControlStatus::Busy => TickStatus::Busy,
                ControlStatus::Fail => self.control_failed(),
            },

            (State::GetMaxLun, Event::Control { status, value }) => match status {
                ControlStatus::Ok if value > 0 => {
                    self.max_lun = value;
                    self.lun_reported = true;
                    *effect = Effect::DeviceNotSupported;
                    TickStatus::Busy
                }
                ControlStatus::Ok => {
                    self.errors.reset();
                    self.max_lun = 0;
                    self.state = State::TestUnitReady;
                    TickStatus::Ok
                }
                ControlStatus::NotSupported => {
                    self.errors.reset();
                    self.max_lun = 0;
                    self.recover_control(State::TestUnitReady);
                    TickStatus::Busy
                }
                ControlStatus::Busy => TickStatus::Busy,
                ControlStatus::Fail => self.control_failed(),
            },

            (State::CtrlErrorRecovery, Event::Control { status, .. }) => match status {
                ControlStatus::Ok => {
                    // Stalled max-LUN query means a single unit
                    self.max_lun = 0;
                    self.state = self.resume_or(State::TestUnitReady);
                    TickStatus::Ok
                }
                ControlStatus::Busy => TickStatus::Busy,
                ControlStatus::NotSupported | ControlStatus::Fail => self.unrecovered(),
            },

            (
                State::TestUnitReady | State::ReadCapacity | State::ModeSense | State::RequestSense,
                Event::Probe { status, phase },
            ) => self.probe_outcome(status, phase),

            (State::ApplicationReady, Event::Application(raw)) => match AppStatus::from_raw(raw) {
                Some(AppStatus::Continue) => TickStatus::Busy,
                Some(AppStatus::Deinit) => TickStatus::ApplyDeinit,
                None => {
                    warn!("Reserved application status {}, staying ready", raw);
                    TickStatus::Busy
                }
            },

            (State::UnrecoveredError, _) => TickStatus::UnrecoveredError,

            (State::CdcInit, Event::Control { status, .. }) => match status {
                ControlStatus::Busy => TickStatus::Busy,
                ControlStatus::Ok | ControlStatus::NotSupported => {
                    self.state = State::SendCommand;
                    TickStatus::Ok
                }
                ControlStatus::Fail => {
                    warn!("Vendor serial reset failed, sending command anyway");
                    self.state = State::SendCommand;
                    TickStatus::Busy
                }
            },
            (State::CdcInit, Event::Idle) => {
                self.state = State::SendCommand;
                TickStatus::Busy
            }

            (State::SendCommand, Event::Submitted(SubmitStatus::Ok)) => {
                self.state = State::WaitSendComplete;
                TickStatus::Ok
            }

            (State::WaitSendComplete, Event::Outbound(state)) => match state {
                UrbState::Done => {
                    self.state = State::ReceiveResponse;
                    self.rx_armed = false;
                    TickStatus::Ok
                }
                UrbState::Error | UrbState::Stall => {
                    warn!("Serial command transfer ended in {:?}, resending", state);
                    self.state = State::SendCommand;
                    TickStatus::Busy
                }
                UrbState::Idle | UrbState::NotReady | UrbState::Nyet => TickStatus::Busy,
            },

            (State::ReceiveResponse | State::Poll, Event::Submitted(status)) => {
                self.rx_armed = status == SubmitStatus::Ok;
                TickStatus::Busy
            }

            (State::ReceiveResponse, Event::Inbound { state, len }) => match state {
                UrbState::Done => {
                    self.rx_armed = false;
                    if len > 0 {
                        *effect = Effect::Response { len };
                    }
                    if self.options.serial_mode == SerialMode::Drain {
                        self.state = State::Poll;
                    }
                    TickStatus::Ok
                }
                UrbState::Error | UrbState::Stall => {
                    warn!("Serial receive ended in {:?}, re-arming", state);
                    self.rx_armed = false;
                    TickStatus::Busy
                }
                UrbState::Idle | UrbState::NotReady | UrbState::Nyet => TickStatus::Busy,
            },

            (State::Poll, Event::Inbound { state, len }) => {
                self.rx_armed = false;
                if state == UrbState::Done {
                    if len > 0 {
                        *effect = Effect::Response { len };
                    }
                } else {
                    self.state = State::Finish;
                }
                TickStatus::Ok
            }

            (State::Finish, _) => TickStatus::Ok,

            (state, event) => {
                trace!("{:?}: no transition for {:?}", state, event);
                TickStatus::Busy
            }
        }
    }
}

/// Result of one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub next: Machine,
    pub effect: Effect,
    pub status: TickStatus,
}

/// Fold `event` into `machine`
pub fn transition(machine: &Machine, event: Event) -> Step {
    let mut next = *machine;
    let mut effect = Effect::None;
    let status = next.apply(event, &mut effect);
    Step {
        next,
        effect,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> Machine {
        Machine::new(Personality::MassStorageBot, MachineOptions::default())
    }

    fn serial(mode: SerialMode, vendor_reset: bool) -> Machine {
        Machine::new(
            Personality::VendorSerial,
            MachineOptions {
                serial_mode: mode,
                vendor_reset,
                ..MachineOptions::default()
            },
        )
    }

    fn step(machine: &mut Machine, event: Event) -> Step {
        let step = transition(machine, event);
        *machine = step.next;
        step
    }

    fn control(status: ControlStatus) -> Event {
        Event::Control { status, value: 0 }
    }

    fn probe(status: MscStatus) -> Event {
        Event::Probe {
            status,
            phase: CommandPhase::Wait,
        }
    }

    fn at(state: State) -> Machine {
        let mut machine = storage();
        machine.state = state;
        machine
    }

    #[test]
    fn test_happy_storage_sequence() {
        let mut m = storage();
        let mut visited = vec![m.state()];

        let events = [
            Event::Initialized { mode_switch: false },
            control(ControlStatus::Ok),
            control(ControlStatus::Ok),
            probe(MscStatus::Ok),
            probe(MscStatus::Ok),
            probe(MscStatus::Ok),
        ];
        for event in events {
            step(&mut m, event);
            visited.push(m.state());
        }

        assert_eq!(
            visited,
            vec![
                State::Init,
                State::BotReset,
                State::GetMaxLun,
                State::TestUnitReady,
                State::ReadCapacity,
                State::ModeSense,
                State::ApplicationReady,
            ]
        );
        assert_eq!(m.error_count(), 0);
        assert_eq!(m.request(), Request::Application);
    }

    #[test]
    fn test_requests_follow_state() {
        assert_eq!(storage().request(), Request::Initialize);
        assert_eq!(
            at(State::BotReset).request(),
            Request::Control(ControlRequest::BotReset)
        );
        assert_eq!(
            at(State::CtrlErrorRecovery).request(),
            Request::Control(ControlRequest::ClearFeature)
        );
        assert_eq!(
            at(State::ReadCapacity).request(),
            Request::Probe(ScsiCommand::ReadCapacity10)
        );
        assert_eq!(at(State::UnrecoveredError).request(), Request::None);
    }

    #[test]
    fn test_mode_switch_precedes_branch() {
        let mut m = storage();
        step(&mut m, Event::Initialized { mode_switch: true });
        assert_eq!(m.state(), State::ModeSwitch);
        assert_eq!(m.request(), Request::ModeSwitch);

        step(&mut m, Event::ModeSwitch(ModeSwitchProgress::Pending));
        assert_eq!(m.state(), State::ModeSwitch);

        step(&mut m, Event::ModeSwitch(ModeSwitchProgress::Complete));
        assert_eq!(m.state(), State::BotReset);
    }

    #[test]
    fn test_bot_reset_stall_resumes_at_max_lun() {
        let mut m = at(State::BotReset);
        step(&mut m, control(ControlStatus::NotSupported));
        assert_eq!(m.state(), State::CtrlErrorRecovery);
        assert_eq!(m.resume_target(), Some(State::GetMaxLun));

        step(&mut m, control(ControlStatus::Busy));
        assert_eq!(m.state(), State::CtrlErrorRecovery);

        step(&mut m, control(ControlStatus::Ok));
        assert_eq!(m.state(), State::GetMaxLun);
        assert_eq!(m.resume_target(), None);
    }

    #[test]
    fn test_max_lun_stall_defaults_to_single_unit() {
        let mut m = at(State::GetMaxLun);
        step(&mut m, control(ControlStatus::NotSupported));
        step(&mut m, control(ControlStatus::Ok));
        assert_eq!(m.state(), State::TestUnitReady);
        assert_eq!(m.max_lun(), 0);
    }

    #[test]
    fn test_multiple_luns_reported_once() {
        let mut m = at(State::GetMaxLun);
        let first = step(
            &mut m,
            Event::Control {
                status: ControlStatus::Ok,
                value: 2,
            },
        );
        assert_eq!(first.effect, Effect::DeviceNotSupported);
        assert_eq!(m.state(), State::GetMaxLun);
        assert_eq!(m.request(), Request::None);

        let again = step(&mut m, Event::Idle);
        assert_eq!(again.effect, Effect::None);
        assert_eq!(again.status, TickStatus::Busy);
        assert_eq!(m.state(), State::GetMaxLun);
    }

    #[test]
    fn test_probe_failure_requests_sense_and_resumes() {
        let mut m = at(State::ReadCapacity);
        step(&mut m, probe(MscStatus::Fail));
        assert_eq!(m.state(), State::RequestSense);
        assert_eq!(m.resume_target(), Some(State::ReadCapacity));
        assert_eq!(m.phase(), CommandPhase::Send);
        assert_eq!(m.error_count(), 1);

        step(&mut m, probe(MscStatus::Ok));
        assert_eq!(m.state(), State::ReadCapacity);
        // Sense success is not a normal-sequence success
        assert_eq!(m.error_count(), 1);

        step(&mut m, probe(MscStatus::Ok));
        assert_eq!(m.state(), State::ModeSense);
        assert_eq!(m.error_count(), 0);
    }

    #[test]
    fn test_failed_sense_keeps_pending_resume_target() {
        let mut m = at(State::TestUnitReady);
        step(&mut m, probe(MscStatus::Fail));
        step(&mut m, probe(MscStatus::Fail));
        assert_eq!(m.state(), State::RequestSense);
        assert_eq!(m.resume_target(), Some(State::TestUnitReady));
        assert_eq!(m.error_count(), 2);
    }

    #[test]
    fn test_retry_limit_escalates_and_sticks() {
        let mut m = at(State::ModeSense);
        for _ in 0..DEFAULT_RETRY_LIMIT - 1 {
            step(&mut m, probe(MscStatus::Fail));
            assert_eq!(m.state(), State::RequestSense);
            step(&mut m, probe(MscStatus::Ok));
            assert_eq!(m.state(), State::ModeSense);
        }
        let last = step(&mut m, probe(MscStatus::Fail));
        assert_eq!(last.status, TickStatus::UnrecoveredError);
        assert_eq!(m.state(), State::UnrecoveredError);

        for event in [Event::Idle, probe(MscStatus::Ok), control(ControlStatus::Ok)] {
            assert_eq!(step(&mut m, event).status, TickStatus::UnrecoveredError);
        }
    }

    #[test]
    fn test_phase_error_at_any_count() {
        for failures in 0..DEFAULT_RETRY_LIMIT {
            let mut m = at(State::TestUnitReady);
            for _ in 0..failures {
                step(&mut m, probe(MscStatus::Fail));
                step(&mut m, probe(MscStatus::Ok));
            }
            let result = step(&mut m, probe(MscStatus::PhaseError));
            assert_eq!(result.status, TickStatus::UnrecoveredError);
            assert_eq!(m.state(), State::UnrecoveredError);
        }
    }

    #[test]
    fn test_busy_probe_keeps_phase() {
        let mut m = at(State::TestUnitReady);
        let result = step(&mut m, probe(MscStatus::Busy));
        assert_eq!(result.status, TickStatus::Busy);
        assert_eq!(m.state(), State::TestUnitReady);
        assert_eq!(m.phase(), CommandPhase::Wait);
    }

    #[test]
    fn test_control_fail_is_reissued_until_limit() {
        let mut m = at(State::BotReset);
        for attempt in 1..DEFAULT_RETRY_LIMIT {
            assert_eq!(step(&mut m, control(ControlStatus::Fail)).status, TickStatus::Busy);
            assert_eq!(m.state(), State::BotReset);
            assert_eq!(m.error_count(), attempt);
        }
        step(&mut m, control(ControlStatus::Fail));
        assert_eq!(m.state(), State::UnrecoveredError);
    }

    #[test]
    fn test_control_success_clears_failures() {
        let mut m = at(State::GetMaxLun);
        step(&mut m, control(ControlStatus::Fail));
        step(&mut m, control(ControlStatus::Fail));
        assert_eq!(m.state(), State::GetMaxLun);
        assert_eq!(m.request(), Request::Control(ControlRequest::GetMaxLun));

        step(&mut m, control(ControlStatus::Ok));
        assert_eq!(m.state(), State::TestUnitReady);
        assert_eq!(m.error_count(), 0);
    }

    #[test]
    fn test_application_status() {
        let mut m = at(State::ApplicationReady);
        assert_eq!(step(&mut m, Event::Application(0)).status, TickStatus::Busy);
        assert_eq!(step(&mut m, Event::Application(7)).status, TickStatus::Busy);
        assert_eq!(m.state(), State::ApplicationReady);
        assert_eq!(
            step(&mut m, Event::Application(1)).status,
            TickStatus::ApplyDeinit
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut m = at(State::ReadCapacity);
        step(&mut m, probe(MscStatus::Fail));
        m.reset();
        assert_eq!(m.state(), State::Init);
        assert_eq!(m.error_count(), 0);
        assert_eq!(m.resume_target(), None);
        assert_eq!(m.personality(), Personality::MassStorageBot);
    }

    #[test]
    fn test_serial_handshake_continuous() {
        let mut m = serial(SerialMode::Continuous, false);
        step(&mut m, Event::Initialized { mode_switch: false });
        assert_eq!(m.state(), State::CdcInit);
        assert_eq!(m.request(), Request::None);

        step(&mut m, Event::Idle);
        assert_eq!(m.request(), Request::SendCommand);
        step(&mut m, Event::Submitted(SubmitStatus::Busy));
        assert_eq!(m.state(), State::SendCommand);
        step(&mut m, Event::Submitted(SubmitStatus::Ok));
        assert_eq!(m.request(), Request::PollSend);
        step(&mut m, Event::Outbound(UrbState::Done));
        assert_eq!(m.state(), State::ReceiveResponse);

        assert_eq!(m.request(), Request::ArmReceive);
        step(&mut m, Event::Submitted(SubmitStatus::Ok));
        assert_eq!(m.request(), Request::PollReceive);

        let response = step(
            &mut m,
            Event::Inbound {
                state: UrbState::Done,
                len: 12,
            },
        );
        assert_eq!(response.effect, Effect::Response { len: 12 });
        assert_eq!(m.state(), State::ReceiveResponse);
        assert_eq!(m.request(), Request::ArmReceive);
    }

    #[test]
    fn test_empty_receive_emits_nothing() {
        let mut m = serial(SerialMode::Continuous, false);
        m.state = State::ReceiveResponse;
        m.rx_armed = true;
        let result = step(
            &mut m,
            Event::Inbound {
                state: UrbState::Done,
                len: 0,
            },
        );
        assert_eq!(result.effect, Effect::None);
    }

    #[test]
    fn test_serial_drain_finishes_when_quiet() {
        let mut m = serial(SerialMode::Drain, false);
        m.state = State::ReceiveResponse;
        m.rx_armed = true;
        step(
            &mut m,
            Event::Inbound {
                state: UrbState::Done,
                len: 4,
            },
        );
        assert_eq!(m.state(), State::Poll);

        step(&mut m, Event::Submitted(SubmitStatus::Ok));
        let more = step(
            &mut m,
            Event::Inbound {
                state: UrbState::Done,
                len: 3,
            },
        );
        assert_eq!(more.effect, Effect::Response { len: 3 });
        assert_eq!(m.state(), State::Poll);

        step(&mut m, Event::Submitted(SubmitStatus::Ok));
        step(
            &mut m,
            Event::Inbound {
                state: UrbState::Idle,
                len: 0,
            },
        );
        assert_eq!(m.state(), State::Finish);
        assert!(m.state().is_terminal());
        assert_eq!(step(&mut m, Event::Idle).status, TickStatus::Ok);
    }

    #[test]
    fn test_vendor_reset_outcomes_all_proceed() {
        for status in [ControlStatus::Ok, ControlStatus::NotSupported, ControlStatus::Fail] {
            let mut m = serial(SerialMode::Continuous, true);
            m.state = State::CdcInit;
            assert_eq!(
                m.request(),
                Request::Control(ControlRequest::VendorSerialReset)
            );
            step(&mut m, control(status));
            assert_eq!(m.state(), State::SendCommand);
        }
    }

    #[test]
    fn test_unknown_personality_is_unrecoverable() {
        let mut m = Machine::new(Personality::Unknown, MachineOptions::default());
        step(&mut m, Event::Initialized { mode_switch: false });
        assert_eq!(m.state(), State::UnrecoveredError);
    }
}
