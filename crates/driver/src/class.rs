//! Per-device class driver context
//!
//! [`ClassDriver`] owns everything one attached device needs: its collaborators,
//! the endpoint binding, the state machine and the fixed buffers. There is no
//! shared state between instances, so several devices can be driven side by side.

use std::time::Instant;

use protocol::{
    ControlStatus, DeviceInfo, InterfaceDescriptor, SetupPacket, TickStatus, UrbState, setup,
};
use tracing::{debug, info, warn};

use crate::application::Application;
use crate::binding::EndpointBinding;
use crate::buffers::{ReceiveBuffer, TextBuffer, receive_length};
use crate::config::DriverConfig;
use crate::engine::TransferEngine;
use crate::error::Result;
use crate::machine::{ControlRequest, Effect, Event, Machine, Request, State, transition};
use crate::mode_switch::{ModeSwitchInitiator, ModeSwitchProgress};
use crate::scsi::ScsiProber;
use crate::selector::select_interface;

/// Endpoint address of the default control pipe
const CONTROL_ENDPOINT: u8 = 0x00;

pub struct ClassDriver<E, S, A> {
    engine: E,
    scsi: S,
    app: A,
    config: DriverConfig,
    device: Option<DeviceInfo>,
    binding: Option<EndpointBinding>,
    machine: Machine,
    initiator: Option<ModeSwitchInitiator>,
    rx: ReceiveBuffer,
    text: TextBuffer,
}

impl<E, S, A> ClassDriver<E, S, A>
where
    E: TransferEngine,
    S: ScsiProber,
    A: Application,
{
    pub fn new(engine: E, scsi: S, app: A, config: DriverConfig) -> Self {
        let initiator = config.mode_switch.clone().map(ModeSwitchInitiator::new);
        let machine = Machine::new(Default::default(), config.machine_options());
        Self {
            engine,
            scsi,
            app,
            config,
            device: None,
            binding: None,
            machine,
            initiator,
            rx: ReceiveBuffer::new(),
            text: TextBuffer::new(),
        }
    }

    /// Bind to the first supported interface of `device`
    ///
    /// Rebinding an already bound driver releases the previous binding first.
    pub fn interface_init(
        &mut self,
        device: DeviceInfo,
        interfaces: &[InterfaceDescriptor],
    ) -> Result<EndpointBinding> {
        if self.binding.is_some() {
            self.interface_deinit();
        }

        let selection = match select_interface(interfaces, &self.config.signatures) {
            Ok(selection) => selection,
            Err(e) => {
                warn!("Device {} not supported: {}", device.identity, e);
                self.app.device_not_supported();
                return Err(e);
            }
        };

        let binding = EndpointBinding::open(&mut self.engine, &device, &selection)?;

        info!(
            "Device {} bound as {:?} on interface {}",
            device.identity, binding.personality, binding.interface_number
        );

        self.device = Some(device);
        self.binding = Some(binding);
        self.machine = Machine::new(binding.personality, self.config.machine_options());
        if let Some(initiator) = &mut self.initiator {
            initiator.reset();
        }
        self.text.clear();

        Ok(binding)
    }

    /// Release the binding and return to `Init`; a no-op when unbound
    pub fn interface_deinit(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.release(&mut self.engine);
            debug!("Interface {} de-initialized", binding.interface_number);
        }
        self.device = None;
        self.reset_state();
    }

    /// Class-specific setup: restart the sequence from `Init`
    pub fn class_request(&mut self) -> ControlStatus {
        self.reset_state();
        ControlStatus::Ok
    }

    /// The device went away
    pub fn on_disconnect(&mut self) {
        info!("Device disconnected");
        self.interface_deinit();
    }

    fn reset_state(&mut self) {
        self.machine.reset();
        if let Some(initiator) = &mut self.initiator {
            initiator.reset();
        }
        self.text.clear();
    }

    /// Advance the machine by one step
    pub fn tick(&mut self, now: Instant) -> TickStatus {
        if !self.engine.is_device_connected() {
            return TickStatus::Busy;
        }
        let Some(binding) = self.binding else {
            return TickStatus::Busy;
        };

        let before = self.machine.state();
        let event = self.execute(self.machine.request(), &binding, now);
        let step = transition(&self.machine, event);
        self.machine = step.next;

        let after = self.machine.state();
        if after != before {
            debug!("{:?} -> {:?}", before, after);
            if after == State::ApplicationReady {
                info!("Device ready");
            }
        }

        self.apply_effect(step.effect, &binding);

        if step.status == TickStatus::ApplyDeinit {
            info!("Application requested de-initialization");
            self.interface_deinit();
        }
        step.status
    }

    fn execute(&mut self, request: Request, binding: &EndpointBinding, now: Instant) -> Event {
        match request {
            Request::Initialize => {
                self.scsi.init(binding);
                let mode_switch = match (&self.initiator, &self.device) {
                    (Some(initiator), Some(device)) => initiator.applies_to(device.identity),
                    _ => false,
                };
                Event::Initialized { mode_switch }
            }
            Request::ModeSwitch => {
                let progress = match &mut self.initiator {
                    Some(initiator) => {
                        match initiator.poll(&mut self.engine, binding.out_channel, now) {
                            Ok(progress) => progress,
                            Err(e) => {
                                warn!("Mode switch abandoned: {}", e);
                                ModeSwitchProgress::Complete
                            }
                        }
                    }
                    None => ModeSwitchProgress::Complete,
                };
                Event::ModeSwitch(progress)
            }
            Request::Control(request) => self.control(request, binding),
            Request::Probe(command) => {
                let mut phase = self.machine.phase();
                let status = self.scsi.execute(command, &mut phase);
                Event::Probe { status, phase }
            }
            Request::Application => Event::Application(self.app.user_application()),
            Request::SendCommand => Event::Submitted(
                self.engine
                    .submit_bulk_send(binding.out_channel, &self.config.serial.command),
            ),
            Request::PollSend => {
                let state = self.engine.poll_transfer_state(binding.out_channel);
                if state == UrbState::Done {
                    debug!(
                        "Sent {} bytes",
                        self.engine.transferred_length(binding.out_channel)
                    );
                }
                Event::Outbound(state)
            }
            Request::ArmReceive => {
                let length = receive_length(binding.in_max_packet);
                Event::Submitted(self.engine.submit_bulk_receive(binding.in_channel, length))
            }
            Request::PollReceive => {
                let state = self.engine.poll_transfer_state(binding.in_channel);
                let len = match state {
                    UrbState::Done => self.engine.transferred_length(binding.in_channel),
                    _ => 0,
                };
                Event::Inbound { state, len }
            }
            Request::None => Event::Idle,
        }
    }

    fn control(&mut self, request: ControlRequest, binding: &EndpointBinding) -> Event {
        let packet: SetupPacket = match request {
            ControlRequest::BotReset => setup::bot_reset(binding.interface_number),
            ControlRequest::GetMaxLun => setup::get_max_lun(binding.interface_number),
            ControlRequest::ClearFeature => setup::clear_endpoint_halt(CONTROL_ENDPOINT),
            ControlRequest::VendorSerialReset => setup::vendor_serial_reset(),
        };

        let status = match self.rx.window(usize::from(packet.length)) {
            Ok(window) => self.engine.submit_control_request(&packet, window),
            Err(e) => {
                warn!("{:?}: {}", request, e);
                ControlStatus::Fail
            }
        };
        Event::Control {
            status,
            value: self.rx.first(),
        }
    }

    fn apply_effect(&mut self, effect: Effect, binding: &EndpointBinding) {
        match effect {
            Effect::None => {}
            Effect::DeviceNotSupported => {
                warn!(
                    "Device reports max LUN {}, only single-unit devices are supported",
                    self.machine.max_lun()
                );
                self.app.device_not_supported();
            }
            Effect::Response { len } => {
                let engine = &mut self.engine;
                let channel = binding.in_channel;
                if let Err(e) = self
                    .text
                    .load(len, |buf| engine.read_received(channel, buf))
                {
                    warn!("Serial response truncated: {}", e);
                }
                let text = self.text.as_text();
                info!("Received {} bytes: {}", self.text.len(), text.trim_end());
                self.app.serial_response(&text);
            }
        }
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn error_count(&self) -> u8 {
        self.machine.error_count()
    }

    pub fn binding(&self) -> Option<&EndpointBinding> {
        self.binding.as_ref()
    }

    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn scsi(&self) -> &S {
        &self.scsi
    }

    pub fn scsi_mut(&mut self) -> &mut S {
        &mut self.scsi
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// Last serial response, if any
    pub fn last_response(&self) -> &[u8] {
        self.text.as_bytes()
    }
}
