//! One-shot mode-switch command
//!
//! Some dongles enumerate as mass storage and only expose their serial function
//! after receiving a vendor command on the bulk OUT endpoint. The initiator sends
//! that command exactly once per binding and then polls for its completion until
//! a deadline passes. It never blocks the tick.

use std::time::{Duration, Instant};

use protocol::{ChannelHandle, DeviceIdentity, SubmitStatus, UrbState};
use tracing::{debug, info};

use crate::engine::TransferEngine;
use crate::error::{Error, Result};

/// Default bound on waiting for the mode-switch transfer
pub const DEFAULT_MODE_SWITCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Target device and payload of the mode switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSwitchConfig {
    pub identity: DeviceIdentity,
    pub payload: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Sent { deadline: Instant, started: Instant },
    Finished,
}

/// Progress of a polled mode switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSwitchProgress {
    Pending,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ModeSwitchInitiator {
    config: ModeSwitchConfig,
    stage: Stage,
}

impl ModeSwitchInitiator {
    pub fn new(config: ModeSwitchConfig) -> Self {
        Self {
            config,
            stage: Stage::Idle,
        }
    }

    pub fn config(&self) -> &ModeSwitchConfig {
        &self.config
    }

    pub fn applies_to(&self, identity: DeviceIdentity) -> bool {
        self.config.identity == identity
    }

    /// Whether the command has already been handed to the engine
    pub fn is_sent(&self) -> bool {
        !matches!(self.stage, Stage::Idle)
    }

    /// Forget any previous attempt; the next poll sends again
    pub fn reset(&mut self) {
        self.stage = Stage::Idle;
    }

    /// Advance the mode switch
    ///
    /// The first call submits the payload. Later calls observe the transfer and
    /// return `Complete` once it is done, or an error once it failed or `now` is
    /// past the deadline. After a final outcome every call returns `Complete`
    /// without touching the engine again.
    pub fn poll<E: TransferEngine>(
        &mut self,
        engine: &mut E,
        channel: ChannelHandle,
        now: Instant,
    ) -> Result<ModeSwitchProgress> {
        match self.stage {
            Stage::Idle => {
                self.stage = Stage::Finished;
                match engine.submit_bulk_send(channel, &self.config.payload) {
                    SubmitStatus::Ok => {
                        info!(
                            "Sent mode switch command to {} ({} bytes)",
                            self.config.identity,
                            self.config.payload.len()
                        );
                        self.stage = Stage::Sent {
                            deadline: now + self.config.timeout,
                            started: now,
                        };
                        Ok(ModeSwitchProgress::Pending)
                    }
                    SubmitStatus::Busy | SubmitStatus::Fail => Err(Error::ModeSwitchRejected),
                }
            }
            Stage::Sent { deadline, started } => match engine.poll_transfer_state(channel) {
                UrbState::Done => {
                    debug!("Mode switch transfer completed");
                    self.stage = Stage::Finished;
                    Ok(ModeSwitchProgress::Complete)
                }
                state @ (UrbState::Error | UrbState::Stall) => {
                    self.stage = Stage::Finished;
                    Err(Error::ModeSwitchFailed(format!("{:?}", state)))
                }
                UrbState::Idle | UrbState::NotReady | UrbState::Nyet => {
                    if now >= deadline {
                        self.stage = Stage::Finished;
                        Err(Error::ModeSwitchTimeout {
                            waited_ms: now.duration_since(started).as_millis() as u64,
                        })
                    } else {
                        Ok(ModeSwitchProgress::Pending)
                    }
                }
            },
            Stage::Finished => Ok(ModeSwitchProgress::Complete),
        }
    }
}
