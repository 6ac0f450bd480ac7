//! Periodic tick loop
//!
//! Drives one [`ClassDriver`] on a tokio interval until it reaches a terminal
//! status, the device goes away, the deadline passes or shutdown is requested.

use std::future::Future;
use std::time::Duration;

use driver::{Application, ClassDriver, ScsiProber, State, TransferEngine};
use protocol::TickStatus;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub tick_interval: Duration,
    /// Overall bound on the run; `None` runs until shutdown
    pub deadline: Option<Duration>,
}

/// Why the tick loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Vendor serial handshake drained the line
    Finished,
    /// The application asked for de-initialization
    Deinit,
    Unrecovered,
    /// Device left the bus, typically re-enumerating after a mode switch
    Disconnected,
    TimedOut,
    Cancelled,
}

pub async fn run<E, S, A, F>(
    driver: &mut ClassDriver<E, S, A>,
    config: RunnerConfig,
    shutdown: F,
) -> RunOutcome
where
    E: TransferEngine,
    S: ScsiProber,
    A: Application,
    F: Future<Output = ()>,
{
    let mut interval = time::interval(config.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let deadline = async {
        match config.deadline {
            Some(limit) => time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    tokio::pin!(shutdown);

    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested after {} ticks", ticks);
                return RunOutcome::Cancelled;
            }
            _ = &mut deadline => {
                warn!("Gave up in state {:?} after {} ticks", driver.state(), ticks);
                return RunOutcome::TimedOut;
            }
            instant = interval.tick() => {
                ticks += 1;
                let status = driver.tick(instant.into_std());

                if !driver.engine().is_device_connected() {
                    info!("Device disconnected");
                    driver.on_disconnect();
                    return RunOutcome::Disconnected;
                }

                match status {
                    TickStatus::UnrecoveredError => {
                        error!("Unrecovered error in state {:?}", driver.state());
                        return RunOutcome::Unrecovered;
                    }
                    TickStatus::ApplyDeinit => {
                        debug!("Class de-initialized by the application");
                        return RunOutcome::Deinit;
                    }
                    TickStatus::Ok if driver.state() == State::Finish => {
                        return RunOutcome::Finished;
                    }
                    _ => {}
                }
            }
        }
    }
}
