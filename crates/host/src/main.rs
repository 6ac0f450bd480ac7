//! usb-modeswitch-host
//!
//! Drives a USB mass-storage device through its Bulk-Only readiness sequence, or
//! switches a modem dongle out of storage emulation and talks to its vendor
//! serial function, using the `driver` state machine on top of libusb.

mod app;
mod config;
mod runner;
mod usb;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use driver::{ClassDriver, InterfaceSignature, SerialMode, setup_logging};
use protocol::DeviceIdentity;
use tokio::signal;
use tracing::{error, info, warn};

use app::ConsoleApplication;
use config::{DeviceFilter, HostConfig};
use runner::{RunOutcome, RunnerConfig};
use usb::{BotProber, OpenDevice, RusbEngine};

#[derive(Parser, Debug)]
#[command(name = "usb-modeswitch-host")]
#[command(
    author,
    version,
    about = "USB host class driver for mass-storage and mode-switch dongles"
)]
#[command(long_about = "
Binds to the first mass-storage (Bulk-Only) or vendor serial interface of a USB
device and walks it to a ready state. Devices listed as mode-switch targets get
their switch command first.

EXAMPLES:
    # Drive the first supported device
    usb-modeswitch-host

    # Drive a specific device
    usb-modeswitch-host --device 0x12d1:0x155b

    # Send the serial command, print the replies and exit once the line is quiet
    usb-modeswitch-host --device 0x12d1:0x1506 --drain

    # List USB devices and the interface each would bind to
    usb-modeswitch-host --list-devices

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-modeswitch-host/host.toml
    3. /etc/usb-modeswitch-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Device to drive, as VID:PID (e.g. 0x0781:0x5581)
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Stop the serial handshake once the device has nothing more to say
    #[arg(long)]
    drain: bool,

    /// De-initialize as soon as the device is ready
    #[arg(long)]
    exit_when_ready: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.host.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usb-modeswitch-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.drain {
        config.serial.mode = SerialMode::Drain;
    }
    if let Some(device) = &args.device {
        config.device.filter = Some(device.clone());
    }

    let driver_config = config.driver_config()?;
    let context = rusb::Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&context, &driver_config.signatures);
    }

    let filter = config.device_filter()?;
    let mode_switch_target = driver_config.mode_switch.as_ref().map(|m| m.identity);
    let outcome = run_device(
        &context,
        &config,
        driver_config,
        filter.as_ref(),
        mode_switch_target,
        args.exit_when_ready,
    )
    .await?;

    match outcome {
        RunOutcome::Unrecovered => Err(anyhow!("Device could not be brought up")),
        RunOutcome::TimedOut => Err(anyhow!("Timed out waiting for the device")),
        _ => Ok(()),
    }
}

/// List USB devices and exit
fn list_devices_mode(context: &rusb::Context, signatures: &[InterfaceSignature]) -> Result<()> {
    let devices = usb::list_devices(context, signatures)?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {} Bus {:03} Device {:03} Speed: {:?}",
            device.info.identity, device.bus_number, device.info.address, device.info.speed
        );
        match device.binding {
            Some((interface, personality)) => {
                println!("      Binds interface {} as {:?}", interface, personality)
            }
            None => println!("      No supported interface"),
        }
    }
    Ok(())
}

async fn run_device(
    context: &rusb::Context,
    config: &HostConfig,
    driver_config: driver::DriverConfig,
    filter: Option<&DeviceFilter>,
    mode_switch_target: Option<DeviceIdentity>,
    exit_when_ready: bool,
) -> Result<RunOutcome> {
    let device = usb::find_device(
        context,
        filter,
        &driver_config.signatures,
        mode_switch_target,
    )?;
    let mut opened = OpenDevice::open(&device)?;
    let info = opened.info();
    info!(
        "Using device {} at address {} ({:?})",
        info.identity, info.address, info.speed
    );

    let handle = opened.handle();
    let timeouts = config.timeouts();
    let engine = RusbEngine::new(Arc::clone(&handle), timeouts);
    let prober = BotProber::new(handle, timeouts.bulk);
    let app = ConsoleApplication::new(exit_when_ready);
    let mut driver = ClassDriver::new(engine, prober, app, driver_config);

    let binding = driver
        .interface_init(info, opened.interfaces())
        .context("Failed to bind device")?;
    opened.claim(binding.interface_number)?;

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    let runner_config = RunnerConfig {
        tick_interval: config.tick_interval(),
        deadline: config.overall_timeout(),
    };
    let outcome = runner::run(&mut driver, runner_config, shutdown).await;

    match outcome {
        RunOutcome::Disconnected => {
            warn!("Device left the bus; run again once it has re-enumerated")
        }
        RunOutcome::Finished => info!("Serial handshake finished"),
        other => info!("Stopped: {:?}", other),
    }
    let scsi = driver.scsi();
    if let Some(capacity) = scsi.capacity() {
        info!(
            "Medium: {} bytes in {}-byte blocks, write protected: {:?}",
            capacity.total_bytes(),
            capacity.block_size,
            scsi.write_protected()
        );
    }
    if outcome == RunOutcome::Unrecovered {
        if let Some(sense) = scsi.last_sense() {
            error!(
                "Last sense: key={:#04x} asc={:#04x} ascq={:#04x}",
                sense.key, sense.asc, sense.ascq
            );
        }
    }

    driver.interface_deinit();
    opened.close();
    Ok(outcome)
}
