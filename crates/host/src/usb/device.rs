//! USB device discovery and ownership
//!
//! Converts rusb descriptors into the protocol model and owns the opened handle
//! together with the interfaces claimed on it.

use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use driver::{InterfaceSignature, select_interface};
use protocol::{
    DeviceIdentity, DeviceInfo, DeviceSpeed, EndpointDescriptor, InterfaceDescriptor, Personality,
    TransferKind,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, warn};

use crate::config::DeviceFilter;

/// An attached device as seen during enumeration
#[derive(Debug, Clone)]
pub struct DeviceListing {
    pub bus_number: u8,
    pub info: DeviceInfo,
    /// Interface the class driver would bind to, if any
    pub binding: Option<(u8, Personality)>,
}

/// Map rusb device speed to protocol DeviceSpeed
pub fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Full,
    }
}

fn map_transfer_type(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

pub fn device_info<T: UsbContext>(device: &Device<T>) -> rusb::Result<DeviceInfo> {
    let descriptor = device.device_descriptor()?;
    Ok(DeviceInfo {
        identity: DeviceIdentity {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
        },
        address: device.address(),
        speed: map_device_speed(device.speed()),
    })
}

/// Interfaces of the active configuration, default alternate setting only
pub fn read_interfaces<T: UsbContext>(device: &Device<T>) -> rusb::Result<Vec<InterfaceDescriptor>> {
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(e) => {
            debug!("No active configuration ({}), using the first one", e);
            device.config_descriptor(0)?
        }
    };

    let interfaces = config
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .filter(|desc| desc.setting_number() == 0)
        .map(|desc| InterfaceDescriptor {
            number: desc.interface_number(),
            alternate_setting: desc.setting_number(),
            class: desc.class_code(),
            subclass: desc.sub_class_code(),
            protocol: desc.protocol_code(),
            endpoints: desc
                .endpoint_descriptors()
                .map(|ep| EndpointDescriptor {
                    address: ep.address(),
                    attributes: map_transfer_type(ep.transfer_type()).attributes(),
                    max_packet_size: ep.max_packet_size(),
                    interval: ep.interval(),
                })
                .collect(),
        })
        .collect();
    Ok(interfaces)
}

/// Enumerate attached devices and the interface each would bind to
pub fn list_devices(
    context: &Context,
    signatures: &[InterfaceSignature],
) -> Result<Vec<DeviceListing>> {
    let devices = context.devices().context("Failed to enumerate USB devices")?;
    let mut listings = Vec::new();
    for device in devices.iter() {
        let info = match device_info(&device) {
            Ok(info) => info,
            Err(e) => {
                debug!("Skipping device at address {}: {}", device.address(), e);
                continue;
            }
        };
        let binding = read_interfaces(&device)
            .ok()
            .and_then(|interfaces| select_interface(&interfaces, signatures).ok())
            .map(|selection| (selection.interface_number, selection.personality));
        listings.push(DeviceListing {
            bus_number: device.bus_number(),
            info,
            binding,
        });
    }
    Ok(listings)
}

/// Pick the device to drive
///
/// With a filter, the first device matching it. Without one, the first device
/// that is either bindable or a mode-switch target.
pub fn find_device(
    context: &Context,
    filter: Option<&DeviceFilter>,
    signatures: &[InterfaceSignature],
    mode_switch_target: Option<DeviceIdentity>,
) -> Result<Device<Context>> {
    let devices = context.devices().context("Failed to enumerate USB devices")?;
    for device in devices.iter() {
        let Ok(info) = device_info(&device) else {
            continue;
        };
        let wanted = match filter {
            Some(filter) => filter.matches(info.identity),
            None => {
                Some(info.identity) == mode_switch_target
                    || read_interfaces(&device)
                        .ok()
                        .is_some_and(|ifaces| select_interface(&ifaces, signatures).is_ok())
            }
        };
        if wanted {
            debug!(
                "Selected {} on bus {:03} address {:03}",
                info.identity,
                device.bus_number(),
                info.address
            );
            return Ok(device);
        }
    }
    Err(anyhow!("No matching USB device found"))
}

/// Opened device with the interfaces claimed on it
pub struct OpenDevice {
    handle: Arc<DeviceHandle<Context>>,
    info: DeviceInfo,
    interfaces: Vec<InterfaceDescriptor>,
    claimed: Vec<u8>,
}

impl OpenDevice {
    pub fn open(device: &Device<Context>) -> Result<Self> {
        let info = device_info(device).context("Failed to read device descriptor")?;
        let interfaces = read_interfaces(device).context("Failed to read configuration")?;
        let handle = device
            .open()
            .with_context(|| format!("Failed to open device {}", info.identity))?;
        debug!("Opened device {}", info.identity);

        Ok(Self {
            handle: Arc::new(handle),
            info,
            interfaces,
            claimed: Vec::new(),
        })
    }

    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    pub fn interfaces(&self) -> &[InterfaceDescriptor] {
        &self.interfaces
    }

    pub fn handle(&self) -> Arc<DeviceHandle<Context>> {
        Arc::clone(&self.handle)
    }

    /// Claim `interface`, detaching a kernel driver bound to it
    pub fn claim(&mut self, interface: u8) -> Result<()> {
        if self.claimed.contains(&interface) {
            return Ok(());
        }
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                if let Err(e) = self.handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        self.handle
            .claim_interface(interface)
            .with_context(|| format!("Failed to claim interface {}", interface))?;
        debug!("Claimed interface {}", interface);
        self.claimed.push(interface);
        Ok(())
    }

    /// Release claimed interfaces and hand them back to the kernel
    pub fn close(&mut self) {
        for interface in self.claimed.drain(..) {
            if let Err(e) = self.handle.release_interface(interface) {
                debug!("Failed to release interface {}: {}", interface, e);
            }
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
    }
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        self.close();
    }
}
