//! Synchronous USB I/O seam
//!
//! The engine and the BOT layer only need a handful of libusb calls. Routing them
//! through [`UsbIo`] keeps both testable without hardware.

use std::time::Duration;

use rusb::{DeviceHandle, UsbContext};

/// Blocking USB operations on an opened, claimed device
pub trait UsbIo {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn clear_halt(&self, endpoint: u8) -> rusb::Result<()>;
}

impl<T: UsbContext> UsbIo for DeviceHandle<T> {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::read_control(self, request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::write_control(self, request_type, request, value, index, buf, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, buf, timeout)
    }

    fn clear_halt(&self, endpoint: u8) -> rusb::Result<()> {
        DeviceHandle::clear_halt(self, endpoint)
    }
}
