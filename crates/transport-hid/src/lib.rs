//! HID transport layer built on `hidapi`.
//!
//! Downstream crates talk to the keyboard through [`DeviceProvider`] and
//! [`Transport`] only, so the session logic can run against the in-memory
//! device from the `mock-hid` feature as well as real hardware.

mod error;
mod hid;
mod hotplug;
#[cfg(feature = "mock-hid")]
pub mod mock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use error::TransportError;
pub use hid::HidProvider;
pub use hotplug::{spawn_watcher, HotplugEvent, WatcherHandle};

/// Cooperative cancellation flag shared between a blocking reader and its owner.
///
/// Clones share the same flag; once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Selects one HID interface of one device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
    pub usage_page: u16,
    pub usage: u16,
    /// Output/input report length including the report id byte.
    pub report_len: usize,
}

impl DeviceFilter {
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        device.vendor_id == self.vendor_id
            && device.product_id == self.product_id
            && device.usage_page == self.usage_page
            && device.usage == self.usage
    }
}

impl std::fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (usage {:04x}/{:02x})",
            self.vendor_id, self.product_id, self.usage_page, self.usage
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub usage_page: u16,
    pub usage: u16,
    pub product_string: Option<String>,
    pub manufacturer_string: Option<String>,
    pub serial_number: Option<String>,
    pub interface_number: Option<i32>,
    /// Platform path, NUL-terminated.
    pub path: Vec<u8>,
}

impl DeviceDescriptor {
    pub fn display_name(&self) -> String {
        self.product_string
            .clone()
            .unwrap_or_else(|| format!("HID {:04x}:{:04x}", self.vendor_id, self.product_id))
    }
}

/// An open HID endpoint.
///
/// Implementations must tolerate a `close` racing a blocked `read`: the read
/// returns [`TransportError::Disconnected`] instead of hanging.
pub trait Transport: Send + Sync {
    /// Sends one output report. Returns the number of bytes the device accepted.
    fn write(&self, report: &[u8]) -> Result<usize, TransportError>;

    /// Blocks until an input report arrives.
    ///
    /// Returns `Ok(None)` when `cancel` fires first and
    /// [`TransportError::Timeout`] when `timeout` elapses first.
    fn read(
        &self,
        cancel: &CancelSignal,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Releases the endpoint. Calling it again is a no-op.
    fn close(&self);
}

/// Finds and opens devices.
pub trait DeviceProvider: Send + Sync {
    fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<DeviceDescriptor>, TransportError>;

    fn open(
        &self,
        device: &DeviceDescriptor,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
