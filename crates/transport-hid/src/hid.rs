use std::ffi::CStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hidapi::{DeviceInfo, HidApi, HidDevice};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    CancelSignal, DeviceDescriptor, DeviceFilter, DeviceProvider, Transport, TransportError,
};

impl DeviceDescriptor {
    fn from_info(info: &DeviceInfo) -> Self {
        let if_num = info.interface_number();
        Self {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            usage_page: info.usage_page(),
            usage: info.usage(),
            product_string: info.product_string().map(|s| s.to_string()),
            manufacturer_string: info.manufacturer_string().map(|s| s.to_string()),
            serial_number: info.serial_number().map(|s| s.to_string()),
            interface_number: (if_num >= 0).then_some(if_num),
            path: info.path().to_bytes_with_nul().to_vec(),
        }
    }
}

/// [`DeviceProvider`] backed by the platform HID stack.
pub struct HidProvider {
    api: Mutex<HidApi>,
    read_slice: Duration,
}

impl HidProvider {
    /// `read_slice` bounds how long a blocked read holds the device before it
    /// rechecks its cancel signal and lets queued writes through.
    pub fn new(read_slice: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            api: Mutex::new(HidApi::new()?),
            read_slice: read_slice.max(Duration::from_millis(1)),
        })
    }
}

impl DeviceProvider for HidProvider {
    fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let mut api = self.api.lock();
        api.refresh_devices()?;
        Ok(api
            .device_list()
            .map(DeviceDescriptor::from_info)
            .filter(|d| filter.matches(d))
            .collect())
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let path =
            CStr::from_bytes_with_nul(&device.path).map_err(|_| TransportError::InvalidPath)?;
        let inner = self.api.lock().open_path(path)?;
        debug!(name = %device.display_name(), "opened HID endpoint");
        Ok(Arc::new(HidTransport {
            device: Mutex::new(Some(inner)),
            report_len: filter.report_len,
            read_slice: self.read_slice,
        }))
    }
}

/// Polls `read_slice` until a report arrives, `cancel` fires or `deadline`
/// passes. `read_slice` fills the payload and returns the byte count, zero when
/// its slice elapsed empty-handed.
///
/// hidapi strips the id byte of unnumbered reports, so slot 0 is kept for it
/// and set to zero: callers see the full wire layout.
fn read_report(
    report_len: usize,
    cancel: &CancelSignal,
    deadline: Option<Instant>,
    mut read_slice: impl FnMut(&mut [u8]) -> Result<usize, TransportError>,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut buf = vec![0u8; report_len.max(2)];

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(TransportError::Timeout);
        }

        let n = read_slice(&mut buf[1..])?;
        if n > 0 {
            buf[0] = 0;
            buf.truncate(n + 1);
            return Ok(Some(buf));
        }
    }
}

/// Open handle on one HID interface. `None` once closed.
struct HidTransport {
    device: Mutex<Option<HidDevice>>,
    report_len: usize,
    read_slice: Duration,
}

impl Transport for HidTransport {
    fn write(&self, report: &[u8]) -> Result<usize, TransportError> {
        let guard = self.device.lock();
        let device = guard.as_ref().ok_or(TransportError::Disconnected)?;
        Ok(device.write(report)?)
    }

    fn read(
        &self,
        cancel: &CancelSignal,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let slice_ms = i32::try_from(self.read_slice.as_millis()).unwrap_or(i32::MAX);

        read_report(self.report_len, cancel, deadline, |payload| {
            let guard = self.device.lock();
            let device = guard.as_ref().ok_or(TransportError::Disconnected)?;
            device.read_timeout(payload, slice_ms).map_err(|e| {
                warn!(error = %e, "HID read failed");
                TransportError::from(e)
            })
        })
    }

    fn close(&self) {
        if self.device.lock().take().is_some() {
            debug!("closed HID endpoint");
        }
    }
}
