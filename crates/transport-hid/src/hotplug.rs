//! Attach/detach detection by periodic enumeration.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{CancelSignal, DeviceDescriptor, DeviceFilter, DeviceProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A device matching the filter appeared.
    Arrived(DeviceDescriptor),
    /// The last matching device went away.
    Removed,
}

/// Owns the watcher thread; dropping it stops the thread.
pub struct WatcherHandle {
    cancel: CancelSignal,
    thread: Option<thread::JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("hotplug watcher thread panicked");
            }
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Starts a thread that enumerates through `provider` every `interval` and
/// reports presence transitions. A device already attached at start-up is
/// reported as `Arrived` on the first scan.
pub fn spawn_watcher(
    provider: Arc<dyn DeviceProvider>,
    filter: DeviceFilter,
    interval: Duration,
) -> std::io::Result<(WatcherHandle, mpsc::UnboundedReceiver<HotplugEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancelSignal::new();
    let thread_cancel = cancel.clone();

    let thread = thread::Builder::new()
        .name("hid-hotplug".into())
        .spawn(move || run_watcher(provider, filter, interval, thread_cancel, tx))?;

    Ok((
        WatcherHandle {
            cancel,
            thread: Some(thread),
        },
        rx,
    ))
}

fn run_watcher(
    provider: Arc<dyn DeviceProvider>,
    filter: DeviceFilter,
    interval: Duration,
    cancel: CancelSignal,
    tx: mpsc::UnboundedSender<HotplugEvent>,
) {
    info!(%filter, "hotplug watcher started");
    // Path of the device last reported as arrived.
    let mut known: Option<Vec<u8>> = None;
    // Sleep in small steps so a stop request is not held up by a long interval.
    let step = interval.clamp(Duration::from_millis(1), Duration::from_millis(50));

    while !cancel.is_cancelled() {
        match provider.enumerate(&filter) {
            Ok(devices) => {
                let events = transitions(&mut known, devices.into_iter().next());
                for event in events {
                    debug!(?event, "hotplug transition");
                    if tx.send(event).is_err() {
                        debug!("hotplug receiver dropped; stopping watcher");
                        return;
                    }
                }
            }
            Err(err) => warn!(%err, "device enumeration failed"),
        }

        let mut waited = Duration::ZERO;
        while waited < interval && !cancel.is_cancelled() {
            thread::sleep(step);
            waited += step;
        }
    }

    debug!("hotplug watcher stopped");
}

/// Events for going from `known` to `current`. A device that came back under
/// a different path between two scans was unplugged and replugged.
fn transitions(
    known: &mut Option<Vec<u8>>,
    current: Option<DeviceDescriptor>,
) -> Vec<HotplugEvent> {
    match current {
        None if known.is_some() => {
            *known = None;
            vec![HotplugEvent::Removed]
        }
        None => vec![],
        Some(device) if known.as_deref() == Some(device.path.as_slice()) => vec![],
        Some(device) => {
            let mut events = Vec::with_capacity(2);
            if known.is_some() {
                events.push(HotplugEvent::Removed);
            }
            *known = Some(device.path.clone());
            events.push(HotplugEvent::Arrived(device));
            events
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(path: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0xCB10,
            product_id: 0x1267,
            usage_page: 0xFF60,
            usage: 0x61,
            product_string: None,
            manufacturer_string: None,
            serial_number: None,
            interface_number: None,
            path: path.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_transitions_track_presence() {
        let mut known = None;
        assert_eq!(
            transitions(&mut known, Some(descriptor("a"))),
            vec![HotplugEvent::Arrived(descriptor("a"))]
        );
        assert!(transitions(&mut known, Some(descriptor("a"))).is_empty());
        assert_eq!(transitions(&mut known, None), vec![HotplugEvent::Removed]);
        assert!(transitions(&mut known, None).is_empty());
    }

    #[test]
    fn test_new_path_between_scans_is_a_replug() {
        let mut known = Some(b"a".to_vec());
        assert_eq!(
            transitions(&mut known, Some(descriptor("b"))),
            vec![
                HotplugEvent::Removed,
                HotplugEvent::Arrived(descriptor("b"))
            ]
        );
        assert_eq!(known.as_deref(), Some(&b"b"[..]));
    }
}
