//! Scripted in-memory device for exercising callers without hardware.
//!
//! A [`MockProvider`] exposes a single [`MockDevice`]. Tests attach or detach
//! it, register canned replies keyed by the exact request bytes, inject
//! unsolicited input reports and inspect what was written.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::{
    CancelSignal, DeviceDescriptor, DeviceFilter, DeviceProvider, Transport, TransportError,
};

/// How often a blocked mock read rechecks its cancel signal.
const WAKE_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct DeviceState {
    attached: bool,
    /// Counts plug-ins; each one gets its own platform path.
    attachments: u64,
    /// Bumped on every open; a transport only works while its session is current.
    session: u64,
    open: bool,
    inbound: VecDeque<Vec<u8>>,
    replies: HashMap<Vec<u8>, Vec<u8>>,
    writes: Vec<Vec<u8>>,
    reads_started: usize,
    readers_blocked: usize,
    opens: usize,
    zero_length_writes: bool,
}

struct Shared {
    state: Mutex<DeviceState>,
    wake: Condvar,
}

/// Handle on the simulated keyboard. Clones control the same device.
#[derive(Clone)]
pub struct MockDevice {
    shared: Arc<Shared>,
    template: DeviceDescriptor,
}

impl MockDevice {
    fn new(filter: &DeviceFilter) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState::default()),
                wake: Condvar::new(),
            }),
            template: DeviceDescriptor {
                vendor_id: filter.vendor_id,
                product_id: filter.product_id,
                usage_page: filter.usage_page,
                usage: filter.usage,
                product_string: Some("Mock keyboard".to_string()),
                manufacturer_string: None,
                serial_number: Some("MOCK-0001".to_string()),
                interface_number: Some(1),
                path: Vec::new(),
            },
        }
    }

    /// Plugs the device in. Like a real re-enumeration, every attach hands
    /// out a new path, so descriptors from an earlier plug-in go stale.
    pub fn attach(&self) {
        let mut state = self.shared.state.lock();
        if !state.attached {
            state.attached = true;
            state.attachments += 1;
        }
    }

    fn descriptor(&self, state: &DeviceState) -> DeviceDescriptor {
        DeviceDescriptor {
            path: format!("mock://keyboard/{}\0", state.attachments).into_bytes(),
            ..self.template.clone()
        }
    }

    /// Unplugs the device. Any open transport starts failing with
    /// [`TransportError::Disconnected`].
    pub fn detach(&self) {
        let mut state = self.shared.state.lock();
        state.attached = false;
        state.open = false;
        state.inbound.clear();
        self.shared.wake.notify_all();
    }

    /// Queue `reply` as input whenever exactly `request` is written.
    pub fn reply_to(&self, request: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) {
        self.shared
            .state
            .lock()
            .replies
            .insert(request.as_ref().to_vec(), reply.as_ref().to_vec());
    }

    /// Deliver an input report nobody asked for.
    pub fn push_input(&self, report: impl AsRef<[u8]>) {
        let mut state = self.shared.state.lock();
        state.inbound.push_back(report.as_ref().to_vec());
        self.shared.wake.notify_all();
    }

    /// Make subsequent writes report zero bytes transferred.
    pub fn set_zero_length_writes(&self, enabled: bool) {
        self.shared.state.lock().zero_length_writes = enabled;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().writes.clone()
    }

    pub fn reads_started(&self) -> usize {
        self.shared.state.lock().reads_started
    }

    pub fn opens(&self) -> usize {
        self.shared.state.lock().opens
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    /// Number of input reports queued but not read yet.
    pub fn pending_input(&self) -> usize {
        self.shared.state.lock().inbound.len()
    }

    /// Waits until some reader is blocked on the device.
    pub fn wait_for_reader(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.readers_blocked == 0 {
            if self.shared.wake.wait_until(&mut state, deadline).timed_out() {
                return state.readers_blocked > 0;
            }
        }
        true
    }
}

pub struct MockProvider {
    device: MockDevice,
}

impl MockProvider {
    /// A provider whose single device matches `filter`. Starts detached.
    pub fn new(filter: DeviceFilter) -> Self {
        Self {
            device: MockDevice::new(&filter),
        }
    }

    pub fn device(&self) -> MockDevice {
        self.device.clone()
    }
}

impl DeviceProvider for MockProvider {
    fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let state = self.device.shared.state.lock();
        Ok(if state.attached && filter.matches(&self.device.template) {
            vec![self.device.descriptor(&state)]
        } else {
            vec![]
        })
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        _filter: &DeviceFilter,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let mut state = self.device.shared.state.lock();
        if !state.attached {
            return Err(TransportError::Disconnected);
        }
        if device.path != self.device.descriptor(&state).path {
            return Err(TransportError::InvalidPath);
        }
        state.session += 1;
        state.open = true;
        state.opens += 1;
        state.inbound.clear();
        debug!(session = state.session, "mock device opened");
        Ok(Arc::new(MockTransport {
            shared: self.device.shared.clone(),
            session: state.session,
        }))
    }
}

struct MockTransport {
    shared: Arc<Shared>,
    session: u64,
}

impl MockTransport {
    fn is_live(&self, state: &DeviceState) -> bool {
        state.open && state.session == self.session
    }
}

impl Transport for MockTransport {
    fn write(&self, report: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.shared.state.lock();
        if !self.is_live(&state) {
            return Err(TransportError::Disconnected);
        }
        state.writes.push(report.to_vec());
        if state.zero_length_writes {
            return Ok(0);
        }
        if let Some(reply) = state.replies.get(report).cloned() {
            state.inbound.push_back(reply);
            self.shared.wake.notify_all();
        }
        Ok(report.len())
    }

    fn read(
        &self,
        cancel: &CancelSignal,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        state.reads_started += 1;
        state.readers_blocked += 1;
        self.shared.wake.notify_all();

        let result = loop {
            if !self.is_live(&state) {
                break Err(TransportError::Disconnected);
            }
            if cancel.is_cancelled() {
                break Ok(None);
            }
            if let Some(report) = state.inbound.pop_front() {
                break Ok(Some(report));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break Err(TransportError::Timeout);
            }
            self.shared.wake.wait_for(&mut state, WAKE_INTERVAL);
        };

        state.readers_blocked -= 1;
        result
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        if self.is_live(&state) {
            state.open = false;
            self.shared.wake.notify_all();
        }
    }
}
