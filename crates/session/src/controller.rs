use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sinc_protocol::{decode, encode, Command, DecodedEvent, MacroKeyState, TargetLayer};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use transport_hid::{
    CancelSignal, DeviceDescriptor, DeviceFilter, DeviceProvider, HotplugEvent, Transport,
    TransportError,
};

use crate::error::SessionError;
use crate::mode::{ReadMode, ReadOwner, ReadRole};
use crate::polling::{self, PollingTask};
use crate::state::{SessionEvent, SessionState};
use crate::KEYBOARD_FILTER;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How a request's reply is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Write only; the polling loop picks up the reply.
    Polling,
    /// Write, then wait for the reply on the caller's thread.
    OneShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Upper bound on a one-shot round trip.
    pub response_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
        }
    }
}

enum Link {
    Disconnected,
    Connecting,
    Connected(Arc<dyn Transport>),
}

struct Shared {
    link: Link,
    session: SessionState,
    /// Bumped on every connect and disconnect; frames read under an older
    /// value are dropped.
    generation: u64,
    polling_cancel: Option<CancelSignal>,
}

pub(crate) struct Inner {
    provider: Arc<dyn DeviceProvider>,
    filter: DeviceFilter,
    options: ControllerOptions,
    shared: Mutex<Shared>,
    reader: ReadOwner,
    events: broadcast::Sender<SessionEvent>,
}

/// Session with one keyboard: owns the transport, tracks what the keyboard
/// reported and publishes every change.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct SincController {
    inner: Arc<Inner>,
}

impl SincController {
    pub fn new(provider: Arc<dyn DeviceProvider>, options: ControllerOptions) -> Self {
        Self::with_filter(provider, KEYBOARD_FILTER, options)
    }

    pub fn with_filter(
        provider: Arc<dyn DeviceProvider>,
        filter: DeviceFilter,
        options: ControllerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                provider,
                filter,
                options,
                shared: Mutex::new(Shared {
                    link: Link::Disconnected,
                    session: SessionState::default(),
                    generation: 0,
                    polling_cancel: None,
                }),
                reader: ReadOwner::new(),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared.lock().session
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.inner.shared.lock().link {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting => ConnectionState::Connecting,
            Link::Connected(_) => ConnectionState::Connected,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner.reader.current() == ReadMode::Polling
    }

    /// Finds the keyboard and connects to it.
    ///
    /// A no-op when already connected. While another thread's `open` is still
    /// connecting this also returns `Ok(())` without waiting: it only means a
    /// connect is in progress. That attempt may still fail; success shows up as
    /// [`SessionEvent::DeviceConnected`] and in [`Self::connection_state`].
    pub fn open(&self) -> Result<(), SessionError> {
        {
            let mut shared = self.inner.shared.lock();
            match shared.link {
                Link::Connected(_) => {
                    debug!("open: already connected");
                    return Ok(());
                }
                Link::Connecting => {
                    debug!("open: connection attempt already in progress");
                    return Ok(());
                }
                Link::Disconnected => shared.link = Link::Connecting,
            }
        }

        match self.inner.discover() {
            Ok((device, transport)) => self.inner.attach(&device, transport),
            Err(err) => {
                let mut shared = self.inner.shared.lock();
                if matches!(shared.link, Link::Connecting) {
                    shared.link = Link::Disconnected;
                }
                debug!(%err, "open failed");
                Err(err)
            }
        }
    }

    /// Drops the connection and resets the session. Safe to call repeatedly.
    pub fn close(&self) {
        self.inner.disconnect("closed");
    }

    /// Device removal reported by a watcher.
    pub fn handle_detach(&self) {
        self.inner.disconnect("device removed");
    }

    pub fn handle_hotplug(&self, event: HotplugEvent) {
        match event {
            HotplugEvent::Arrived(device) => {
                if self.connection_state() != ConnectionState::Disconnected {
                    return;
                }
                info!(name = %device.display_name(), "keyboard attached");
                if let Err(err) = self.open() {
                    warn!(%err, "failed to connect to attached keyboard");
                }
            }
            HotplugEvent::Removed => self.handle_detach(),
        }
    }

    /// Starts the background reader. Returns `None` when not connected or
    /// when something already owns the read side.
    pub fn start_polling(&self, cancel: CancelSignal) -> Option<PollingTask> {
        let mut shared = self.inner.shared.lock();
        let Link::Connected(transport) = &shared.link else {
            debug!("start_polling: not connected");
            return None;
        };
        let claim = match self.inner.reader.claim(ReadRole::Polling) {
            Ok(claim) => claim,
            Err(holder) => {
                debug!(?holder, "start_polling: read side already claimed");
                return None;
            }
        };

        let transport = transport.clone();
        let generation = shared.generation;
        match polling::spawn(
            Arc::downgrade(&self.inner),
            transport,
            generation,
            claim,
            cancel.clone(),
        ) {
            Ok(task) => {
                shared.polling_cancel = Some(cancel);
                Some(task)
            }
            Err(err) => {
                warn!(%err, "failed to spawn polling thread");
                None
            }
        }
    }

    pub fn query_layer_status(&self, mode: RequestMode) -> Result<bool, SessionError> {
        self.dispatch(Command::QueryLayerStatus, mode)
    }

    pub fn request_layer(
        &self,
        layer: TargetLayer,
        mode: RequestMode,
    ) -> Result<bool, SessionError> {
        self.dispatch(Command::select(layer), mode)
    }

    pub fn set_macro_key(
        &self,
        state: MacroKeyState,
        mode: RequestMode,
    ) -> Result<bool, SessionError> {
        self.dispatch(Command::macro_key(state), mode)
    }

    /// `Ok(false)` means nothing was sent because no keyboard is connected.
    fn dispatch(&self, command: Command, mode: RequestMode) -> Result<bool, SessionError> {
        match mode {
            RequestMode::Polling => {
                let Some((transport, generation)) = self.inner.connected_transport() else {
                    return Ok(false);
                };
                write_command(transport.as_ref(), command)
                    .map_err(|err| self.inner.transport_failed(generation, err))?;
                Ok(true)
            }
            RequestMode::OneShot => {
                let _claim = self
                    .inner
                    .reader
                    .claim(ReadRole::OneShot)
                    .map_err(SessionError::ModeConflict)?;
                let Some((transport, generation)) = self.inner.connected_transport() else {
                    return Ok(false);
                };
                let timeout = Some(self.inner.options.response_timeout);
                let reply = write_command(transport.as_ref(), command)
                    .and_then(|()| transport.read(&CancelSignal::new(), timeout))
                    .map_err(|err| self.inner.transport_failed(generation, err))?
                    .ok_or(TransportError::Disconnected)?;
                if reply.is_empty() {
                    return Err(TransportError::ZeroLengthTransfer.into());
                }
                self.inner.apply(generation, decode(&reply));
                Ok(true)
            }
        }
    }
}

fn write_command(transport: &dyn Transport, command: Command) -> Result<(), TransportError> {
    let frame = encode(command);
    debug!(?command, ?frame, "sending");
    match transport.write(frame.as_ref())? {
        0 => Err(TransportError::ZeroLengthTransfer),
        _ => Ok(()),
    }
}

impl Inner {
    fn discover(&self) -> Result<(DeviceDescriptor, Arc<dyn Transport>), SessionError> {
        let device = self
            .provider
            .enumerate(&self.filter)?
            .into_iter()
            .next()
            .ok_or(SessionError::DeviceNotFound(self.filter))?;
        let transport = self.provider.open(&device, &self.filter)?;
        Ok((device, transport))
    }

    fn attach(
        &self,
        device: &DeviceDescriptor,
        transport: Arc<dyn Transport>,
    ) -> Result<(), SessionError> {
        let mut shared = self.shared.lock();
        if !matches!(shared.link, Link::Connecting) {
            // Closed while we were opening.
            transport.close();
            return Err(TransportError::Disconnected.into());
        }
        shared.link = Link::Connected(transport);
        shared.generation += 1;
        info!(name = %device.display_name(), "keyboard connected");
        if let Some(change) = shared.session.set_connected(true) {
            self.publish(SessionEvent::Changed(change));
        }
        self.publish(SessionEvent::DeviceConnected);
        Ok(())
    }

    fn disconnect(&self, reason: &str) {
        self.disconnect_if(reason, |_| true);
    }

    /// The handle for connection `generation` reported the device gone.
    /// Ignored once that connection has already been torn down.
    pub(crate) fn connection_lost(&self, generation: u64) {
        self.disconnect_if("handle lost", |current| current == generation);
    }

    fn disconnect_if(&self, reason: &str, still_wanted: impl FnOnce(u64) -> bool) {
        let mut shared = self.shared.lock();
        if !still_wanted(shared.generation) {
            return;
        }
        let transport = match std::mem::replace(&mut shared.link, Link::Disconnected) {
            Link::Disconnected => return,
            Link::Connecting => None,
            Link::Connected(transport) => Some(transport),
        };

        // Stop the reader before the handle goes away under it.
        if let Some(cancel) = shared.polling_cancel.take() {
            cancel.cancel();
        }
        shared.generation += 1;

        let Some(transport) = transport else {
            return;
        };
        transport.close();
        info!(reason, "keyboard disconnected");

        for change in shared.session.reset() {
            self.publish(SessionEvent::Changed(change));
        }
        self.publish(SessionEvent::DeviceDisconnected);
    }

    fn transport_failed(&self, generation: u64, err: TransportError) -> TransportError {
        if err == TransportError::Disconnected {
            self.connection_lost(generation);
        }
        err
    }

    fn connected_transport(&self) -> Option<(Arc<dyn Transport>, u64)> {
        let shared = self.shared.lock();
        match &shared.link {
            Link::Connected(transport) => Some((transport.clone(), shared.generation)),
            _ => None,
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let shared = self.shared.lock();
        shared.generation == generation && matches!(shared.link, Link::Connected(_))
    }

    /// Applies a decoded frame read on connection `generation`.
    pub(crate) fn apply(&self, generation: u64, event: DecodedEvent) {
        let mut shared = self.shared.lock();
        if shared.generation != generation || !matches!(shared.link, Link::Connected(_)) {
            debug!(?event, "dropping frame from a previous connection");
            return;
        }
        match shared.session.apply(event) {
            Some(change) => {
                debug!(?change, "session state changed");
                self.publish(SessionEvent::Changed(change));
            }
            None if event == DecodedEvent::Unrecognized => debug!("ignoring unrecognized frame"),
            None => {}
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        if let Some(cancel) = shared.polling_cancel.take() {
            cancel.cancel();
        }
        let link = std::mem::replace(&mut shared.link, Link::Disconnected);
        if let Link::Connected(transport) = link {
            transport.close();
        }
    }
}

impl std::fmt::Debug for SincController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SincController")
            .field("filter", &self.inner.filter)
            .field("state", &self.state())
            .field("read_mode", &self.inner.reader.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateChange;
    use sinc_protocol::{LayerState, FRAME_LEN};
    use std::time::Instant;
    use transport_hid::mock::{MockDevice, MockProvider};

    fn padded(literal: &[u8]) -> Vec<u8> {
        let mut v = literal.to_vec();
        v.resize(FRAME_LEN, 0);
        v
    }

    fn setup() -> (SincController, MockDevice) {
        let provider = Arc::new(MockProvider::new(KEYBOARD_FILTER));
        let device = provider.device();
        let options = ControllerOptions {
            response_timeout: Duration::from_millis(200),
        };
        (SincController::new(provider, options), device)
    }

    fn connected() -> (SincController, MockDevice) {
        let (controller, device) = setup();
        device.attach();
        controller.open().unwrap();
        (controller, device)
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = vec![];
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_open_without_device_fails() {
        let (controller, _device) = setup();
        let mut rx = controller.subscribe();
        assert_eq!(
            controller.open(),
            Err(SessionError::DeviceNotFound(KEYBOARD_FILTER))
        );
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_open_publishes_connection() {
        let (controller, device) = setup();
        device.attach();
        let mut rx = controller.subscribe();
        controller.open().unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Changed(StateChange::Connected {
                    old: false,
                    new: true
                }),
                SessionEvent::DeviceConnected,
            ]
        );
        assert!(controller.state().connected());

        // Second open is a no-op.
        controller.open().unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(device.opens(), 1);
    }

    #[test]
    fn test_disconnected_requests_return_false() {
        let (controller, device) = setup();
        for mode in [RequestMode::Polling, RequestMode::OneShot] {
            assert_eq!(controller.query_layer_status(mode), Ok(false));
            assert_eq!(controller.request_layer(TargetLayer::Mac, mode), Ok(false));
            assert_eq!(
                controller.set_macro_key(MacroKeyState::Disabled, mode),
                Ok(false)
            );
        }
        assert!(device.writes().is_empty());
        assert_eq!(controller.state(), SessionState::default());
    }

    #[test]
    fn test_one_shot_applies_reply() {
        let (controller, device) = connected();
        device.reply_to(
            encode(Command::QueryLayerStatus),
            padded(b"\x00\x02JML\x0e"),
        );
        assert_eq!(controller.query_layer_status(RequestMode::OneShot), Ok(true));
        assert_eq!(controller.state().layer(), Some(LayerState::Mac));
        assert_eq!(controller.inner.reader.current(), ReadMode::Idle);
    }

    #[test]
    fn test_one_shot_macro_key() {
        let (controller, device) = connected();
        device.reply_to(
            encode(Command::DisableMacroKey),
            padded(b"\x00\x02JMLDS"),
        );
        assert_eq!(
            controller.set_macro_key(MacroKeyState::Disabled, RequestMode::OneShot),
            Ok(true)
        );
        let state = controller.state();
        assert!(state.macro_key_disabled());
        assert_eq!(state.layer(), None);
    }

    #[test]
    fn test_one_shot_timeout_leaves_state() {
        let (controller, _device) = connected();
        let before = controller.state();
        assert_eq!(
            controller.request_layer(TargetLayer::Windows, RequestMode::OneShot),
            Err(SessionError::Transport(TransportError::Timeout))
        );
        assert_eq!(controller.state(), before);
    }

    #[test]
    fn test_zero_length_write_is_transport_error() {
        let (controller, device) = connected();
        device.set_zero_length_writes(true);
        assert_eq!(
            controller.query_layer_status(RequestMode::Polling),
            Err(SessionError::Transport(TransportError::ZeroLengthTransfer))
        );
    }

    #[test]
    fn test_one_shot_rejected_while_polling() {
        let (controller, device) = connected();
        let cancel = CancelSignal::new();
        let task = controller.start_polling(cancel.clone()).unwrap();
        assert!(device.wait_for_reader(Duration::from_secs(1)));
        let before = controller.state();

        assert_eq!(
            controller.query_layer_status(RequestMode::OneShot),
            Err(SessionError::ModeConflict(ReadMode::Polling))
        );
        assert!(device.writes().is_empty());
        assert_eq!(controller.state(), before);

        cancel.cancel();
        task.join();
        assert!(!controller.is_polling());
    }

    #[test]
    fn test_start_polling_twice_is_noop() {
        let (controller, _device) = connected();
        let cancel = CancelSignal::new();
        let task = controller.start_polling(cancel.clone()).unwrap();
        assert!(controller.start_polling(CancelSignal::new()).is_none());
        cancel.cancel();
        task.join();
        // Free again once the first loop is gone.
        let again = controller.start_polling(CancelSignal::new()).unwrap();
        controller.close();
        again.join();
    }

    #[test]
    fn test_start_polling_requires_connection() {
        let (controller, _device) = setup();
        assert!(controller.start_polling(CancelSignal::new()).is_none());
    }

    #[test]
    fn test_polling_mode_reply_captured_by_loop() {
        let (controller, device) = connected();
        device.reply_to(
            encode(Command::SelectWindows),
            padded(b"\x00\x02JML\x0f"),
        );
        let task = controller.start_polling(CancelSignal::new()).unwrap();

        assert_eq!(
            controller.request_layer(TargetLayer::Windows, RequestMode::Polling),
            Ok(true)
        );
        assert!(wait_until(|| controller.state().layer() == Some(LayerState::Windows)));

        device.push_input(padded(b"\x00\x02JML1"));
        assert!(wait_until(|| controller.state().layer() == Some(LayerState::Mac)));

        controller.close();
        task.join();
    }

    #[test]
    fn test_close_twice_is_idempotent() {
        let (controller, _device) = connected();
        let mut rx = controller.subscribe();
        controller.close();
        let first = drain(&mut rx);
        assert_eq!(first.last(), Some(&SessionEvent::DeviceDisconnected));
        controller.close();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_close_cancels_polling() {
        let (controller, device) = connected();
        let task = controller.start_polling(CancelSignal::new()).unwrap();
        assert!(device.wait_for_reader(Duration::from_secs(1)));
        controller.close();
        task.join();
        assert!(!controller.is_polling());
        assert!(!device.is_open());
    }

    #[test]
    fn test_hotplug_reconnects() {
        let (controller, device) = setup();
        device.attach();
        let arrived = controller
            .inner
            .provider
            .enumerate(&KEYBOARD_FILTER)
            .unwrap()
            .remove(0);

        controller.handle_hotplug(HotplugEvent::Arrived(arrived.clone()));
        assert_eq!(controller.connection_state(), ConnectionState::Connected);
        // A repeated arrival while connected does not reopen.
        controller.handle_hotplug(HotplugEvent::Arrived(arrived));
        assert_eq!(device.opens(), 1);

        controller.handle_hotplug(HotplugEvent::Removed);
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_frame_from_previous_connection_is_dropped() {
        let (controller, _device) = connected();
        let stale = controller.inner.shared.lock().generation;
        controller.close();
        controller.open().unwrap();
        let mut rx = controller.subscribe();

        controller
            .inner
            .apply(stale, DecodedEvent::LayerAck(LayerState::Mac));
        assert_eq!(controller.state().layer(), None);
        assert!(drain(&mut rx).is_empty());

        let current = controller.inner.shared.lock().generation;
        controller
            .inner
            .apply(current, DecodedEvent::LayerAck(LayerState::Mac));
        assert_eq!(controller.state().layer(), Some(LayerState::Mac));
    }

    #[test]
    fn test_start_polling_refused_during_one_shot() {
        let provider = Arc::new(MockProvider::new(KEYBOARD_FILTER));
        let device = provider.device();
        let options = ControllerOptions {
            response_timeout: Duration::from_secs(5),
        };
        let controller = SincController::new(provider, options);
        device.attach();
        controller.open().unwrap();

        let caller = {
            let controller = controller.clone();
            std::thread::spawn(move || controller.query_layer_status(RequestMode::OneShot))
        };
        assert!(device.wait_for_reader(Duration::from_secs(1)));

        assert!(controller.start_polling(CancelSignal::new()).is_none());
        assert!(!controller.is_polling());

        device.detach();
        assert_eq!(
            caller.join().unwrap(),
            Err(SessionError::Transport(TransportError::Disconnected))
        );
    }

    #[test]
    fn test_polling_loop_detaches_lost_device() {
        let (controller, device) = connected();
        let task = controller.start_polling(CancelSignal::new()).unwrap();
        assert!(device.wait_for_reader(Duration::from_secs(1)));
        let mut rx = controller.subscribe();

        // Pulled without any watcher noticing.
        device.detach();
        task.join();

        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
        assert!(!controller.state().connected());
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&SessionEvent::DeviceDisconnected));

        // The watcher's late report changes nothing.
        controller.handle_detach();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_write_to_replugged_device_detaches() {
        let (controller, device) = connected();
        device.detach();
        device.attach();

        assert_eq!(
            controller.query_layer_status(RequestMode::Polling),
            Err(SessionError::Transport(TransportError::Disconnected))
        );
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);

        controller.open().unwrap();
        assert_eq!(device.opens(), 2);
        assert_eq!(controller.query_layer_status(RequestMode::Polling), Ok(true));
    }

    /// Provider whose enumeration blocks until the test lets it through.
    struct GatedProvider {
        inner: MockProvider,
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl DeviceProvider for GatedProvider {
        fn enumerate(
            &self,
            filter: &DeviceFilter,
        ) -> Result<Vec<DeviceDescriptor>, TransportError> {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv();
            self.inner.enumerate(filter)
        }

        fn open(
            &self,
            device: &DeviceDescriptor,
            filter: &DeviceFilter,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            self.inner.open(device, filter)
        }
    }

    #[test]
    fn test_open_while_connecting_reports_attempt_in_progress() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let provider = Arc::new(GatedProvider {
            inner: MockProvider::new(KEYBOARD_FILTER),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let controller = SincController::new(provider, ControllerOptions::default());

        let first = {
            let controller = controller.clone();
            std::thread::spawn(move || controller.open())
        };
        entered_rx.recv().unwrap();
        assert_eq!(controller.connection_state(), ConnectionState::Connecting);

        // Does not wait for, or re-run, the attempt in flight.
        assert_eq!(controller.open(), Ok(()));
        assert_eq!(controller.connection_state(), ConnectionState::Connecting);

        release_tx.send(()).unwrap();
        assert_eq!(
            first.join().unwrap(),
            Err(SessionError::DeviceNotFound(KEYBOARD_FILTER))
        );
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    }
}
