//! Host-side session controller for the Sinc keyboard.
//!
//! [`SincController`] owns the HID transport, runs the connect/disconnect
//! lifecycle, optionally drains input reports on a background thread and
//! issues layer and macro-key requests. Everything it learns lands in a
//! [`SessionState`]; every change is published as a [`SessionEvent`].
//!
//! Requests come in two flavours (see [`RequestMode`]). With the polling loop
//! running, requests only write and the loop applies the replies. Without it, a
//! one-shot request writes and then reads the reply itself. The two never
//! share the read side: a one-shot request issued while polling fails with
//! [`SessionError::ModeConflict`].

mod controller;
mod error;
mod mode;
mod polling;
mod state;

pub use controller::{ConnectionState, ControllerOptions, RequestMode, SincController};
pub use error::SessionError;
pub use mode::ReadMode;
pub use polling::PollingTask;
pub use state::{SessionEvent, SessionState, StateChange};

pub use sinc_protocol::{LayerState, MacroKeyState, TargetLayer};
pub use transport_hid::{CancelSignal, DeviceFilter, HotplugEvent};

/// The keyboard's raw HID interface.
pub const KEYBOARD_FILTER: DeviceFilter = DeviceFilter {
    vendor_id: sinc_protocol::VENDOR_ID,
    product_id: sinc_protocol::PRODUCT_ID,
    usage_page: sinc_protocol::USAGE_PAGE,
    usage: sinc_protocol::USAGE,
    report_len: sinc_protocol::FRAME_LEN,
};
