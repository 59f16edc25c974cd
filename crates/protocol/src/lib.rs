//! Wire protocol for the Sinc keyboard's layer-control HID interface.
//!
//! Every exchange is a fixed 65-byte frame: a `0x00 0x02` header, the ASCII
//! literal `JML`, a short command suffix and zero padding. This crate only
//! deals with bytes; opening devices and moving frames is `transport-hid`'s job.

mod codec;
mod types;

pub use codec::{decode, encode, Command, DecodedEvent, Frame};
pub use types::{LayerState, MacroKeyState, ParseStateError, TargetLayer};

/// Size of every frame exchanged with the keyboard, report id included.
pub const FRAME_LEN: usize = 65;

/// USB vendor id of the keyboard.
pub const VENDOR_ID: u16 = 0xCB10;
/// USB product id of the keyboard.
pub const PRODUCT_ID: u16 = 0x1267;
/// Vendor-defined usage page of the raw HID interface.
pub const USAGE_PAGE: u16 = 0xFF60;
/// Usage of the raw HID interface within [`USAGE_PAGE`].
pub const USAGE: u16 = 0x61;
