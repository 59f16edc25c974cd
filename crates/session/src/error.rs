use thiserror::Error;
use transport_hid::{DeviceFilter, TransportError};

use crate::mode::ReadMode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no keyboard matching {0} is attached")]
    DeviceNotFound(DeviceFilter),

    /// A one-shot request needs the read side, but `holder` already owns it.
    #[error("one-shot request rejected: read side is held by {0:?}")]
    ModeConflict(ReadMode),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
