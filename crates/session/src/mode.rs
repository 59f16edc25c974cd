//! Ownership of the transport's read side.
//!
//! The HID endpoint has a single input queue. Either the polling loop drains
//! it continuously, or one caller at a time does a write-then-read round trip.
//! [`ReadOwner`] hands out a [`ReadClaim`] for one of those roles and refuses
//! any other claim until the guard is dropped.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const IDLE: u8 = 0;
const POLLING: u8 = 1;
const ONE_SHOT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Idle,
    Polling,
    OneShot,
}

impl ReadMode {
    fn from_raw(raw: u8) -> Self {
        match raw {
            POLLING => ReadMode::Polling,
            ONE_SHOT => ReadMode::OneShot,
            _ => ReadMode::Idle,
        }
    }
}

/// Roles that can own the read side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadRole {
    Polling,
    OneShot,
}

impl ReadRole {
    fn raw(self) -> u8 {
        match self {
            ReadRole::Polling => POLLING,
            ReadRole::OneShot => ONE_SHOT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ReadOwner {
    state: Arc<AtomicU8>,
}

impl ReadOwner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn current(&self) -> ReadMode {
        ReadMode::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// Takes the read side for `role`. On failure returns the current holder.
    pub(crate) fn claim(&self, role: ReadRole) -> Result<ReadClaim, ReadMode> {
        self.state
            .compare_exchange(IDLE, role.raw(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ReadClaim {
                state: self.state.clone(),
            })
            .map_err(ReadMode::from_raw)
    }
}

/// Proof of read-side ownership. Released on drop, however the owner exits.
#[derive(Debug)]
pub(crate) struct ReadClaim {
    state: Arc<AtomicU8>,
}

impl Drop for ReadClaim {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::SeqCst);
    }
}
