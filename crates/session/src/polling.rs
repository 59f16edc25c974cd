use std::sync::{Arc, Weak};
use std::thread;

use sinc_protocol::decode;
use tracing::{debug, warn};
use transport_hid::{CancelSignal, Transport, TransportError};

use crate::controller::Inner;
use crate::mode::ReadClaim;

/// A running polling loop.
pub struct PollingTask {
    cancel: CancelSignal,
    thread: thread::JoinHandle<()>,
}

impl PollingTask {
    /// Asks the loop to stop at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the loop to exit. Does not cancel it.
    pub fn join(self) {
        if self.thread.join().is_err() {
            warn!("polling thread panicked");
        }
    }
}

pub(crate) fn spawn(
    inner: Weak<Inner>,
    transport: Arc<dyn Transport>,
    generation: u64,
    claim: ReadClaim,
    cancel: CancelSignal,
) -> std::io::Result<PollingTask> {
    let thread_cancel = cancel.clone();
    let thread = thread::Builder::new()
        .name("sinc-poll".into())
        .spawn(move || {
            let lost = run(&inner, transport, generation, thread_cancel);
            // Dropping the claim marks the loop as stopped (an unwind drops it
            // too). Release it before reporting the loss so a reconnect can
            // poll again.
            drop(claim);
            if lost {
                if let Some(inner) = inner.upgrade() {
                    inner.connection_lost(generation);
                }
            }
        })?;
    Ok(PollingTask { cancel, thread })
}

/// Returns true when the loop ended because the device went away.
fn run(
    inner: &Weak<Inner>,
    transport: Arc<dyn Transport>,
    generation: u64,
    cancel: CancelSignal,
) -> bool {
    debug!(generation, "polling loop started");
    let mut lost = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match inner.upgrade() {
            Some(inner) if inner.is_current(generation) => {}
            _ => break,
        }

        let frame = match transport.read(&cancel, None) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(TransportError::Disconnected) => {
                debug!("polling read found the device gone");
                lost = true;
                break;
            }
            Err(err) => {
                debug!(%err, "polling read ended");
                break;
            }
        };
        // A frame that raced a cancel is dropped unapplied.
        if cancel.is_cancelled() {
            break;
        }
        if frame.is_empty() {
            continue;
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply(generation, decode(&frame));
    }

    debug!(generation, lost, "polling loop stopped");
    lost
}
