//! Broadcast send-window gate.
//!
//! The link's ack checker publishes a *ceiling*: the largest sequence number
//! any peer's original-traffic window currently admits.  Broadcasters wait on
//! a [`SendGate`] until their next sequence number fits under it, so local
//! broadcasting runs no further ahead than the fastest peer can absorb.
//!
//! ```text
//!   AckChecker ──raise(upper)──▶ watch<u64> ──wait_for(seq <= c)──▶ broadcaster
//! ```

use thiserror::Error;
use tokio::sync::watch;

/// Errors a broadcaster can hit while handing messages down the stack.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BroadcastError {
    /// The ack checker that drives the ceiling has stopped.
    #[error("send window ceiling closed")]
    WindowClosed,
    /// The layer below no longer accepts messages.
    #[error("lower layer closed")]
    LowerLayerClosed,
}

/// Producer side of the ceiling; owned by the link's ack checker.
#[derive(Debug)]
pub struct SendCeiling {
    tx: watch::Sender<u64>,
}

impl SendCeiling {
    pub fn new(initial: u64) -> (Self, SendGate) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, SendGate { rx })
    }

    /// Raise the ceiling to `ceiling`; lower values are ignored.
    ///
    /// Waiters are woken only when the value actually grew.
    pub fn raise(&self, ceiling: u64) -> bool {
        self.tx.send_if_modified(|current| {
            if ceiling > *current {
                *current = ceiling;
                true
            } else {
                false
            }
        })
    }
}

/// Consumer side of the ceiling; one per broadcaster.
#[derive(Debug, Clone)]
pub struct SendGate {
    rx: watch::Receiver<u64>,
}

impl SendGate {
    /// Wait until `seq` is at or below the published ceiling.
    pub async fn admit(&mut self, seq: u64) -> Result<(), BroadcastError> {
        self.rx
            .wait_for(|ceiling| seq <= *ceiling)
            .await
            .map(|_| ())
            .map_err(|_| BroadcastError::WindowClosed)
    }

    pub fn ceiling(&self) -> u64 {
        *self.rx.borrow()
    }
}
