//! Uniform reliable broadcast on top of [`crate::link::ReliableLink`].
//!
//! A broadcast is sent as an original to every other process.  Whoever sees
//! a message for the first time floods it onward as a relay, so once any
//! correct process has it, all of them eventually do.  A message is
//! delivered when a strict majority of the group (`N/2 + 1`) is known to
//! have seen it: the local process, plus one for every distinct hop that
//! carried it here.
//!
//! ```text
//!   broadcast(seq) ─▶ broadcast_loop ─▶ link (Original)
//!   link deliveries ─▶ delivery_loop ─┬▶ link (Relay, first sighting)
//!                                     └▶ deliveries (majority reached)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::flow::BroadcastError;
use crate::link::{LinkHandle, ReliableLink};
use crate::packet::{BroadcastMessage, MessageId, PeerId, VectorClock, WireMessage};
use crate::sync::lock;

#[derive(Debug, Default)]
struct Ledger {
    /// Seen but not yet delivered.
    pending: HashMap<MessageId, BroadcastMessage>,
    /// Delivered; never shrinks.
    delivered: HashSet<MessageId>,
}

/// Majority-acknowledgment bookkeeping.
///
/// Lock order is `ledger` before `acks`.
#[derive(Debug)]
struct Agreement {
    majority: usize,
    ledger: Mutex<Ledger>,
    acks: Mutex<HashMap<MessageId, usize>>,
}

impl Agreement {
    fn new(group_size: usize) -> Self {
        Self {
            majority: group_size / 2 + 1,
            ledger: Mutex::new(Ledger::default()),
            acks: Mutex::new(HashMap::new()),
        }
    }

    /// Record messages this process is about to broadcast.
    fn register_own(&self, messages: &[BroadcastMessage]) {
        let mut ledger = lock(&self.ledger);
        let mut acks = lock(&self.acks);
        for message in messages {
            ledger.pending.insert(message.id, message.clone());
            acks.insert(message.id, 1);
        }
    }

    /// Count one more hop for the message `wire` carries.
    ///
    /// Returns the message when this is its first sighting and it must be
    /// relayed onward.
    fn observe(&self, wire: WireMessage) -> Option<BroadcastMessage> {
        let message = wire.into_broadcast();
        let mut ledger = lock(&self.ledger);
        if ledger.delivered.contains(&message.id) {
            return None;
        }
        let mut acks = lock(&self.acks);
        if ledger.pending.contains_key(&message.id) {
            *acks.entry(message.id).or_insert(1) += 1;
            return None;
        }
        // Ourselves plus the hop it arrived from.
        acks.insert(message.id, 2);
        ledger.pending.insert(message.id, message.clone());
        Some(message)
    }

    /// Move every pending message with a majority to delivered.
    fn take_deliverable(&self) -> Vec<BroadcastMessage> {
        let mut ledger = lock(&self.ledger);
        let mut acks = lock(&self.acks);
        let ready: Vec<MessageId> = ledger
            .pending
            .keys()
            .filter(|id| acks.get(id).copied().unwrap_or(0) >= self.majority)
            .copied()
            .collect();

        let mut out = Vec::with_capacity(ready.len());
        for id in ready {
            acks.remove(&id);
            if let Some(message) = ledger.pending.remove(&id) {
                ledger.delivered.insert(id);
                out.push(message);
            }
        }
        out
    }

    #[cfg(test)]
    fn ack_count(&self, id: &MessageId) -> usize {
        lock(&self.acks).get(id).copied().unwrap_or(0)
    }
}

struct Shared {
    link: LinkHandle,
    agreement: Agreement,
    up: mpsc::UnboundedSender<BroadcastMessage>,
}

impl Shared {
    fn send_to_peers(&self, wire: impl Fn() -> WireMessage) -> Result<(), BroadcastError> {
        for &peer in self.link.peers() {
            self.link.send(wire(), peer)?;
        }
        Ok(())
    }

    fn deliver_ready(&self) {
        for message in self.agreement.take_deliverable() {
            log::debug!("[urb] deliver {}", message.id);
            if self.up.send(message).is_err() {
                log::debug!("[urb] upper layer gone");
                return;
            }
        }
    }
}

/// A running URB instance.
pub struct UniformReliableBroadcast {
    pub handle: UrbHandle,
    pub deliveries: mpsc::UnboundedReceiver<BroadcastMessage>,
}

impl UniformReliableBroadcast {
    /// Spawn the broadcast and delivery tasks over `link`.
    pub fn spawn(link: ReliableLink) -> Self {
        let ReliableLink { handle, deliveries } = link;
        let (up_tx, up_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            agreement: Agreement::new(handle.group_size()),
            link: handle.clone(),
            up: up_tx,
        });
        log::info!(
            "[urb] process {} delivers on {} of {} acks",
            handle.local_id(),
            shared.agreement.majority,
            handle.group_size()
        );

        tokio::spawn(broadcast_loop(Arc::clone(&shared), broadcast_rx));
        tokio::spawn(delivery_loop(shared, deliveries));

        Self {
            handle: UrbHandle {
                link: handle,
                broadcast_tx,
            },
            deliveries: up_rx,
        }
    }
}

/// Cloneable broadcasting side of a [`UniformReliableBroadcast`].
#[derive(Clone)]
pub struct UrbHandle {
    link: LinkHandle,
    broadcast_tx: mpsc::UnboundedSender<BroadcastMessage>,
}

impl UrbHandle {
    /// Broadcast this process's message `seq`, optionally stamped with a
    /// causal clock.
    pub fn broadcast(&self, seq: u64, clock: Option<VectorClock>) -> Result<(), BroadcastError> {
        let id = MessageId::new(self.link.local_id(), seq);
        self.broadcast_tx
            .send(BroadcastMessage::new(id, clock))
            .map_err(|_| BroadcastError::LowerLayerClosed)
    }

    pub fn local_id(&self) -> PeerId {
        self.link.local_id()
    }

    pub fn group_size(&self) -> usize {
        self.link.group_size()
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }
}

async fn broadcast_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<BroadcastMessage>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(message) = rx.try_recv() {
            batch.push(message);
        }

        shared.agreement.register_own(&batch);
        for message in batch {
            let sent = shared.send_to_peers(|| WireMessage::original(message.clone()));
            if let Err(e) = sent {
                log::warn!("[urb] cannot broadcast {}: {e}", message.id);
                return;
            }
        }
        shared.deliver_ready();
    }
}

async fn delivery_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<WireMessage>) {
    let local_id = shared.link.local_id();
    while let Some(first) = rx.recv().await {
        let mut relays = Vec::new();
        relays.extend(shared.agreement.observe(first));
        while let Ok(wire) = rx.try_recv() {
            relays.extend(shared.agreement.observe(wire));
        }

        for message in relays {
            log::debug!("[urb] relay {}", message.id);
            let sent = shared.send_to_peers(|| WireMessage::relay(local_id, message.clone()));
            if let Err(e) = sent {
                log::warn!("[urb] cannot relay {}: {e}", message.id);
                return;
            }
        }
        shared.deliver_ready();
    }
}
