//! Causal broadcast over URB using vector clocks.
//!
//! Each process keeps two clocks, each entry the next expected sequence
//! number from that process:
//!
//! - `send`: what outgoing messages must reflect.  Only deliveries from the
//!   configured influence set advance it.
//! - `rec`: what has been delivered from each sender; the delivery gate.
//!
//! A message stamped `W` is deliverable once `W[i] <= rec[i]` for every `i`.
//! Stamping and delivery both run under the one clock lock, and both append
//! to the event log while holding it, so the log never shows a causal edge
//! that did not exist when the message was stamped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::flow::{BroadcastError, SendGate};
use crate::output::DeliveryLog;
use crate::packet::{BroadcastMessage, MessageId, PeerId, VectorClock};
use crate::sync::lock;
use crate::urb::{UniformReliableBroadcast, UrbHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Clocks {
    send: VectorClock,
    rec: VectorClock,
}

struct CausalState {
    local_id: PeerId,
    influences: BTreeSet<PeerId>,
    clocks: Mutex<Clocks>,
    log: DeliveryLog,
}

impl CausalState {
    fn new(
        local_id: PeerId,
        group_size: usize,
        influences: BTreeSet<PeerId>,
        log: DeliveryLog,
    ) -> Self {
        Self {
            local_id,
            influences,
            clocks: Mutex::new(Clocks {
                send: VectorClock::new(group_size),
                rec: VectorClock::new(group_size),
            }),
            log,
        }
    }

    fn group_size(&self) -> usize {
        lock(&self.clocks).rec.len()
    }

    /// Stamp `seq`, log it as broadcast, and hand it to `send`, all under the
    /// clock lock.
    fn stamp_and_send<F>(&self, seq: u64, send: F) -> Result<(), BroadcastError>
    where
        F: FnOnce(VectorClock) -> Result<(), BroadcastError>,
    {
        let clocks = lock(&self.clocks);
        let mut stamp = clocks.send.clone();
        stamp.set(self.local_id, seq);
        self.log.record_broadcast(seq);
        send(stamp)
    }
}

/// Messages waiting for their causal past, by sender then sequence number.
#[derive(Debug, Default)]
struct CausalOrder {
    waiting: BTreeMap<PeerId, BTreeMap<u64, VectorClock>>,
}

impl CausalOrder {
    fn accept(&mut self, state: &CausalState, batch: Vec<BroadcastMessage>) -> Vec<MessageId> {
        let size = state.group_size();
        for message in batch {
            match message.clock {
                Some(clock) if clock.len() == size => {
                    self.waiting
                        .entry(message.id.sender)
                        .or_default()
                        .insert(message.id.seq, clock);
                }
                Some(clock) => log::warn!(
                    "[causal] dropping {}: clock has {} entries, group has {size}",
                    message.id,
                    clock.len()
                ),
                None => log::warn!("[causal] dropping {}: no vector clock", message.id),
            }
        }
        self.deliver_ready(state)
    }

    /// Deliver until no waiting message is deliverable.
    fn deliver_ready(&mut self, state: &CausalState) -> Vec<MessageId> {
        let mut delivered = Vec::new();
        let mut clocks = lock(&state.clocks);
        loop {
            let before = delivered.len();
            for (&sender, waiting) in self.waiting.iter_mut() {
                waiting.retain(|&seq, stamp| {
                    if !stamp.is_covered_by(&clocks.rec) {
                        return true;
                    }
                    clocks.rec.increment(sender);
                    if state.influences.contains(&sender) {
                        clocks.send.increment(sender);
                    }
                    let id = MessageId::new(sender, seq);
                    state.log.record_delivery(id);
                    delivered.push(id);
                    false
                });
            }
            if delivered.len() == before {
                break;
            }
        }
        self.waiting.retain(|_, waiting| !waiting.is_empty());
        delivered
    }
}

/// Broadcasting side of causal broadcast.  Sequence numbers start at 1.
pub struct CausalSender {
    urb: UrbHandle,
    gate: SendGate,
    state: Arc<CausalState>,
    next_seq: u64,
}

impl CausalSender {
    /// Wait for send-window room, then stamp and broadcast the next message.
    pub async fn broadcast_next(&mut self) -> Result<u64, BroadcastError> {
        let seq = self.next_seq;
        self.gate.admit(seq).await?;
        let urb = &self.urb;
        self.state
            .stamp_and_send(seq, |stamp| urb.broadcast(seq, Some(stamp)))?;
        self.next_seq += 1;
        log::debug!("[causal] broadcast {seq}");
        Ok(seq)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// A running causal broadcast layer.
pub struct CausalBroadcast {
    pub sender: CausalSender,
    pub deliveries: mpsc::UnboundedReceiver<MessageId>,
}

impl CausalBroadcast {
    /// `influences` lists the processes whose deliveries this process's
    /// broadcasts must reflect.
    pub fn spawn(
        urb: UniformReliableBroadcast,
        influences: BTreeSet<PeerId>,
        log: DeliveryLog,
    ) -> Self {
        let UniformReliableBroadcast { handle, deliveries } = urb;
        let (up_tx, up_rx) = mpsc::unbounded_channel();

        log::info!(
            "[causal] process {} influenced by {:?}",
            handle.local_id(),
            influences
        );
        let state = Arc::new(CausalState::new(
            handle.local_id(),
            handle.group_size(),
            influences,
            log,
        ));
        tokio::spawn(delivery_loop(Arc::clone(&state), deliveries, up_tx));

        Self {
            sender: CausalSender {
                gate: handle.link().gate(),
                urb: handle,
                state,
                next_seq: 1,
            },
            deliveries: up_rx,
        }
    }
}

async fn delivery_loop(
    state: Arc<CausalState>,
    mut rx: mpsc::UnboundedReceiver<BroadcastMessage>,
    up: mpsc::UnboundedSender<MessageId>,
) {
    let mut order = CausalOrder::default();
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(message) = rx.try_recv() {
            batch.push(message);
        }

        for id in order.accept(&state, batch) {
            log::debug!("[causal] deliver {id}");
            if up.send(id).is_err() {
                log::debug!("[causal] application gone");
            }
        }
    }
}
