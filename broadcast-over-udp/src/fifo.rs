//! FIFO broadcast: per-sender delivery in send order.
//!
//! URB may hand messages up in any order.  The delivery task buckets them by
//! sender and releases each sender's messages strictly in sequence, starting
//! at 1 and never skipping a number.  No order is imposed across senders.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc;

use crate::flow::{BroadcastError, SendGate};
use crate::output::DeliveryLog;
use crate::packet::{BroadcastMessage, MessageId, PeerId};
use crate::urb::{UniformReliableBroadcast, UrbHandle};

/// Per-sender reordering buffer.
#[derive(Debug, Default)]
struct FifoOrder {
    next_expected: HashMap<PeerId, u64>,
    waiting: HashMap<PeerId, BTreeSet<u64>>,
}

impl FifoOrder {
    /// Buffer `batch` and return everything that became deliverable, in
    /// per-sender order.
    fn accept(&mut self, batch: impl IntoIterator<Item = MessageId>) -> Vec<MessageId> {
        let mut touched = BTreeSet::new();
        for id in batch {
            let next = *self.next_expected.get(&id.sender).unwrap_or(&1);
            if id.seq < next {
                continue;
            }
            self.waiting.entry(id.sender).or_default().insert(id.seq);
            touched.insert(id.sender);
        }

        let mut ready = Vec::new();
        for sender in touched {
            let next = self.next_expected.entry(sender).or_insert(1);
            let Some(waiting) = self.waiting.get_mut(&sender) else {
                continue;
            };
            while waiting.remove(next) {
                ready.push(MessageId::new(sender, *next));
                *next += 1;
            }
        }
        ready
    }
}

/// Broadcasting side of FIFO broadcast.  Sequence numbers start at 1.
pub struct FifoSender {
    urb: UrbHandle,
    gate: SendGate,
    log: DeliveryLog,
    next_seq: u64,
}

impl FifoSender {
    /// Wait for send-window room, then broadcast the next message.
    ///
    /// The `b` log entry is written before the message reaches URB.
    pub async fn broadcast_next(&mut self) -> Result<u64, BroadcastError> {
        let seq = self.next_seq;
        self.gate.admit(seq).await?;
        self.log.record_broadcast(seq);
        self.urb.broadcast(seq, None)?;
        self.next_seq += 1;
        log::debug!("[fifo] broadcast {seq}");
        Ok(seq)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// A running FIFO broadcast layer.
pub struct FifoBroadcast {
    pub sender: FifoSender,
    pub deliveries: mpsc::UnboundedReceiver<MessageId>,
}

impl FifoBroadcast {
    pub fn spawn(urb: UniformReliableBroadcast, log: DeliveryLog) -> Self {
        let UniformReliableBroadcast { handle, deliveries } = urb;
        let (up_tx, up_rx) = mpsc::unbounded_channel();

        tokio::spawn(delivery_loop(deliveries, up_tx, log.clone()));

        Self {
            sender: FifoSender {
                gate: handle.link().gate(),
                urb: handle,
                log,
                next_seq: 1,
            },
            deliveries: up_rx,
        }
    }
}

async fn delivery_loop(
    mut rx: mpsc::UnboundedReceiver<BroadcastMessage>,
    up: mpsc::UnboundedSender<MessageId>,
    log: DeliveryLog,
) {
    let mut order = FifoOrder::default();
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first.id];
        while let Ok(message) = rx.try_recv() {
            batch.push(message.id);
        }

        for id in order.accept(batch) {
            log.record_delivery(id);
            log::debug!("[fifo] deliver {id}");
            if up.send(id).is_err() {
                log::debug!("[fifo] application gone");
            }
        }
    }
}
