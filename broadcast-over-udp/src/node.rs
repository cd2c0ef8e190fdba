//! One process of the group: the full stack wired bottom-up.
//!
//! ```text
//!   Broadcaster (FIFO | Causal)
//!        │ urb.broadcast            ▲ Delivery
//!        ▼                          │
//!   UniformReliableBroadcast ───────┘
//!        │ link.send                ▲ WireMessage
//!        ▼                          │
//!   ReliableLink ◀──── Arc<Socket> ─┘
//! ```

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::causal::{CausalBroadcast, CausalSender};
use crate::config::{AddressBook, BroadcastConfig, LinkConfig};
use crate::fifo::{FifoBroadcast, FifoSender};
use crate::flow::BroadcastError;
use crate::link::{LinkHandle, ReliableLink};
use crate::output::DeliveryLog;
use crate::packet::{MessageId, PeerId};
use crate::simulator::SimulatorConfig;
use crate::socket::{Socket, SocketError};
use crate::urb::UniformReliableBroadcast;

/// An application-level delivery: who sent it and its sequence number.
pub type Delivery = MessageId;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("process {0} is not in the peer directory")]
    UnknownLocalId(PeerId),
    #[error("process {0} has no resolvable address")]
    Unresolved(PeerId),
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Which ordering layer runs above URB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Fifo,
    Causal { influences: BTreeSet<PeerId> },
}

impl Mode {
    pub fn causal_from(config: &BroadcastConfig) -> Self {
        Mode::Causal {
            influences: config.influences.clone(),
        }
    }
}

/// Broadcasting side of whichever ordering layer the node runs.
pub enum Broadcaster {
    Fifo(FifoSender),
    Causal(CausalSender),
}

impl Broadcaster {
    pub async fn broadcast_next(&mut self) -> Result<u64, BroadcastError> {
        match self {
            Broadcaster::Fifo(sender) => sender.broadcast_next().await,
            Broadcaster::Causal(sender) => sender.broadcast_next().await,
        }
    }

    pub fn next_seq(&self) -> u64 {
        match self {
            Broadcaster::Fifo(sender) => sender.next_seq(),
            Broadcaster::Causal(sender) => sender.next_seq(),
        }
    }
}

pub struct Node {
    pub local_id: PeerId,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
    pub log: DeliveryLog,
    pub link: LinkHandle,
}

impl Node {
    /// Bind the UDP socket `local_id` listens on, on every interface.
    pub async fn bind(
        book: &AddressBook,
        local_id: PeerId,
        faults: Option<SimulatorConfig>,
    ) -> Result<Socket, NodeError> {
        if !book.ids().any(|id| id == local_id) {
            return Err(NodeError::UnknownLocalId(local_id));
        }
        let own = book.addr(local_id).ok_or(NodeError::Unresolved(local_id))?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, own.port()));
        let socket = match faults {
            Some(faults) => Socket::bind_with_faults(addr, faults).await?,
            None => Socket::bind(addr).await?,
        };
        Ok(socket)
    }

    /// Wire the stack and hand back the broadcaster for the caller to drive.
    pub fn assemble(
        socket: Arc<Socket>,
        book: AddressBook,
        local_id: PeerId,
        link_config: LinkConfig,
        mode: Mode,
    ) -> (Self, Broadcaster) {
        let link = ReliableLink::spawn(socket, local_id, book, link_config);
        let link_handle = link.handle.clone();
        let urb = UniformReliableBroadcast::spawn(link);
        let log = DeliveryLog::new();

        let (broadcaster, deliveries) = match mode {
            Mode::Fifo => {
                let fifo = FifoBroadcast::spawn(urb, log.clone());
                (Broadcaster::Fifo(fifo.sender), fifo.deliveries)
            }
            Mode::Causal { influences } => {
                let causal = CausalBroadcast::spawn(urb, influences, log.clone());
                (Broadcaster::Causal(causal.sender), causal.deliveries)
            }
        };

        let node = Self {
            local_id,
            deliveries,
            log,
            link: link_handle,
        };
        (node, broadcaster)
    }

    /// Wire the stack and broadcast `messages` messages in the background.
    ///
    /// The returned receiver fires once every message has been handed to
    /// the broadcast layer.
    pub fn start(
        socket: Socket,
        book: AddressBook,
        local_id: PeerId,
        link_config: LinkConfig,
        messages: u64,
        mode: Mode,
    ) -> (Self, oneshot::Receiver<u64>) {
        let (node, mut broadcaster) =
            Self::assemble(Arc::new(socket), book, local_id, link_config, mode);
        let (finished_tx, finished_rx) = oneshot::channel();

        tokio::spawn(async move {
            log::info!("[node] process {local_id} broadcasting {messages} messages");
            for _ in 0..messages {
                if let Err(e) = broadcaster.broadcast_next().await {
                    log::error!(
                        "[node] broadcasting stopped at {}: {e}",
                        broadcaster.next_seq()
                    );
                    return;
                }
            }
            log::info!("[node] process {local_id} finished broadcasting");
            let _ = finished_tx.send(messages);
        });

        (node, finished_rx)
    }
}
