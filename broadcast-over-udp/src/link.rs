//! Reliable point-to-point link over the shared UDP socket.
//!
//! # Architecture
//!
//! ```text
//!   URB ──send()──▶ send_tx ─┐                        ┌──▶ deliveries (to URB)
//!                            ▼                        │
//!                      ┌───────────┐           ┌──────┴──────┐
//!        resend ─────▶ │ send_loop │           │ receive_loop│◀── Socket
//!          ▲           └─────┬─────┘           └──────┬──────┘
//!          │                 │ Data,r<k>              │ AckEvent
//!          │                 ▼                        ▼
//!          │              Socket               ┌─────────────┐
//!          └───────────────────────────────────│ AckChecker  │──▶ SendCeiling
//!                                              └─────────────┘
//! ```
//!
//! Every destination peer has two [`CongestionWindow`]s, one per
//! [`TrafficClass`].  Original sends use the message's own sequence number as
//! the window sequence number; relays get a per-destination link sequence
//! number the first time they are sent, kept for the life of the process.
//!
//! Each transmission of a packet appends a timestamp to its history and is
//! tagged `r<k>` with `k` the attempt index, so an ack names exactly which
//! attempt round-tripped.  Inbound data is deduplicated on exact content and
//! always acknowledged.
//!
//! Three tasks share the state below: the send loop, the receive loop, and
//! the ack checker.  No lock is ever held across an `.await`, and no two of
//! the locks (`families[_]`, `outstanding`) are held at once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Notify};

use crate::config::{AddressBook, LinkConfig};
use crate::flow::{BroadcastError, SendCeiling, SendGate};
use crate::packet::{Datagram, OutboundPacket, PeerId, TrafficClass, WireMessage};
use crate::socket::{Socket, SocketError};
use crate::sync::lock;
use crate::timer::RttEstimator;
use crate::window::{CongestionWindow, WindowSnapshot};

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Running counters for one link.
#[derive(Debug, Default)]
pub struct LinkStats {
    datagrams_sent: AtomicU64,
    retransmissions: AtomicU64,
    timeout_shrinks: AtomicU64,
    duplicate_ack_shrinks: AtomicU64,
    acks_received: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatsSnapshot {
    /// Data datagrams handed to the socket, first attempts included.
    pub datagrams_sent: u64,
    /// Data datagrams sent with a retransmission index above zero.
    pub retransmissions: u64,
    pub timeout_shrinks: u64,
    pub duplicate_ack_shrinks: u64,
    pub acks_received: u64,
}

impl LinkStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            timeout_shrinks: self.timeout_shrinks.load(Ordering::Relaxed),
            duplicate_ack_shrinks: self.duplicate_ack_shrinks.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// The windows of one traffic class, one per destination peer.
#[derive(Debug)]
struct WindowFamily {
    class: TrafficClass,
    windows: HashMap<PeerId, CongestionWindow>,
    /// Relay class only: link sequence number of each relayed message.
    relay_seqs: HashMap<PeerId, HashMap<WireMessage, u64>>,
    last_relay_seq: HashMap<PeerId, u64>,
}

impl WindowFamily {
    fn new(class: TrafficClass, peers: &[PeerId], config: &LinkConfig) -> Self {
        let windows = peers
            .iter()
            .map(|&peer| {
                let window = CongestionWindow::new(
                    config.base_window,
                    config.initial_threshold,
                    config.max_window,
                );
                (peer, window)
            })
            .collect();
        Self {
            class,
            windows,
            relay_seqs: HashMap::new(),
            last_relay_seq: HashMap::new(),
        }
    }

    /// Window sequence number of `message` toward `peer`, assigning the next
    /// free one to a relay sent there for the first time.
    fn assign(&mut self, peer: PeerId, message: &WireMessage) -> u64 {
        if self.class == TrafficClass::Original {
            return message.id.seq;
        }
        let seqs = self.relay_seqs.entry(peer).or_default();
        if let Some(&seq) = seqs.get(message) {
            return seq;
        }
        let last = self.last_relay_seq.entry(peer).or_insert(0);
        *last += 1;
        seqs.insert(message.clone(), *last);
        *last
    }

    /// Window sequence number already associated with `message`, if any.
    fn lookup(&self, peer: PeerId, message: &WireMessage) -> Option<u64> {
        match self.class {
            TrafficClass::Original => Some(message.id.seq),
            TrafficClass::Relay => self.relay_seqs.get(&peer)?.get(message).copied(),
        }
    }

    /// `true` when the window has acknowledged `message`, or cannot know it.
    fn is_acked(&self, peer: PeerId, message: &WireMessage) -> bool {
        match (self.lookup(peer, message), self.windows.get(&peer)) {
            (Some(seq), Some(window)) => window.already_acked(seq),
            _ => true,
        }
    }
}

/// An unacknowledged packet and its transmission history.
#[derive(Debug)]
struct Outstanding {
    class: TrafficClass,
    /// One timestamp per attempt; index `k` is attempt `r<k>`.
    sent_at: Vec<Instant>,
    /// A retransmission is already waiting in the send queue.
    queued: bool,
}

impl Outstanding {
    fn new(class: TrafficClass) -> Self {
        Self {
            class,
            sent_at: Vec::new(),
            queued: false,
        }
    }

    fn is_expired(&self, now: Instant, rto: Duration) -> bool {
        !self.queued
            && self
                .sent_at
                .last()
                .is_some_and(|sent| now.saturating_duration_since(*sent) >= rto)
    }
}

struct Shared {
    local_id: PeerId,
    socket: Arc<Socket>,
    book: AddressBook,
    config: LinkConfig,
    /// Indexed by [`TrafficClass::index`].
    families: [Mutex<WindowFamily>; 2],
    outstanding: Mutex<HashMap<PeerId, HashMap<WireMessage, Outstanding>>>,
    /// Woken by the ack checker after windows move.
    window_moved: Notify,
    stats: LinkStats,
}

impl Shared {
    fn new(
        socket: Arc<Socket>,
        local_id: PeerId,
        book: AddressBook,
        config: LinkConfig,
        peers: &[PeerId],
    ) -> Self {
        Self {
            local_id,
            socket,
            families: [
                Mutex::new(WindowFamily::new(TrafficClass::Original, peers, &config)),
                Mutex::new(WindowFamily::new(TrafficClass::Relay, peers, &config)),
            ],
            outstanding: Mutex::new(HashMap::new()),
            window_moved: Notify::new(),
            stats: LinkStats::default(),
            book,
            config,
        }
    }

    fn family(&self, class: TrafficClass) -> MutexGuard<'_, WindowFamily> {
        lock(&self.families[class.index()])
    }
}

// ---------------------------------------------------------------------------
// ReliableLink
// ---------------------------------------------------------------------------

/// A running link: the handle used to send plus the stream of deduplicated
/// inbound messages.
pub struct ReliableLink {
    pub handle: LinkHandle,
    pub deliveries: mpsc::UnboundedReceiver<WireMessage>,
}

impl ReliableLink {
    /// Spawn the send, receive, and ack-checker tasks on `socket`.
    ///
    /// `book` lists every process in the group, the local one included.
    pub fn spawn(
        socket: Arc<Socket>,
        local_id: PeerId,
        book: AddressBook,
        config: LinkConfig,
    ) -> Self {
        let peers: Vec<PeerId> = book.ids().filter(|&id| id != local_id).collect();
        let shared = Arc::new(Shared::new(socket, local_id, book, config, &peers));

        // Alone in the group: nothing to wait for.
        let initial_ceiling = if peers.is_empty() {
            u64::MAX
        } else {
            shared.config.base_window
        };
        let (ceiling, gate) = SendCeiling::new(initial_ceiling);

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let checker = AckChecker::new(
            Arc::clone(&shared),
            &peers,
            ack_rx,
            send_tx.clone(),
            ceiling,
        );
        let rto_rx = checker.rto_ceiling.subscribe();

        tokio::spawn(send_loop(Arc::clone(&shared), send_rx, rto_rx));
        tokio::spawn(receive_loop(Arc::clone(&shared), deliver_tx, ack_tx));
        tokio::spawn(checker.run());

        log::info!(
            "[link] process {local_id} on {} with {} peers",
            shared.socket.local_addr,
            peers.len()
        );

        Self {
            handle: LinkHandle {
                shared,
                peers: peers.into(),
                send_tx,
                gate,
            },
            deliveries: deliver_rx,
        }
    }
}

/// Cloneable sending side of a [`ReliableLink`].
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
    peers: Arc<[PeerId]>,
    send_tx: mpsc::UnboundedSender<OutboundPacket>,
    gate: SendGate,
}

impl LinkHandle {
    /// Queue `message` for reliable delivery to `dest`.
    pub fn send(&self, message: WireMessage, dest: PeerId) -> Result<(), BroadcastError> {
        self.send_tx
            .send(OutboundPacket::new(message, dest))
            .map_err(|_| BroadcastError::LowerLayerClosed)
    }

    pub fn local_id(&self) -> PeerId {
        self.shared.local_id
    }

    /// Every other process in the group.
    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    /// Number of processes in the group, the local one included.
    pub fn group_size(&self) -> usize {
        self.shared.book.len()
    }

    /// A gate on the broadcast send-window ceiling this link maintains.
    pub fn gate(&self) -> SendGate {
        self.gate.clone()
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn window_snapshot(&self, peer: PeerId, class: TrafficClass) -> Option<WindowSnapshot> {
        self.shared
            .family(class)
            .windows
            .get(&peer)
            .map(CongestionWindow::snapshot)
    }
}

// ---------------------------------------------------------------------------
// Send loop
// ---------------------------------------------------------------------------

/// Packets of one class waiting for window space, in arrival order.
#[derive(Default)]
struct SendBuffer {
    queue: Vec<OutboundPacket>,
    members: HashSet<OutboundPacket>,
}

impl SendBuffer {
    fn push(&mut self, packet: OutboundPacket) {
        if self.members.insert(packet.clone()) {
            self.queue.push(packet);
        }
    }
}

async fn send_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<OutboundPacket>,
    rto_ceiling: watch::Receiver<Duration>,
) {
    let mut buffers: [SendBuffer; 2] = Default::default();

    loop {
        let wait = *rto_ceiling.borrow();
        tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => {
                    accept(&shared, &mut buffers, packet);
                    while let Ok(packet) = rx.try_recv() {
                        accept(&shared, &mut buffers, packet);
                    }
                }
                None => {
                    log::debug!("[link] send queue closed; sender stopping");
                    return;
                }
            },
            _ = shared.window_moved.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }

        for class in TrafficClass::ALL {
            flush(&shared, &mut buffers[class.index()], class).await;
        }
    }
}

fn accept(shared: &Shared, buffers: &mut [SendBuffer; 2], packet: OutboundPacket) {
    if packet.dest == shared.local_id {
        return;
    }
    if shared.book.addr(packet.dest).is_none() {
        log::debug!(
            "[link] no address for peer {}; skipping {}",
            packet.dest,
            packet.message
        );
        return;
    }
    buffers[packet.class.index()].push(packet);
}

/// Transmit every buffered packet its window admits; drop the acknowledged.
async fn flush(shared: &Shared, buffer: &mut SendBuffer, class: TrafficClass) {
    let mut ready = Vec::new();
    let mut stale = Vec::new();
    {
        let mut family = shared.family(class);
        buffer.queue.retain(|packet| {
            let seq = family.assign(packet.dest, &packet.message);
            let Some(window) = family.windows.get(&packet.dest) else {
                stale.push(packet.clone());
                return false;
            };
            if window.can_send(seq) {
                ready.push(packet.clone());
                false
            } else if window.already_acked(seq) {
                stale.push(packet.clone());
                false
            } else {
                true
            }
        });
    }

    for packet in ready.iter().chain(&stale) {
        buffer.members.remove(packet);
    }

    if !stale.is_empty() {
        let mut outstanding = lock(&shared.outstanding);
        for packet in &stale {
            if let Some(entries) = outstanding.get_mut(&packet.dest) {
                entries.remove(&packet.message);
            }
        }
    }

    for packet in ready {
        transmit(shared, packet).await;
    }
}

async fn transmit(shared: &Shared, packet: OutboundPacket) {
    let Some(addr) = shared.book.addr(packet.dest) else {
        return;
    };

    let retransmission = {
        let mut outstanding = lock(&shared.outstanding);
        let entry = outstanding
            .entry(packet.dest)
            .or_default()
            .entry(packet.message.clone())
            .or_insert_with(|| Outstanding::new(packet.class));
        entry.queued = false;
        entry.sent_at.push(Instant::now());
        (entry.sent_at.len() - 1) as u32
    };

    let datagram = Datagram::Data {
        message: packet.message,
        retransmission,
    };
    match shared.socket.send_to(&datagram, addr).await {
        Ok(()) => {
            LinkStats::bump(&shared.stats.datagrams_sent);
            if retransmission > 0 {
                LinkStats::bump(&shared.stats.retransmissions);
            }
            log::debug!("[link] → {datagram} to peer {}", packet.dest);
        }
        Err(e) => log::warn!("[link] send to peer {} failed: {e}", packet.dest),
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

/// An acknowledgement handed from the receive loop to the ack checker.
#[derive(Debug)]
struct AckEvent {
    acker: PeerId,
    retransmission: u32,
    message: WireMessage,
    received_at: Instant,
}

async fn receive_loop(
    shared: Arc<Shared>,
    deliver: mpsc::UnboundedSender<WireMessage>,
    acks: mpsc::UnboundedSender<AckEvent>,
) {
    let mut seen: HashSet<WireMessage> = HashSet::new();

    loop {
        let (datagram, from) = match shared.socket.recv_from().await {
            Ok(received) => received,
            Err(SocketError::Packet { from, source }) => {
                log::warn!("[link] dropping undecodable datagram from {from}: {source}");
                continue;
            }
            Err(e) => {
                log::warn!("[link] receive failed: {e}");
                continue;
            }
        };
        let received_at = Instant::now();

        match datagram {
            Datagram::Data {
                message,
                retransmission,
            } => {
                if seen.insert(message.clone()) && deliver.send(message.clone()).is_err() {
                    log::debug!("[link] upper layer gone; {message} not delivered");
                }
                let ack = Datagram::Ack {
                    acker: shared.local_id,
                    retransmission,
                    message,
                };
                if let Err(e) = shared.socket.send_to(&ack, from).await {
                    log::warn!("[link] ack to {from} failed: {e}");
                }
            }
            Datagram::Ack {
                acker,
                retransmission,
                message,
            } => {
                let event = AckEvent {
                    acker,
                    retransmission,
                    message,
                    received_at,
                };
                if acks.send(event).is_err() {
                    log::debug!("[link] ack checker gone; receiver stopping");
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ack checker
// ---------------------------------------------------------------------------

/// Duplicate acks seen for one packet.
#[derive(Debug, Clone, Copy)]
struct DuplicateAcks {
    count: u32,
    last_seen: Instant,
}

struct AckChecker {
    shared: Arc<Shared>,
    acks: mpsc::UnboundedReceiver<AckEvent>,
    resend: mpsc::UnboundedSender<OutboundPacket>,
    ceiling: SendCeiling,
    rto_ceiling: watch::Sender<Duration>,
    initial_rto: Duration,
    estimators: HashMap<PeerId, RttEstimator>,
    /// Per (acker, packet); forgotten after `max_rto` without another.
    duplicate_acks: HashMap<(PeerId, WireMessage), DuplicateAcks>,
    /// (peer, class) pairs whose last timeout was forgiven.
    second_chance: HashSet<(PeerId, TrafficClass)>,
}

impl AckChecker {
    fn new(
        shared: Arc<Shared>,
        peers: &[PeerId],
        acks: mpsc::UnboundedReceiver<AckEvent>,
        resend: mpsc::UnboundedSender<OutboundPacket>,
        ceiling: SendCeiling,
    ) -> Self {
        let timer = shared.config.timer();
        let estimators = peers
            .iter()
            .map(|&peer| (peer, RttEstimator::new(timer)))
            .collect();
        let initial_rto = RttEstimator::new(timer).rto();
        let (rto_ceiling, _) = watch::channel(initial_rto);
        Self {
            shared,
            acks,
            resend,
            ceiling,
            rto_ceiling,
            initial_rto,
            estimators,
            duplicate_acks: HashMap::new(),
            second_chance: HashSet::new(),
        }
    }

    async fn run(mut self) {
        loop {
            let wait = self.global_rto();
            match tokio::time::timeout(wait, self.acks.recv()).await {
                Ok(Some(ack)) => {
                    self.on_ack(ack);
                    while let Ok(ack) = self.acks.try_recv() {
                        self.on_ack(ack);
                    }
                    self.raise_ceiling();
                    self.shared.window_moved.notify_one();
                }
                Ok(None) => {
                    log::debug!("[link] ack channel closed; checker stopping");
                    return;
                }
                Err(_elapsed) => {}
            }
            self.rto_ceiling.send_replace(self.global_rto());
            let now = Instant::now();
            self.forget_quiet_duplicates(now);
            self.scan_timeouts(now);
        }
    }

    fn global_rto(&self) -> Duration {
        self.estimators
            .values()
            .map(RttEstimator::rto)
            .max()
            .unwrap_or(self.initial_rto)
    }

    fn on_ack(&mut self, ack: AckEvent) {
        let AckEvent {
            acker,
            retransmission,
            message,
            received_at,
        } = ack;
        let class = message.class();
        LinkStats::bump(&self.shared.stats.acks_received);

        let duplicate = {
            let mut family = self.shared.family(class);
            let Some(seq) = family.lookup(acker, &message) else {
                log::debug!("[link] ack from {acker} for unknown {message}");
                return;
            };
            let Some(window) = family.windows.get_mut(&acker) else {
                return;
            };
            if window.already_acked(seq) {
                let seen = self
                    .duplicate_acks
                    .entry((acker, message.clone()))
                    .or_insert(DuplicateAcks {
                        count: 0,
                        last_seen: received_at,
                    });
                seen.count += 1;
                seen.last_seen = received_at;
                let count = seen.count;
                if count >= self.shared.config.duplicate_ack_threshold {
                    window.on_duplicate_ack();
                    LinkStats::bump(&self.shared.stats.duplicate_ack_shrinks);
                    log::debug!(
                        "[link] duplicate ack #{count} from {acker} for {message}; {class} window now {}",
                        window.size()
                    );
                }
                true
            } else {
                if window.mark_acked(seq) {
                    window.on_successful_round_trip();
                }
                false
            }
        };

        let entry = lock(&self.shared.outstanding)
            .get_mut(&acker)
            .and_then(|entries| entries.remove(&message));
        if duplicate {
            return;
        }

        let sent = entry.and_then(|e| e.sent_at.get(retransmission as usize).copied());
        if let (Some(sent), Some(estimator)) = (sent, self.estimators.get_mut(&acker)) {
            estimator.record_rtt_sample(received_at.saturating_duration_since(sent));
        }
    }

    /// Publish the largest original-traffic upper bound across peers.
    fn raise_ceiling(&self) {
        let highest = self
            .shared
            .family(TrafficClass::Original)
            .windows
            .values()
            .map(CongestionWindow::upper_bound)
            .max();
        if let Some(highest) = highest {
            if self.ceiling.raise(highest) {
                log::debug!("[link] send ceiling raised to {highest}");
            }
        }
    }

    fn forget_quiet_duplicates(&mut self, now: Instant) {
        let quiet = self.shared.config.max_rto;
        self.duplicate_acks
            .retain(|_, seen| now.saturating_duration_since(seen.last_seen) < quiet);
    }

    fn scan_timeouts(&mut self, now: Instant) {
        let expired: Vec<(PeerId, TrafficClass, WireMessage)> = {
            let outstanding = lock(&self.shared.outstanding);
            outstanding
                .iter()
                .flat_map(|(&peer, entries)| {
                    let rto = self
                        .estimators
                        .get(&peer)
                        .map_or(self.initial_rto, RttEstimator::rto);
                    entries
                        .iter()
                        .filter(move |(_, entry)| entry.is_expired(now, rto))
                        .map(move |(message, entry)| (peer, entry.class, message.clone()))
                })
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        let mut stale = Vec::new();
        let mut resend = Vec::new();
        for class in TrafficClass::ALL {
            let mut family = self.shared.family(class);
            let mut by_peer: BTreeMap<PeerId, Vec<WireMessage>> = BTreeMap::new();
            for (peer, _, message) in expired.iter().filter(|(_, c, _)| *c == class) {
                // The window may have seen an ack whose duplicate was lost.
                if family.is_acked(*peer, message) {
                    stale.push((*peer, message.clone()));
                } else {
                    by_peer.entry(*peer).or_default().push(message.clone());
                }
            }

            for (peer, messages) in by_peer {
                if self.second_chance.insert((peer, class)) {
                    log::debug!(
                        "[link] {} {class} packets to peer {peer} timed out; second chance",
                        messages.len()
                    );
                    continue;
                }
                self.second_chance.remove(&(peer, class));
                if let Some(window) = family.windows.get_mut(&peer) {
                    window.on_timeout();
                }
                LinkStats::bump(&self.shared.stats.timeout_shrinks);
                log::warn!(
                    "[link] timeout toward peer {peer} ({class}); window reset, resending {}",
                    messages.len()
                );
                resend.extend(messages.into_iter().map(|m| OutboundPacket::new(m, peer)));
            }
        }

        {
            let mut outstanding = lock(&self.shared.outstanding);
            for (peer, message) in &stale {
                if let Some(entries) = outstanding.get_mut(peer) {
                    entries.remove(message);
                }
            }
            for packet in &resend {
                if let Some(entry) = outstanding
                    .get_mut(&packet.dest)
                    .and_then(|entries| entries.get_mut(&packet.message))
                {
                    entry.queued = true;
                }
            }
        }

        for packet in resend {
            if self.resend.send(packet).is_err() {
                return;
            }
        }
    }
}
