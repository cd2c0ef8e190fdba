//! Wire-format definitions for broadcast datagrams.
//!
//! Every datagram exchanged between processes is a [`Datagram`].  This module
//! is responsible for:
//! - Defining the message identity and the tagged message structure carried
//!   by every layer ([`MessageId`], [`WireMessage`], [`BroadcastMessage`]).
//! - Serialising a [`Datagram`] into the textual form sent on the socket.
//! - Deserialising a raw byte slice back into a [`Datagram`], returning errors
//!   for malformed input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! Datagrams are UTF-8 text.  A message is written as
//!
//! ```text
//!   original:  <senderId> <seq>[|<c1> <c2> ... <cN>]
//!   relay:     <relayerId> <senderId> <seq>[|<c1> <c2> ... <cN>]
//! ```
//!
//! where the optional `|`-suffix is the vector clock attached by causal
//! broadcast.  On the wire a message is framed as one of
//!
//! ```text
//!   data:  <message>,r<retransmitIndex>
//!   ack:   ACK <ackerId> r<retransmitIndex>:<message>
//! ```
//!
//! The retransmit index names the transmission attempt being acknowledged so
//! the sender can measure the round trip of exactly that attempt.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Process identifier.  Ids are dense `1..=N` and double as clock indices.
pub type PeerId = u32;

/// Prefix that marks an acknowledgement datagram.
const ACK_PREFIX: &str = "ACK ";

/// Separator between a data message and its retransmit index.
const RETRANSMIT_MARK: &str = ",r";

/// Separator between a message header and its vector clock.
const CLOCK_MARK: char = '|';

// ---------------------------------------------------------------------------
// Message identity
// ---------------------------------------------------------------------------

/// Identity of a broadcast message: who originated it and its sequence number.
///
/// Deduplication and acknowledgment accounting above the link layer use this
/// pair only; relay prefixes and vector clocks are not part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub sender: PeerId,
    pub seq: u64,
}

impl MessageId {
    pub fn new(sender: PeerId, seq: u64) -> Self {
        Self { sender, seq }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sender, self.seq)
    }
}

// ---------------------------------------------------------------------------
// VectorClock
// ---------------------------------------------------------------------------

/// Per-process counters, indexed by [`PeerId`] (1-based).
///
/// Each entry holds the *next expected* sequence number from that process,
/// so a fresh clock is all ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VectorClock(Vec<u64>);

impl VectorClock {
    /// A clock for `processes` processes with every entry set to 1.
    pub fn new(processes: usize) -> Self {
        Self(vec![1; processes])
    }

    pub fn from_entries(entries: Vec<u64>) -> Self {
        Self(entries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[u64] {
        &self.0
    }

    /// Overwrite the entry for process `id`.  Out-of-range ids are ignored.
    pub fn set(&mut self, id: PeerId, value: u64) {
        if let Some(entry) = slot(id).and_then(|i| self.0.get_mut(i)) {
            *entry = value;
        }
    }

    /// Increment the entry for process `id`.  Out-of-range ids are ignored.
    pub fn increment(&mut self, id: PeerId) {
        if let Some(entry) = slot(id).and_then(|i| self.0.get_mut(i)) {
            *entry += 1;
        }
    }

    /// `true` when every entry of `self` is `<=` the matching entry of
    /// `delivered`.  Clocks of different lengths never compare as covered.
    pub fn is_covered_by(&self, delivered: &VectorClock) -> bool {
        self.len() == delivered.len()
            && self.0.iter().zip(&delivered.0).all(|(w, v)| w <= v)
    }
}

fn slot(id: PeerId) -> Option<usize> {
    (id as usize).checked_sub(1)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message as handed between URB and the ordering layers: identity plus
/// the optional causal clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BroadcastMessage {
    pub id: MessageId,
    pub clock: Option<VectorClock>,
}

impl BroadcastMessage {
    pub fn new(id: MessageId, clock: Option<VectorClock>) -> Self {
        Self { id, clock }
    }
}

/// Traffic class of a link-level packet.
///
/// Original sends and URB relays travel the same wire path but keep separate
/// congestion windows and acknowledgment accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrafficClass {
    /// First transmission of a message by its originator.
    Original,
    /// A URB flood of somebody else's (or our own) message.
    Relay,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 2] = [TrafficClass::Original, TrafficClass::Relay];

    pub(crate) fn index(self) -> usize {
        match self {
            TrafficClass::Original => 0,
            TrafficClass::Relay => 1,
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficClass::Original => write!(f, "original"),
            TrafficClass::Relay => write!(f, "relay"),
        }
    }
}

/// A message as it travels on the link: the broadcast message plus the
/// optional id of the process that relayed it.
///
/// Equality covers every field.  The link deduplicates on exact content, so
/// the same broadcast relayed by two different processes is two distinct
/// link-level messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireMessage {
    pub relayer: Option<PeerId>,
    pub id: MessageId,
    pub clock: Option<VectorClock>,
}

impl WireMessage {
    /// The originator's own transmission of `message`.
    pub fn original(message: BroadcastMessage) -> Self {
        Self {
            relayer: None,
            id: message.id,
            clock: message.clock,
        }
    }

    /// `message` flooded onward by `relayer`.
    pub fn relay(relayer: PeerId, message: BroadcastMessage) -> Self {
        Self {
            relayer: Some(relayer),
            id: message.id,
            clock: message.clock,
        }
    }

    pub fn class(&self) -> TrafficClass {
        match self.relayer {
            None => TrafficClass::Original,
            Some(_) => TrafficClass::Relay,
        }
    }

    /// Strip the relay prefix, leaving the canonical broadcast message.
    pub fn into_broadcast(self) -> BroadcastMessage {
        BroadcastMessage {
            id: self.id,
            clock: self.clock,
        }
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(relayer) = self.relayer {
            write!(f, "{relayer} ")?;
        }
        write!(f, "{}", self.id)?;
        if let Some(clock) = &self.clock {
            write!(f, "{CLOCK_MARK}")?;
            for (i, entry) in clock.entries().iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{entry}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for WireMessage {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (header, clock) = match s.split_once(CLOCK_MARK) {
            Some((header, clock)) => (header, Some(parse_clock(clock)?)),
            None => (s, None),
        };

        let fields = header
            .split_whitespace()
            .map(parse_number)
            .collect::<Result<Vec<u64>, _>>()?;

        let (relayer, sender, seq) = match fields.as_slice() {
            [sender, seq] => (None, *sender, *seq),
            [relayer, sender, seq] => (Some(to_peer(*relayer)?), *sender, *seq),
            _ => return Err(PacketError::BadHeader(header.to_string())),
        };

        Ok(Self {
            relayer,
            id: MessageId::new(to_peer(sender)?, seq),
            clock,
        })
    }
}

fn parse_clock(s: &str) -> Result<VectorClock, PacketError> {
    let entries = s
        .split_whitespace()
        .map(parse_number)
        .collect::<Result<Vec<u64>, _>>()?;
    if entries.is_empty() {
        return Err(PacketError::EmptyClock);
    }
    Ok(VectorClock::from_entries(entries))
}

fn parse_number(token: &str) -> Result<u64, PacketError> {
    token
        .parse()
        .map_err(|_| PacketError::BadNumber(token.to_string()))
}

fn to_peer(value: u64) -> Result<PeerId, PacketError> {
    PeerId::try_from(value).map_err(|_| PacketError::BadNumber(value.to_string()))
}

/// A message queued on the link for one destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutboundPacket {
    pub message: WireMessage,
    pub dest: PeerId,
    pub class: TrafficClass,
}

impl OutboundPacket {
    pub fn new(message: WireMessage, dest: PeerId) -> Self {
        let class = message.class();
        Self {
            message,
            dest,
            class,
        }
    }
}

// ---------------------------------------------------------------------------
// Datagram
// ---------------------------------------------------------------------------

/// A complete link-level datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// A message transmission; `retransmission` is 0 on the first attempt.
    Data {
        message: WireMessage,
        retransmission: u32,
    },
    /// Acknowledgement by `acker` of attempt `retransmission` of `message`.
    Ack {
        acker: PeerId,
        retransmission: u32,
        message: WireMessage,
    },
}

impl Datagram {
    /// Serialise this datagram into the bytes sent on the socket.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parse a [`Datagram`] from a raw byte slice.
    ///
    /// Trailing NUL bytes are ignored so fixed-size receive buffers can be
    /// passed without trimming.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let end = buf.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        let text = std::str::from_utf8(&buf[..end]).map_err(|_| PacketError::NotUtf8)?;

        if let Some(rest) = text.strip_prefix(ACK_PREFIX) {
            let (head, message) = rest
                .split_once(':')
                .ok_or_else(|| PacketError::BadHeader(text.to_string()))?;
            let (acker, attempt) = head
                .split_once(' ')
                .ok_or_else(|| PacketError::BadHeader(head.to_string()))?;
            let retransmission = attempt
                .strip_prefix('r')
                .ok_or(PacketError::MissingRetransmission)?;
            return Ok(Datagram::Ack {
                acker: to_peer(parse_number(acker)?)?,
                retransmission: parse_attempt(retransmission)?,
                message: message.parse()?,
            });
        }

        let (message, retransmission) = text
            .rsplit_once(RETRANSMIT_MARK)
            .ok_or(PacketError::MissingRetransmission)?;
        Ok(Datagram::Data {
            message: message.parse()?,
            retransmission: parse_attempt(retransmission)?,
        })
    }
}

fn parse_attempt(token: &str) -> Result<u32, PacketError> {
    token
        .parse()
        .map_err(|_| PacketError::BadNumber(token.to_string()))
}

impl fmt::Display for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datagram::Data {
                message,
                retransmission,
            } => write!(f, "{message}{RETRANSMIT_MARK}{retransmission}"),
            Datagram::Ack {
                acker,
                retransmission,
                message,
            } => write!(f, "{ACK_PREFIX}{acker} r{retransmission}:{message}"),
        }
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("missing retransmission index")]
    MissingRetransmission,
    #[error("malformed header: {0:?}")]
    BadHeader(String),
    #[error("not a valid number: {0:?}")]
    BadNumber(String),
    #[error("vector clock has no entries")]
    EmptyClock,
}
