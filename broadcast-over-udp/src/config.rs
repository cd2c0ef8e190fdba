//! Static process configuration: who the peers are, how many messages to
//! broadcast, and how the reliable link is tuned.
//!
//! Hosts file, one peer per line, ids dense `1..=N`:
//!
//! ```text
//!   1 localhost 11001
//!   2 localhost 11002
//!   3 localhost 11003
//! ```
//!
//! Broadcast config file: first line is the number of messages `m`, then one
//! optional line per process listing the processes that influence it:
//!
//! ```text
//!   5
//!   1 2
//!   2 1 3
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::packet::PeerId;
use crate::timer::TimerConfig;

/// Errors from loading or validating configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {reason}")]
    BadLine { line: usize, reason: String },
    #[error("configuration is empty")]
    Empty,
    #[error("peer ids must be dense 1..={expected}, found {found}")]
    NonDenseIds { expected: usize, found: PeerId },
    #[error("peer {0} is not in the hosts file")]
    UnknownPeer(PeerId),
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn number<T: std::str::FromStr>(token: &str, line: usize) -> Result<T, ConfigError> {
    token.parse().map_err(|_| ConfigError::BadLine {
        line,
        reason: format!("{token:?} is not a number"),
    })
}

// ---------------------------------------------------------------------------
// Peer directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
}

/// Ordered list of every process in the group, including the local one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDirectory {
    peers: Vec<Peer>,
}

impl PeerDirectory {
    pub fn new(mut peers: Vec<Peer>) -> Result<Self, ConfigError> {
        if peers.is_empty() {
            return Err(ConfigError::Empty);
        }
        peers.sort_by_key(|p| p.id);
        for (i, peer) in peers.iter().enumerate() {
            if peer.id as usize != i + 1 {
                return Err(ConfigError::NonDenseIds {
                    expected: peers.len(),
                    found: peer.id,
                });
            }
        }
        Ok(Self { peers })
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut peers = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;
            let fields: Vec<&str> = raw.split_whitespace().collect();
            match fields.as_slice() {
                [] => continue,
                [id, host, port] => peers.push(Peer {
                    id: number(id, line)?,
                    host: host.to_string(),
                    port: number(port, line)?,
                }),
                _ => {
                    return Err(ConfigError::BadLine {
                        line,
                        reason: "expected \"<id> <host> <port>\"".into(),
                    })
                }
            }
        }
        Self::new(peers)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&read(path.as_ref())?)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Resolve every host once.
    ///
    /// A host that does not resolve is logged and kept in the book without
    /// an address; sends to it are skipped for the life of the process.
    pub async fn resolve(&self) -> AddressBook {
        let mut addrs = BTreeMap::new();
        for peer in &self.peers {
            let resolved = match tokio::net::lookup_host((peer.host.as_str(), peer.port)).await {
                Ok(mut found) => found.next(),
                Err(e) => {
                    log::error!("[node] cannot resolve peer {} ({}): {e}", peer.id, peer.host);
                    None
                }
            };
            if resolved.is_none() {
                log::error!(
                    "[node] peer {} has no address; every send to it will be skipped",
                    peer.id
                );
            }
            addrs.insert(peer.id, resolved);
        }
        AddressBook { addrs }
    }
}

/// Resolved socket address for every peer id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressBook {
    addrs: BTreeMap<PeerId, Option<SocketAddr>>,
}

impl AddressBook {
    pub fn from_addrs(addrs: impl IntoIterator<Item = (PeerId, SocketAddr)>) -> Self {
        Self {
            addrs: addrs.into_iter().map(|(id, a)| (id, Some(a))).collect(),
        }
    }

    /// Number of processes in the group.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.addrs.keys().copied()
    }

    /// `None` for unknown ids and for peers that did not resolve.
    pub fn addr(&self, id: PeerId) -> Option<SocketAddr> {
        self.addrs.get(&id).copied().flatten()
    }
}

// ---------------------------------------------------------------------------
// Broadcast config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Number of messages this process broadcasts.
    pub messages: u64,
    /// Processes whose deliveries this process's broadcasts must reflect.
    pub influences: BTreeSet<PeerId>,
}

impl BroadcastConfig {
    /// Parse the config file as seen by process `local_id`.
    pub fn parse(text: &str, local_id: PeerId) -> Result<Self, ConfigError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty());

        let (line, first) = lines.next().ok_or(ConfigError::Empty)?;
        let first_token = first.split_whitespace().next().unwrap_or(first);
        let messages = number(first_token, line)?;

        let mut influences = BTreeSet::new();
        for (line, raw) in lines {
            let mut ids = raw.split_whitespace();
            let Some(owner) = ids.next() else { continue };
            if number::<PeerId>(owner, line)? != local_id {
                continue;
            }
            for id in ids {
                influences.insert(number(id, line)?);
            }
            break;
        }

        Ok(Self {
            messages,
            influences,
        })
    }

    pub fn load(path: impl AsRef<Path>, local_id: PeerId) -> Result<Self, ConfigError> {
        Self::parse(&read(path.as_ref())?, local_id)
    }
}

// ---------------------------------------------------------------------------
// Link tuning
// ---------------------------------------------------------------------------

/// Tuning knobs for [`crate::link::ReliableLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Window size at start and after a timeout.
    pub base_window: u64,
    /// Slow-start threshold before the first shrink.
    pub initial_threshold: u64,
    /// Upper bound on any window's size.
    pub max_window: u64,
    /// Duplicate acks of one packet needed before the window halves.
    pub duplicate_ack_threshold: u32,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
}

impl LinkConfig {
    pub fn timer(&self) -> TimerConfig {
        TimerConfig {
            initial_rto: self.initial_rto,
            min_rto: self.min_rto,
            max_rto: self.max_rto,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        let timer = TimerConfig::default();
        Self {
            base_window: 500,
            initial_threshold: 2000,
            max_window: 65_536,
            duplicate_ack_threshold: 2,
            initial_rto: timer.initial_rto,
            min_rto: timer.min_rto,
            max_rto: timer.max_rto,
        }
    }
}
