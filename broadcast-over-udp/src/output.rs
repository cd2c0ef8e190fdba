//! Broadcast/delivery event log.
//!
//! Each process records `b <seq>` when it broadcasts and
//! `d <sender> <seq>` when it delivers, in the order the events happened.
//! The binary flushes the log to the output file on shutdown.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::packet::{MessageId, PeerId};
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Broadcast { seq: u64 },
    Deliver { sender: PeerId, seq: u64 },
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::Broadcast { seq } => write!(f, "b {seq}"),
            LogEvent::Deliver { sender, seq } => write!(f, "d {sender} {seq}"),
        }
    }
}

/// Shared, append-only event log.  Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLog {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_broadcast(&self, seq: u64) {
        lock(&self.events).push(LogEvent::Broadcast { seq });
    }

    pub fn record_delivery(&self, id: MessageId) {
        lock(&self.events).push(LogEvent::Deliver {
            sender: id.sender,
            seq: id.seq,
        });
    }

    pub fn events(&self) -> Vec<LogEvent> {
        lock(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    /// All events, one per line, each line newline-terminated.
    pub fn render(&self) -> String {
        let events = lock(&self.events);
        let mut out = String::with_capacity(events.len() * 8);
        for event in events.iter() {
            out.push_str(&event.to_string());
            out.push('\n');
        }
        out
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let rendered = self.render();
        let mut file = std::fs::File::create(path)?;
        file.write_all(rendered.as_bytes())?;
        file.flush()
    }
}
