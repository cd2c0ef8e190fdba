//! `broadcast-over-udp`: uniform reliable, FIFO, and causal broadcast for a
//! static group of processes, over a TCP-like reliable link built on UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────────────┐      ┌────────────────────────┐
//!  │ FifoBroadcast         │  or  │ CausalBroadcast        │
//!  │ (per-sender order)    │      │ (vector clocks)        │
//!  └──────────┬────────────┘      └───────────┬────────────┘
//!             │ broadcast(seq)    ▲ deliver    │
//!  ┌──────────▼───────────────────┴────────────▼────────────┐
//!  │ UniformReliableBroadcast (majority acks, relay flood)  │
//!  └──────────┬───────────────────▲─────────────────────────┘
//!             │ send(msg, peer)   │ deduplicated messages
//!  ┌──────────▼───────────────────┴─────────────────────────┐
//!  │ ReliableLink  (CongestionWindow per peer and class,    │
//!  │               RTO estimation, acks, retransmission)    │
//!  └──────────┬─────────────────────────────────────────────┘
//!             │ text datagrams
//!  ┌──────────▼──────┐
//!  │  Socket         │  (thin async wrapper around tokio UdpSocket)
//!  └─────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     - message identity, vector clocks, wire format
//! - [`socket`]     - async UDP socket abstraction
//! - [`simulator`]  - optional loss/duplication fault model
//! - [`timer`]      - RTT smoothing and retransmission timeout
//! - [`window`]     - congestion window (slow start, avoidance, shrink)
//! - [`flow`]       - broadcast send-window ceiling
//! - [`link`]       - reliable point-to-point link
//! - [`urb`]        - uniform reliable broadcast
//! - [`fifo`]       - FIFO broadcast
//! - [`causal`]     - causal broadcast
//! - [`config`]     - hosts file, broadcast config, link tuning
//! - [`output`]     - broadcast/delivery event log
//! - [`node`]       - one process's stack, wired together

pub mod causal;
pub mod config;
pub mod fifo;
pub mod flow;
pub mod link;
pub mod node;
pub mod output;
pub mod packet;
pub mod simulator;
pub mod socket;
mod sync;
pub mod timer;
pub mod urb;
pub mod window;
