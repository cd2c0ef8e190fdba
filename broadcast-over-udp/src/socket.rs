//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Datagram`] instead of raw bytes.  All protocol logic
//! lives elsewhere; this module owns only byte I/O and, when configured,
//! the outbound fault model from [`crate::simulator`].

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Datagram, PacketError};
use crate::simulator::{Simulator, SimulatorConfig};

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The received datagram could not be decoded.
    #[error("datagram decode error from {from}: {source}")]
    Packet {
        from: SocketAddr,
        #[source]
        source: PacketError,
    },
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, datagram-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across the link's
/// sender, receiver, and ack-checker tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    simulator: Option<Simulator>,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `127.0.0.1:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            simulator: None,
        })
    }

    /// Bind a socket whose outbound datagrams pass through a fault model.
    pub async fn bind_with_faults(
        local_addr: SocketAddr,
        faults: SimulatorConfig,
    ) -> Result<Self, SocketError> {
        let mut socket = Self::bind(local_addr).await?;
        socket.simulator = Some(Simulator::new(faults));
        Ok(socket)
    }

    /// Encode `datagram` and send it to `dest`.
    ///
    /// A datagram dropped by the simulator still returns `Ok`; the caller
    /// cannot tell it apart from loss on a real network.
    pub async fn send_to(&self, datagram: &Datagram, dest: SocketAddr) -> Result<(), SocketError> {
        let copies = self.simulator.as_ref().map_or(1, |sim| sim.roll().copies());
        if copies == 0 {
            return Ok(());
        }
        let bytes = datagram.encode();
        for _ in 0..copies {
            self.inner.send_to(&bytes, dest).await?;
        }
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Datagram`].
    ///
    /// Returns `(datagram, sender_address)`.  Datagrams that fail to decode
    /// are returned as `Err`; the caller decides whether to keep reading.
    pub async fn recv_from(&self) -> Result<(Datagram, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, from) = self.inner.recv_from(&mut buf).await?;
        let datagram =
            Datagram::decode(&buf[..n]).map_err(|source| SocketError::Packet { from, source })?;
        Ok((datagram, from))
    }
}
