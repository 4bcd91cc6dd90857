//! ConnectionSession - Per-connection bookkeeping
//!
//! Each accepted connection gets its own session that tracks who the peer
//! is, when the connection opened, and how many bytes moved in each
//! direction. Sessions are never shared between connections.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unique identifier for a client connection (per server instance)
pub type ConnectionId = u64;

/// Session state for a client connection
///
/// Created when a connection is accepted and dropped when the handler
/// finishes.
#[derive(Debug)]
pub struct ConnectionSession {
    /// Connection ID assigned by the accept loop
    pub id: ConnectionId,
    /// Remote address, if the transport has one
    pub peer: Option<SocketAddr>,
    /// Bytes of request received so far
    pub bytes_received: usize,
    /// Bytes of response written
    pub bytes_sent: usize,
    opened_at: Instant,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            bytes_received: 0,
            bytes_sent: 0,
            opened_at: Instant::now(),
        }
    }

    /// Time since the connection was accepted
    pub fn elapsed(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Time since the connection was accepted, in fractional milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Peer address for log fields
    pub fn peer_label(&self) -> String {
        self.peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
