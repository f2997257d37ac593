//! Server-side peer session.
//!
//! Pairs a [`Connection`] with the receiving end of its outbound queue so
//! the shared send loop can drain every peer from one task.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::transport::{Connection, OutboundQueue};

/// Records drained from one session per send-loop pass.
pub const DRAIN_BATCH: usize = 64;

/// One peer known to the server.
#[derive(Debug)]
pub struct PeerSession {
    connection: Arc<Connection>,
    outbound: Mutex<OutboundQueue>,
    created_at: Instant,
}

impl PeerSession {
    /// Wrap a connection and its outbound queue.
    pub fn new(connection: Connection, outbound: OutboundQueue) -> Self {
        Self {
            connection: Arc::new(connection),
            outbound: Mutex::new(outbound),
            created_at: Instant::now(),
        }
    }

    /// The peer connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Peer address.
    pub fn remote(&self) -> SocketAddr {
        self.connection.remote()
    }

    /// Take up to `max` queued records, oldest first.
    pub fn drain(&self, max: usize) -> Vec<Vec<u8>> {
        let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = Vec::new();
        while records.len() < max {
            match outbound.try_recv() {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }
        records
    }

    /// Time since the first datagram from this peer.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
