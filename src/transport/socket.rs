//! Async UDP socket wrapper for the Subspace transport.
//!
//! Reads are bounded by a timeout so that every receive loop can observe
//! its shutdown flag between datagrams.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::core::constants::MAX_DATAGRAM_SIZE;

/// Owning socket handle with a receive buffer.
///
/// Only one task reads; any number of tasks may send through a
/// [`DatagramSender`].
#[derive(Debug)]
pub struct DatagramSocket {
    socket: Arc<UdpSocket>,
    recv_buffer: Vec<u8>,
}

impl DatagramSocket {
    /// Bind to `addr` with the default buffer size.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        DatagramSocketBuilder::new().bind(addr).await
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        DatagramSocketBuilder::new().from_socket(socket)
    }

    /// Local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Restrict the socket to a single peer.
    pub async fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        self.socket.connect(addr).await
    }

    /// Handle for sending from other tasks.
    pub fn sender(&self) -> DatagramSender {
        DatagramSender {
            socket: Arc::clone(&self.socket),
        }
    }

    /// Send to `addr`.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr).await
    }

    /// Send to the connected peer.
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send(data).await
    }

    /// Receive one datagram, or `None` if `timeout` elapses first.
    pub async fn recv_from_timeout(
        &mut self,
        timeout: Duration,
    ) -> io::Result<Option<(&[u8], SocketAddr)>> {
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut self.recv_buffer)).await {
            Ok(Ok((len, addr))) => Ok(Some((&self.recv_buffer[..len], addr))),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Receive one datagram from the connected peer, or `None` on timeout.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<&[u8]>> {
        match tokio::time::timeout(timeout, self.socket.recv(&mut self.recv_buffer)).await {
            Ok(Ok(len)) => Ok(Some(&self.recv_buffer[..len])),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Size of the receive buffer.
    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer.len()
    }
}

/// Cloneable send-only handle.
#[derive(Debug, Clone)]
pub struct DatagramSender {
    socket: Arc<UdpSocket>,
}

impl DatagramSender {
    /// Send to `addr`.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr).await
    }

    /// Send to the connected peer.
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send(data).await
    }
}

/// Builder for [`DatagramSocket`].
#[derive(Debug, Clone)]
pub struct DatagramSocketBuilder {
    recv_buffer_size: usize,
}

impl Default for DatagramSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramSocketBuilder {
    /// Builder with the protocol's maximum datagram size.
    pub fn new() -> Self {
        Self {
            recv_buffer_size: MAX_DATAGRAM_SIZE,
        }
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    /// Bind to `addr`.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<DatagramSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(self.from_socket(socket))
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(self, socket: UdpSocket) -> DatagramSocket {
        DatagramSocket {
            socket: Arc::new(socket),
            recv_buffer: vec![0u8; self.recv_buffer_size],
        }
    }
}
