//! High-level Subspace client API.
//!
//! [`Client::connect`] performs the key exchange, then runs the connection
//! on four tokio tasks: send, receive, resend sweep and heartbeat.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::bootstrap::handshake;
use crate::core::constants::{DEFAULT_PORT, HANDSHAKE_ATTEMPTS, HANDSHAKE_TIMEOUT};
use crate::crypto::generate_key;
use crate::transport::{
    Connection, ConnectionPhase, ConnectionStats, DatagramSender, DatagramSocket,
    DatagramSocketBuilder, Delivery, HeartbeatSample, Inbound, OutboundQueue, TransportConfig,
    TransportError,
};

/// Errors that can occur in the Subspace client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No ConnectResponse arrived within the allowed attempts.
    #[error("handshake timed out after {attempts} attempts")]
    HandshakeTimeout {
        /// Connect records sent.
        attempts: u32,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address to connect to.
    pub server_addr: SocketAddr,

    /// Local address to bind.
    pub bind_addr: SocketAddr,

    /// Key offered in Connect; random when `None`.
    pub client_key: Option<i32>,

    /// Wait per Connect attempt.
    pub handshake_timeout: Duration,

    /// Connect records sent before giving up.
    pub handshake_attempts: u32,

    /// Connection tunables.
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            client_key: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_attempts: HANDSHAKE_ATTEMPTS,
            transport: TransportConfig::default(),
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server address.
    pub fn server_addr(mut self, addr: SocketAddr) -> Self {
        self.config.server_addr = addr;
        self
    }

    /// Set the local bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Offer a fixed key instead of a random one.
    pub fn client_key(mut self, key: i32) -> Self {
        self.config.client_key = Some(key);
        self
    }

    /// Set the per-attempt handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the number of Connect attempts.
    pub fn handshake_attempts(mut self, attempts: u32) -> Self {
        self.config.handshake_attempts = attempts.max(1);
        self
    }

    /// Set the connection tunables.
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }

    /// Build and connect.
    pub async fn connect(self) -> Result<Client, ClientError> {
        Client::connect(self.config).await
    }
}

/// Result of [`Client::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One application record, in order for reliable traffic.
    Payload(Vec<u8>),
    /// The server disconnected or the client was closed.
    Closed,
    /// Nothing arrived in time.
    TimedOut,
}

/// A connected Subspace client.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use subspace_transport::client::{ClientBuilder, Received};
///
/// let mut client = ClientBuilder::new()
///     .server_addr("127.0.0.1:5000".parse()?)
///     .connect()
///     .await?;
///
/// client.send(b"\x07hello", true)?;
/// if let Received::Payload(reply) = client.receive(Duration::from_secs(1)).await {
///     println!("{reply:?}");
/// }
/// client.close().await;
/// ```
pub struct Client {
    connection: Arc<Connection>,
    inbox: mpsc::Receiver<Inbound>,
    shutdown: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
    server_key: i32,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local_addr", &self.local_addr)
            .field("server_addr", &self.connection.remote())
            .field("phase", &self.connection.phase())
            .finish()
    }
}

impl Client {
    /// Connect to a Subspace server.
    ///
    /// Fails with [`ClientError::HandshakeTimeout`] if the server never
    /// answers; no connection exists in that case.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let mut socket = DatagramSocketBuilder::new()
            .recv_buffer_size(config.transport.max_datagram_size)
            .bind(config.bind_addr)
            .await?;
        let local_addr = socket.local_addr()?;
        let client_key = config.client_key.unwrap_or_else(generate_key);

        let outcome = handshake(
            &mut socket,
            config.server_addr,
            client_key,
            config.handshake_attempts,
            config.handshake_timeout,
        )
        .await?;
        socket.connect(config.server_addr).await?;

        let transport = config.transport;
        let (deliveries, inbox) = mpsc::channel(transport.inbound_queue_size.max(1));
        let (connection, queue) = Connection::established(
            config.server_addr,
            outcome.client_key,
            outcome.server_key,
            transport.clone(),
            deliveries,
        );
        let connection = Arc::new(connection);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut tasks = vec![
            tokio::spawn(send_loop(
                Arc::clone(&connection),
                queue,
                socket.sender(),
                Arc::clone(&shutdown),
                transport.poll_interval,
            )),
            tokio::spawn(recv_loop(
                Arc::clone(&connection),
                socket,
                Arc::clone(&shutdown),
                transport.poll_interval,
            )),
            tokio::spawn(resend_loop(
                Arc::clone(&connection),
                Arc::clone(&shutdown),
                transport.resend_sweep_interval,
            )),
        ];
        if let Some(interval) = transport.heartbeat_interval {
            tasks.push(tokio::spawn(heartbeat_loop(
                Arc::clone(&connection),
                Arc::clone(&shutdown),
                interval,
            )));
        }

        info!(%local_addr, server = %config.server_addr, "client connected");
        Ok(Self {
            connection,
            inbox,
            shutdown,
            tasks,
            local_addr,
            server_key: outcome.server_key,
        })
    }

    /// Queue a payload for the server.
    pub fn send(&self, payload: &[u8], reliable: bool) -> Result<(), ClientError> {
        Ok(self.connection.send(payload, reliable)?)
    }

    /// Queue several small records batched into Cluster records.
    pub fn send_cluster<'a, I>(&self, records: I, reliable: bool) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        Ok(self.connection.send_cluster(records, reliable)?)
    }

    /// Wait up to `timeout` for the next application record.
    pub async fn receive(&mut self, timeout: Duration) -> Received {
        let deadline = Instant::now() + timeout;
        loop {
            if self.connection.is_closed() {
                return match self.inbox.try_recv() {
                    Ok(Inbound {
                        delivery: Delivery::Payload(payload),
                        ..
                    }) => Received::Payload(payload),
                    _ => Received::Closed,
                };
            }
            match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(inbound)) => match inbound.delivery {
                    Delivery::Payload(payload) => return Received::Payload(payload),
                    Delivery::Closed => return Received::Closed,
                    Delivery::Connected => continue,
                },
                Ok(None) => return Received::Closed,
                Err(_) => return Received::TimedOut,
            }
        }
    }

    /// Disconnect: queue Disconnect, flush within the grace period, stop
    /// the tasks and release the connection.
    pub async fn close(mut self) {
        let config = self.connection.config().clone();
        if self.connection.close() {
            let deadline = Instant::now() + config.close_grace_period;
            while self.connection.outbound_backlog() > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        self.shutdown.store(true, Ordering::Release);
        for mut task in std::mem::take(&mut self.tasks) {
            if tokio::time::timeout(config.join_timeout, &mut task)
                .await
                .is_err()
            {
                warn!("client task did not stop in time, aborting");
                task.abort();
            }
        }
        self.connection.release();
        info!(local_addr = %self.local_addr, "client closed");
    }

    /// Current lifecycle state.
    pub fn phase(&self) -> ConnectionPhase {
        self.connection.phase()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    /// Latest heartbeat answer from the server.
    pub fn heartbeat(&self) -> Option<HeartbeatSample> {
        self.connection.heartbeat()
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server address.
    pub fn server_addr(&self) -> SocketAddr {
        self.connection.remote()
    }

    /// Key the server answered with.
    pub fn server_key(&self) -> i32 {
        self.server_key
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn send_loop(
    connection: Arc<Connection>,
    mut queue: OutboundQueue,
    sender: DatagramSender,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) {
    while !shutdown.load(Ordering::Acquire) {
        let record = match tokio::time::timeout(poll, queue.recv()).await {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(_) => continue,
        };
        let wire = match connection.seal(&record) {
            Ok(wire) => wire,
            Err(e) => {
                debug!(error = %e, "dropping unsealable record");
                continue;
            }
        };
        match sender.send(&wire).await {
            Ok(_) => connection.record_sent(),
            Err(e) => {
                if on_socket_error(&connection, e, "send") {
                    break;
                }
            }
        }
    }
}

async fn recv_loop(
    connection: Arc<Connection>,
    mut socket: DatagramSocket,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) {
    while !shutdown.load(Ordering::Acquire) {
        match socket.recv_timeout(poll).await {
            Ok(Some(datagram)) => {
                connection.on_datagram(datagram);
                if connection.is_closed() {
                    break;
                }
            }
            Ok(None) => {}
            // ICMP errors surface here on a connected socket.
            Err(e) => {
                if on_socket_error(&connection, e, "receive") {
                    break;
                }
            }
        }
    }
}

/// Handle a socket error from one of the I/O loops. Fatal errors close the
/// connection and report Closed; returns `true` when the loop must stop.
fn on_socket_error(connection: &Connection, error: io::Error, op: &'static str) -> bool {
    let error = TransportError::from(error);
    if error.is_fatal() {
        connection.fail(&error);
        return true;
    }
    debug!(error = %error, op, "transient socket error");
    false
}

async fn resend_loop(connection: Arc<Connection>, shutdown: Arc<AtomicBool>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while !shutdown.load(Ordering::Acquire) && !connection.is_closed() {
        ticker.tick().await;
        connection.resend_due(std::time::Instant::now());
    }
}

async fn heartbeat_loop(connection: Arc<Connection>, shutdown: Arc<AtomicBool>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while !shutdown.load(Ordering::Acquire) && !connection.is_closed() {
        ticker.tick().await;
        if connection.phase() == ConnectionPhase::Online {
            connection.send_heartbeat();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CoreRecord;

    #[test]
    fn test_builder() {
        let addr: SocketAddr = "10.0.0.1:5001".parse().unwrap();
        let config = ClientBuilder::new()
            .server_addr(addr)
            .client_key(42)
            .handshake_attempts(0)
            .handshake_timeout(Duration::from_millis(250))
            .build();
        assert_eq!(config.server_addr, addr);
        assert_eq!(config.client_key, Some(42));
        assert_eq!(config.handshake_attempts, 1);
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server_addr.port(), DEFAULT_PORT);
        assert_eq!(config.handshake_attempts, 3);
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_fatal_socket_error_reports_closed() {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut server = DatagramSocket::bind(loopback).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let (_, from) = server
                .recv_from_timeout(Duration::from_secs(2))
                .await
                .unwrap()
                .unwrap();
            let response = CoreRecord::ConnectResponse { server_key: 0x77 }.encode();
            server.send_to(&response, from).await.unwrap();
            server
        });

        let mut client = ClientBuilder::new()
            .bind_addr(loopback)
            .server_addr(server_addr)
            .client_key(5)
            .connect()
            .await
            .unwrap();
        let _server = responder.await.unwrap();

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(!on_socket_error(client.connection(), refused, "receive"));
        assert_eq!(
            client.receive(Duration::from_millis(50)).await,
            Received::TimedOut
        );

        let gone = io::Error::from(io::ErrorKind::NotConnected);
        assert!(on_socket_error(client.connection(), gone, "receive"));
        assert_eq!(client.receive(Duration::from_secs(1)).await, Received::Closed);
        assert_eq!(client.phase(), ConnectionPhase::Closed);
        assert!(client.send(b"\x31x", true).is_err());
    }

    #[tokio::test]
    async fn test_connect_times_out_without_server() {
        let silent = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let err = ClientBuilder::new()
            .server_addr(silent.local_addr().unwrap())
            .handshake_attempts(2)
            .handshake_timeout(Duration::from_millis(30))
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::HandshakeTimeout { attempts: 2 }));
        assert_eq!(err.to_string(), "handshake timed out after 2 attempts");
    }
}
