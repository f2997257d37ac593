//! High-level Subspace server API.
//!
//! One bound socket demultiplexed by source address into per-peer
//! [`Connection`]s. Three tasks run for the server's lifetime: the receive
//! loop, a shared send loop that drains every peer's outbound queue, and a
//! sweep for resends and heartbeats.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::session::{PeerSession, DRAIN_BATCH};
use crate::core::constants::{DEFAULT_PORT, HANDSHAKE_TIMEOUT};
use crate::crypto::ServerKeyPolicy;
use crate::transport::{
    Connection, ConnectionPhase, DatagramSender, DatagramSocket, DatagramSocketBuilder, Delivery,
    Inbound, Role, TransportConfig, TransportError,
};

/// Errors that can occur in the Subspace server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("bind to {addr} failed: {source}")]
    BindFailed {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Server is shut down.
    #[error("server shut down")]
    Shutdown,

    /// No session exists for the address.
    #[error("unknown peer: {0}")]
    UnknownPeer(SocketAddr),

    /// Transport error on a peer connection.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// How the server answers Connect.
    pub key_policy: ServerKeyPolicy,

    /// Sessions still waiting for Connect after this long are dropped.
    pub handshake_timeout: Duration,

    /// Per-connection tunables.
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_sessions: 1000,
            key_policy: ServerKeyPolicy::default(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            transport: TransportConfig::server(),
        }
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the maximum number of concurrent sessions.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Set the key policy.
    pub fn key_policy(mut self, policy: ServerKeyPolicy) -> Self {
        self.config.key_policy = policy;
        self
    }

    /// Set how long a session may wait for Connect.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the per-connection tunables.
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }

    /// Build and bind.
    pub async fn bind(self) -> Result<Server, ServerError> {
        Server::bind(self.config).await
    }
}

/// Event from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A peer completed the key exchange.
    PeerConnected {
        /// Peer address.
        addr: SocketAddr,
    },

    /// An application record arrived.
    Payload {
        /// Peer address.
        from: SocketAddr,
        /// Record bytes.
        data: Vec<u8>,
    },

    /// A peer sent Disconnect.
    PeerDisconnected {
        /// Peer address.
        addr: SocketAddr,
    },
}

impl From<Inbound> for ServerEvent {
    fn from(inbound: Inbound) -> Self {
        match inbound.delivery {
            Delivery::Connected => Self::PeerConnected { addr: inbound.from },
            Delivery::Payload(data) => Self::Payload {
                from: inbound.from,
                data,
            },
            Delivery::Closed => Self::PeerDisconnected { addr: inbound.from },
        }
    }
}

/// State shared by the server handle and its tasks.
struct Shared {
    config: ServerConfig,
    sessions: RwLock<HashMap<SocketAddr, Arc<PeerSession>>>,
    sender: DatagramSender,
    deliveries: mpsc::Sender<Inbound>,
    wake: Arc<Notify>,
    shutdown: AtomicBool,
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    async fn snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Session for `addr`, created on first contact.
    ///
    /// Returns `None` when the session limit is reached.
    async fn session_for(&self, addr: SocketAddr) -> Option<Arc<PeerSession>> {
        if let Some(session) = self.sessions.read().await.get(&addr) {
            return Some(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&addr) {
            return Some(Arc::clone(session));
        }
        if sessions.len() >= self.config.max_sessions {
            debug!(peer = %addr, limit = self.config.max_sessions, "session limit reached, refusing");
            return None;
        }

        let (connection, queue) = Connection::new(
            addr,
            Role::Server(self.config.key_policy),
            self.config.transport.clone(),
            self.deliveries.clone(),
        );
        let session = Arc::new(PeerSession::new(
            connection.with_wake(Arc::clone(&self.wake)),
            queue,
        ));
        sessions.insert(addr, Arc::clone(&session));
        debug!(peer = %addr, sessions = sessions.len(), "new session");
        Some(session)
    }

    /// Drop `addr` from the map if it still maps to `session`.
    async fn forget(&self, addr: SocketAddr, session: &Arc<PeerSession>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&addr)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&addr);
            info!(peer = %addr, sessions = sessions.len(), "session removed");
        }
    }

    /// Drop sessions that never completed the key exchange. Returns how
    /// many were removed.
    async fn reap_handshaking(&self) -> usize {
        let max_age = self.config.handshake_timeout;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|addr, session| {
            let stale = session.connection().phase() == ConnectionPhase::Handshaking
                && session.age() > max_age;
            if stale {
                debug!(peer = %addr, age = ?session.age(), "no handshake, dropping session");
                session.connection().release();
            }
            !stale
        });
        before - sessions.len()
    }

    /// Seal and send everything queued for `session`. Returns how many
    /// datagrams went out.
    async fn flush(&self, session: &PeerSession) -> usize {
        let connection = session.connection();
        let mut sent = 0;
        loop {
            let batch = session.drain(DRAIN_BATCH);
            if batch.is_empty() {
                return sent;
            }
            for record in batch {
                let wire = match connection.seal(&record) {
                    Ok(wire) => wire,
                    Err(e) => {
                        debug!(peer = %connection.remote(), error = %e, "dropping unsealable record");
                        continue;
                    }
                };
                match self.sender.send_to(&wire, connection.remote()).await {
                    Ok(_) => {
                        connection.record_sent();
                        sent += 1;
                    }
                    Err(e) => warn!(peer = %connection.remote(), error = %e, "send failed"),
                }
            }
        }
    }
}

/// A Subspace server.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use subspace_transport::server::{ServerBuilder, ServerEvent};
///
/// let server = ServerBuilder::new()
///     .bind_addr("0.0.0.0:5000".parse()?)
///     .bind()
///     .await?;
///
/// loop {
///     match server.recv(Duration::from_millis(100)).await? {
///         Some(ServerEvent::Payload { from, data }) => server.send(from, &data, true).await?,
///         Some(other) => println!("{other:?}"),
///         None => {}
///     }
/// }
/// ```
pub struct Server {
    shared: Arc<Shared>,
    events: Mutex<mpsc::Receiver<Inbound>>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind to an address and start the server tasks.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let socket = DatagramSocketBuilder::new()
            .recv_buffer_size(config.transport.max_datagram_size)
            .bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr()?;

        let (deliveries, events) = mpsc::channel(config.transport.inbound_queue_size.max(1));
        let shared = Arc::new(Shared {
            sessions: RwLock::new(HashMap::new()),
            sender: socket.sender(),
            deliveries,
            wake: Arc::new(Notify::new()),
            shutdown: AtomicBool::new(false),
            config,
        });

        let tasks = vec![
            tokio::spawn(recv_loop(Arc::clone(&shared), socket)),
            tokio::spawn(send_loop(Arc::clone(&shared))),
            tokio::spawn(sweep_loop(Arc::clone(&shared))),
        ];

        info!(%local_addr, "server listening");
        Ok(Self {
            shared,
            events: Mutex::new(events),
            tasks,
            local_addr,
        })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    /// Addresses of live sessions.
    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.shared.sessions.read().await.keys().copied().collect()
    }

    /// Connection for `addr`, if any.
    pub async fn connection(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.shared
            .sessions
            .read()
            .await
            .get(&addr)
            .map(|session| Arc::clone(session.connection()))
    }

    /// Queue a payload for one peer.
    pub async fn send(
        &self,
        addr: SocketAddr,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(), ServerError> {
        let connection = self
            .connection(addr)
            .await
            .ok_or(ServerError::UnknownPeer(addr))?;
        connection.send(payload, reliable)?;
        Ok(())
    }

    /// Queue a payload for several peers. Returns how many accepted it;
    /// unknown or closed peers are skipped.
    pub async fn send_to_many<I>(&self, addrs: I, payload: &[u8], reliable: bool) -> usize
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        let mut queued = 0;
        for addr in addrs {
            match self.send(addr, payload, reliable).await {
                Ok(()) => queued += 1,
                Err(e) => debug!(peer = %addr, error = %e, "skipping peer"),
            }
        }
        queued
    }

    /// Queue a payload for every session.
    pub async fn broadcast(&self, payload: &[u8], reliable: bool) -> usize {
        let mut queued = 0;
        for session in self.shared.snapshot().await {
            match session.connection().send(payload, reliable) {
                Ok(()) => queued += 1,
                Err(e) => debug!(peer = %session.remote(), error = %e, "skipping peer"),
            }
        }
        queued
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// `Ok(None)` means nothing arrived in time.
    pub async fn recv(&self, timeout: Duration) -> Result<Option<ServerEvent>, ServerError> {
        if self.shared.is_shutdown() {
            return Err(ServerError::Shutdown);
        }
        let mut events = self.events.lock().await;
        match tokio::time::timeout(timeout, events.recv()).await {
            Ok(Some(inbound)) => Ok(Some(inbound.into())),
            Ok(None) => Err(ServerError::Shutdown),
            Err(_) => Ok(None),
        }
    }

    /// Remove a session. With `notify`, Disconnect is sent twice before
    /// the session is released.
    pub async fn disconnect(&self, addr: SocketAddr, notify: bool) -> Result<(), ServerError> {
        let session = self
            .shared
            .sessions
            .write()
            .await
            .remove(&addr)
            .ok_or(ServerError::UnknownPeer(addr))?;

        let connection = session.connection();
        if notify {
            connection.close();
            connection.send_disconnect();
        }
        let flushed = self.shared.flush(&session).await;
        connection.release();
        info!(peer = %addr, notify, flushed, "peer disconnected by server");
        Ok(())
    }

    /// Disconnect every peer, stop the tasks and wait for them to exit.
    pub async fn shutdown(mut self) {
        for addr in self.peers().await {
            let _ = self.disconnect(addr, true).await;
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_one();

        let join_timeout = self.shared.config.transport.join_timeout;
        for mut task in std::mem::take(&mut self.tasks) {
            if tokio::time::timeout(join_timeout, &mut task).await.is_err() {
                warn!("server task did not stop in time, aborting");
                task.abort();
            }
        }
        info!(local_addr = %self.local_addr, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn recv_loop(shared: Arc<Shared>, mut socket: DatagramSocket) {
    let poll = shared.config.transport.poll_interval;
    while !shared.is_shutdown() {
        let (datagram, from) = match socket.recv_from_timeout(poll).await {
            Ok(Some(received)) => received,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, "receive failed");
                continue;
            }
        };

        let Some(session) = shared.session_for(from).await else {
            continue;
        };
        let connection = session.connection();
        connection.on_datagram(datagram);
        if connection.is_closed() {
            shared.forget(from, &session).await;
        }
    }
}

async fn send_loop(shared: Arc<Shared>) {
    let poll = shared.config.transport.poll_interval;
    while !shared.is_shutdown() {
        let mut sent = 0;
        for session in shared.snapshot().await {
            sent += shared.flush(&session).await;
        }
        if sent == 0 {
            let _ = tokio::time::timeout(poll, shared.wake.notified()).await;
        }
    }
}

async fn sweep_loop(shared: Arc<Shared>) {
    let transport = &shared.config.transport;
    let mut ticker = tokio::time::interval(transport.resend_sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if shared.is_shutdown() {
            break;
        }
        let reaped = shared.reap_handshaking().await;
        if reaped > 0 {
            info!(reaped, "dropped sessions without a handshake");
        }
        let now = std::time::Instant::now();
        for session in shared.snapshot().await {
            let connection = session.connection();
            connection.resend_due(now);
            if let Some(interval) = transport.heartbeat_interval {
                connection.heartbeat_if_due(now, interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CoreRecord;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn server(max_sessions: usize) -> Server {
        ServerBuilder::new()
            .bind_addr(loopback())
            .max_sessions(max_sessions)
            .bind()
            .await
            .unwrap()
    }

    fn connect(key: i32) -> Vec<u8> {
        CoreRecord::Connect { key, version: 1 }.encode()
    }

    #[test]
    fn test_builder_defaults() {
        let config = ServerBuilder::new()
            .key_policy(ServerKeyPolicy::Random)
            .max_sessions(4)
            .build();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.key_policy, ServerKeyPolicy::Random);
        assert_eq!(config.handshake_timeout, HANDSHAKE_TIMEOUT);
        assert!(config.transport.heartbeat_interval.is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let first = server(8).await;
        let err = ServerBuilder::new()
            .bind_addr(first.local_addr())
            .bind()
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BindFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_answered_and_reported() {
        let server = server(8).await;
        let mut peer = DatagramSocket::bind(loopback()).await.unwrap();
        peer.send_to(&connect(0x1234), server.local_addr()).await.unwrap();

        let (reply, _) = peer
            .recv_from_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            CoreRecord::parse(reply).unwrap(),
            Some(CoreRecord::ConnectResponse { server_key: 0x1234 })
        );

        let event = server.recv(Duration::from_secs(2)).await.unwrap();
        assert_eq!(
            event,
            Some(ServerEvent::PeerConnected {
                addr: peer.local_addr().unwrap()
            })
        );
        assert_eq!(server.session_count().await, 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_sessions_without_handshake_reaped() {
        let transport = TransportConfig::builder()
            .resend_sweep_interval(Duration::from_millis(20))
            .heartbeat_interval(None)
            .build();
        let server = ServerBuilder::new()
            .bind_addr(loopback())
            .max_sessions(1)
            .handshake_timeout(Duration::from_millis(100))
            .transport(transport)
            .bind()
            .await
            .unwrap();

        let stray = DatagramSocket::bind(loopback()).await.unwrap();
        stray.send_to(b"\x03junk", server.local_addr()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server.session_count().await == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        while server.session_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.session_count().await, 0);

        // The freed slot is available to a real client.
        let mut peer = DatagramSocket::bind(loopback()).await.unwrap();
        peer.send_to(&connect(3), server.local_addr()).await.unwrap();
        let (reply, _) = peer
            .recv_from_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            CoreRecord::parse(reply).unwrap(),
            Some(CoreRecord::ConnectResponse { server_key: 3 })
        );
    }

    #[tokio::test]
    async fn test_session_limit() {
        let server = server(1).await;
        let first = DatagramSocket::bind(loopback()).await.unwrap();
        let mut second = DatagramSocket::bind(loopback()).await.unwrap();

        first.send_to(&connect(1), server.local_addr()).await.unwrap();
        assert!(matches!(
            server.recv(Duration::from_secs(2)).await.unwrap(),
            Some(ServerEvent::PeerConnected { .. })
        ));

        second.send_to(&connect(2), server.local_addr()).await.unwrap();
        assert!(second
            .recv_from_timeout(Duration::from_millis(200))
            .await
            .unwrap()
            .is_none());
        assert_eq!(server.peers().await, vec![first.local_addr().unwrap()]);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let server = server(8).await;
        let nobody: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            server.send(nobody, b"\x31x", true).await,
            Err(ServerError::UnknownPeer(addr)) if addr == nobody
        ));
        assert!(matches!(
            server.disconnect(nobody, true).await,
            Err(ServerError::UnknownPeer(_))
        ));
        assert_eq!(server.send_to_many([nobody], b"\x31x", false).await, 0);
        assert_eq!(server.broadcast(b"\x31x", false).await, 0);
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let server = server(8).await;
        assert_eq!(server.recv(Duration::from_millis(20)).await.unwrap(), None);
    }

    #[test]
    fn test_event_from_inbound() {
        let from: SocketAddr = "10.1.1.1:77".parse().unwrap();
        let event = ServerEvent::from(Inbound {
            from,
            delivery: Delivery::Payload(vec![1, 2]),
        });
        assert_eq!(
            event,
            ServerEvent::Payload {
                from,
                data: vec![1, 2]
            }
        );
        assert_eq!(
            ServerEvent::from(Inbound {
                from,
                delivery: Delivery::Closed
            }),
            ServerEvent::PeerDisconnected { addr: from }
        );
    }
}
