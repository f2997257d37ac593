//! Per-peer session state machine.
//!
//! A [`Connection`] is I/O-free: datagrams go in through
//! [`Connection::on_datagram`], records to transmit come out of the
//! [`OutboundQueue`] returned at construction, and application payloads
//! come out of the shared delivery channel. The client and server drive it
//! from their own tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use super::config::TransportConfig;
use super::error::{TransportError, TransportResult};
use super::reliable::{FragmentAccumulator, InboundOutcome, InboundWindow, OutboundWindow};
use super::timing::{HeartbeatSample, HeartbeatTracker, TransportClock};
use crate::codec::{clear_prefix, core_kind, split_fragments, ClusterBuilder, ClusterEntries, CoreRecord};
use crate::core::constants::REORDER_WARN_THRESHOLD;
use crate::core::{RecordError, SessionCipher};
use crate::crypto::{self, ServerKeyPolicy};

/// Records waiting to be sealed and sent, in queue order.
pub type OutboundQueue = mpsc::Receiver<Vec<u8>>;

/// Which side of the handshake this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates with Connect.
    Client,
    /// Answers Connect according to the key policy.
    Server(ServerKeyPolicy),
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Waiting for the key exchange.
    Handshaking,
    /// Cipher ready, traffic flowing.
    Online,
    /// Local close requested, flushing.
    Closing,
    /// Resources released.
    Closed,
}

/// What a connection hands to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Key exchange completed (server role).
    Connected,
    /// One reassembled, in-order application record.
    Payload(Vec<u8>),
    /// Peer disconnected.
    Closed,
}

/// A [`Delivery`] tagged with the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Peer address.
    pub from: SocketAddr,
    /// What happened.
    pub delivery: Delivery,
}

/// Snapshot of connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Datagrams handed to the socket.
    pub datagrams_sent: u32,
    /// Datagrams received from the peer.
    pub datagrams_received: u32,
    /// Reliable envelopes awaiting acknowledgement.
    pub pending_reliable: usize,
    /// Sequence number of the next outbound envelope.
    pub next_outbound_seq: u32,
    /// Sequence number the peer must send next.
    pub next_inbound_seq: u32,
    /// Heartbeat probes sent.
    pub heartbeats_sent: u64,
}

#[derive(Debug, Default)]
struct InboundState {
    window: InboundWindow,
    fragments: FragmentAccumulator,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One peer session.
pub struct Connection {
    remote: SocketAddr,
    role: Role,
    config: TransportConfig,
    clock: TransportClock,

    phase: Mutex<ConnectionPhase>,
    cipher: RwLock<Option<Box<dyn SessionCipher>>>,
    session_key: Mutex<Option<i32>>,

    /// Guards the outbound sequence counter and the pending set together.
    outbound: Mutex<OutboundWindow>,
    inbound: Mutex<InboundState>,
    heartbeat: Mutex<HeartbeatTracker>,
    last_probe: Mutex<Option<Instant>>,

    queue: mpsc::Sender<Vec<u8>>,
    deliveries: mpsc::Sender<Inbound>,
    wake: Option<Arc<Notify>>,

    sent: AtomicU32,
    received: AtomicU32,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection awaiting its key exchange.
    ///
    /// Deliveries for the application are pushed into `deliveries`; records
    /// to transmit appear on the returned queue.
    pub fn new(
        remote: SocketAddr,
        role: Role,
        config: TransportConfig,
        deliveries: mpsc::Sender<Inbound>,
    ) -> (Self, OutboundQueue) {
        let (queue, queue_rx) = mpsc::channel(config.outbound_queue_size.max(1));
        let connection = Self {
            remote,
            role,
            config,
            clock: TransportClock::new(),
            phase: Mutex::new(ConnectionPhase::Handshaking),
            cipher: RwLock::new(None),
            session_key: Mutex::new(None),
            outbound: Mutex::new(OutboundWindow::default()),
            inbound: Mutex::new(InboundState::default()),
            heartbeat: Mutex::new(HeartbeatTracker::default()),
            last_probe: Mutex::new(None),
            queue,
            deliveries,
            wake: None,
            sent: AtomicU32::new(0),
            received: AtomicU32::new(0),
        };
        (connection, queue_rx)
    }

    /// Create a client connection whose handshake already completed.
    pub fn established(
        remote: SocketAddr,
        client_key: i32,
        server_key: i32,
        config: TransportConfig,
        deliveries: mpsc::Sender<Inbound>,
    ) -> (Self, OutboundQueue) {
        let (connection, queue) = Self::new(remote, Role::Client, config, deliveries);
        connection.install_cipher(client_key, server_key);
        connection.set_phase(ConnectionPhase::Online);
        (connection, queue)
    }

    /// Signal `wake` whenever a record is queued.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Peer address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Settings in effect.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn phase(&self) -> ConnectionPhase {
        *lock(&self.phase)
    }

    /// Whether the connection has released its state.
    pub fn is_closed(&self) -> bool {
        self.phase() == ConnectionPhase::Closed
    }

    /// Key agreed in the handshake, once known.
    pub fn session_key(&self) -> Option<i32> {
        *lock(&self.session_key)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ConnectionStats {
        let (pending_reliable, next_outbound_seq) = {
            let outbound = lock(&self.outbound);
            (outbound.pending_len(), outbound.next_seq())
        };
        ConnectionStats {
            datagrams_sent: self.sent.load(Ordering::Relaxed),
            datagrams_received: self.received.load(Ordering::Relaxed),
            pending_reliable,
            next_outbound_seq,
            next_inbound_seq: lock(&self.inbound).window.next_expected(),
            heartbeats_sent: lock(&self.heartbeat).probes_sent(),
        }
    }

    /// Latest heartbeat answer.
    pub fn heartbeat(&self) -> Option<HeartbeatSample> {
        lock(&self.heartbeat).last()
    }

    /// Smoothed heartbeat round trip.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        lock(&self.heartbeat).smoothed_rtt()
    }

    /// Records queued but not yet taken by the send loop.
    pub fn outbound_backlog(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue `payload` for the peer.
    ///
    /// Payloads over the chunk size are fragmented and always sent
    /// reliably. A full queue drops the record (reliable records stay
    /// pending and go out with the next resend sweep).
    pub fn send(&self, payload: &[u8], reliable: bool) -> TransportResult<()> {
        if payload.is_empty() {
            return Err(RecordError::Truncated {
                expected: 1,
                actual: 0,
            }
            .into());
        }
        if matches!(
            self.phase(),
            ConnectionPhase::Closing | ConnectionPhase::Closed
        ) {
            return Err(TransportError::ConnectionClosed);
        }

        if payload.len() > self.config.max_chunk_size {
            let fragments = split_fragments(payload, self.config.max_chunk_size);
            trace!(peer = %self.remote, len = payload.len(), count = fragments.len(), "fragmenting");
            // One payload owns a contiguous run of sequence numbers.
            let mut outbound = lock(&self.outbound);
            let now = Instant::now();
            for fragment in fragments {
                let record = outbound.wrap(&fragment, now);
                self.enqueue_pending(record)?;
            }
            Ok(())
        } else if reliable {
            self.send_reliable(payload)
        } else {
            self.enqueue(payload.to_vec())
        }
    }

    /// Queue several small records batched into Cluster records.
    pub fn send_cluster<'a, I>(&self, records: I, reliable: bool) -> TransportResult<()>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut builder = ClusterBuilder::new(self.config.max_chunk_size);
        for record in records {
            builder.push(record)?;
        }
        for cluster in builder.finish() {
            self.send(&cluster, reliable)?;
        }
        Ok(())
    }

    /// Send a heartbeat probe with the current counters.
    pub fn send_heartbeat(&self) {
        let probe = CoreRecord::Heartbeat {
            sender_time: self.clock.now(),
            sent_count: self.sent.load(Ordering::Relaxed),
            recv_count: self.received.load(Ordering::Relaxed),
        };
        lock(&self.heartbeat).on_probe();
        *lock(&self.last_probe) = Some(Instant::now());
        let _ = self.enqueue(probe.encode());
    }

    /// Send a heartbeat if `interval` has passed since the last one.
    pub fn heartbeat_if_due(&self, now: Instant, interval: Duration) -> bool {
        if self.phase() != ConnectionPhase::Online {
            return false;
        }
        let due = lock(&self.last_probe)
            .is_none_or(|last| now.saturating_duration_since(last) >= interval);
        if due {
            self.send_heartbeat();
        }
        due
    }

    /// Requeue pending envelopes older than the resend timeout.
    ///
    /// Returns how many were requeued.
    pub fn resend_due(&self, now: Instant) -> usize {
        let mut outbound = lock(&self.outbound);
        let due = outbound.due(now, self.config.resend_timeout);
        let count = due.len();
        for record in due {
            let _ = self.enqueue(record);
        }
        if count > 0 {
            debug!(peer = %self.remote, count, pending = outbound.pending_len(), "resending");
        }
        count
    }

    /// Encrypt a queued record for the wire.
    pub fn seal(&self, record: &[u8]) -> TransportResult<Vec<u8>> {
        if core_kind(record).is_some_and(|kind| kind.is_handshake()) {
            return Ok(record.to_vec());
        }
        let cipher = self.cipher.read().unwrap_or_else(PoisonError::into_inner);
        let cipher = cipher.as_ref().ok_or(TransportError::CipherNotReady)?;
        Ok(cipher.encrypt(record, clear_prefix(record)))
    }

    /// Count one datagram handed to the socket.
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Request a local close: queue Disconnect and enter Closing.
    ///
    /// Returns `false` if the connection was already closing.
    pub fn close(&self) -> bool {
        let previous = {
            let mut phase = lock(&self.phase);
            let previous = *phase;
            if matches!(previous, ConnectionPhase::Closing | ConnectionPhase::Closed) {
                return false;
            }
            *phase = ConnectionPhase::Closing;
            previous
        };
        if previous == ConnectionPhase::Online {
            let _ = self.enqueue(CoreRecord::Disconnect.encode());
        }
        info!(peer = %self.remote, "closing connection");
        true
    }

    /// Queue an extra unreliable Disconnect.
    pub fn send_disconnect(&self) {
        let _ = self.enqueue(CoreRecord::Disconnect.encode());
    }

    /// Give up after an unrecoverable socket error: release the state and
    /// report Closed to the application.
    ///
    /// Returns `false` if the connection was already closed.
    pub fn fail(&self, error: &TransportError) -> bool {
        if self.is_closed() {
            return false;
        }
        warn!(peer = %self.remote, error = %error, "transport failed, closing connection");
        self.release();
        self.deliver(Delivery::Closed);
        true
    }

    /// Enter Closed and drop all per-connection state.
    pub fn release(&self) {
        self.set_phase(ConnectionPhase::Closed);
        lock(&self.outbound).clear();
        let mut inbound = lock(&self.inbound);
        inbound.window.clear();
        inbound.fragments.clear();
    }

    fn send_reliable(&self, inner: &[u8]) -> TransportResult<()> {
        let mut outbound = lock(&self.outbound);
        let record = outbound.wrap(inner, Instant::now());
        self.enqueue_pending(record)
    }

    /// Queue an envelope already tracked as pending. A full queue is not
    /// an error: the resend sweep picks the envelope up.
    fn enqueue_pending(&self, record: Vec<u8>) -> TransportResult<()> {
        match self.enqueue(record) {
            Err(TransportError::QueueFull) => Ok(()),
            other => other,
        }
    }

    fn enqueue(&self, record: Vec<u8>) -> TransportResult<()> {
        match self.queue.try_send(record) {
            Ok(()) => {
                if let Some(wake) = &self.wake {
                    wake.notify_one();
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %self.remote, "outbound queue full, dropping record");
                Err(TransportError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::ConnectionClosed),
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let inbound = Inbound {
            from: self.remote,
            delivery,
        };
        match self.deliveries.try_send(inbound) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %self.remote, "inbound queue full, dropping delivery");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(peer = %self.remote, "application stopped receiving");
            }
        }
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Process one datagram from the peer.
    ///
    /// Never fails: undecodable input is logged and dropped.
    pub fn on_datagram(&self, raw: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.received.fetch_add(1, Ordering::Relaxed);

        match self.open(raw) {
            Ok(plain) => self.process(plain),
            Err(e) => debug!(peer = %self.remote, error = %e, "dropping datagram"),
        }
    }

    fn open(&self, raw: &[u8]) -> TransportResult<Vec<u8>> {
        if raw.is_empty() {
            return Err(RecordError::Truncated {
                expected: 1,
                actual: 0,
            }
            .into());
        }
        if core_kind(raw).is_some_and(|kind| kind.is_handshake()) {
            return Ok(raw.to_vec());
        }
        let cipher = self.cipher.read().unwrap_or_else(PoisonError::into_inner);
        let cipher = cipher.as_ref().ok_or(TransportError::CipherNotReady)?;
        Ok(cipher.decrypt(raw, clear_prefix(raw)))
    }

    /// Dispatch `plain` and everything nested inside it.
    ///
    /// Nested records go on an explicit stack, children pushed in reverse,
    /// so delivery order matches a depth-first walk without recursion.
    fn process(&self, plain: Vec<u8>) {
        let mut work = vec![plain];
        while let Some(record) = work.pop() {
            if self.is_closed() {
                break;
            }
            match self.dispatch(record, &mut work) {
                Ok(()) => {}
                Err(e) if e.is_silent_drop() => {
                    debug!(peer = %self.remote, error = %e, "dropping record");
                }
                Err(e) => warn!(peer = %self.remote, error = %e, "record handling failed"),
            }
        }
    }

    fn dispatch(&self, record: Vec<u8>, work: &mut Vec<Vec<u8>>) -> TransportResult<()> {
        if record.is_empty() {
            return Ok(());
        }
        let Some(core) = CoreRecord::parse(&record)? else {
            self.deliver(Delivery::Payload(record));
            return Ok(());
        };

        match core {
            CoreRecord::Connect { key, version } => self.on_connect(key, version),
            CoreRecord::ConnectResponse { server_key } => {
                debug!(peer = %self.remote, server_key, "ignoring late ConnectResponse");
            }
            CoreRecord::Reliable { seq, inner } => self.on_reliable(seq, inner, work),
            CoreRecord::Ack { seq } => {
                let retired = lock(&self.outbound).acknowledge(seq);
                trace!(peer = %self.remote, seq, retired, "ack");
            }
            CoreRecord::Heartbeat { sender_time, .. } => {
                let reply = CoreRecord::HeartbeatResponse {
                    echoed_time: sender_time,
                    sender_time: self.clock.now(),
                };
                let _ = self.enqueue(reply.encode());
            }
            CoreRecord::HeartbeatResponse {
                echoed_time,
                sender_time,
            } => {
                let sample = HeartbeatSample {
                    echoed_time,
                    peer_time: sender_time,
                    received_at: self.clock.now(),
                };
                trace!(peer = %self.remote, rtt = ?sample.round_trip(), "heartbeat answered");
                lock(&self.heartbeat).on_response(sample);
            }
            CoreRecord::Disconnect => self.on_disconnect(),
            CoreRecord::Fragment(chunk) => {
                let limit = self.config.max_reassembly_size;
                let mut inbound = lock(&self.inbound);
                let fragments = &mut inbound.fragments;
                let was_discarding = fragments.is_discarding();
                if fragments.push(chunk, limit) {
                    trace!(peer = %self.remote, held = fragments.len(), "fragment");
                } else if !was_discarding {
                    warn!(peer = %self.remote, limit, "fragmented payload too large, discarding");
                }
            }
            CoreRecord::FragmentTail(chunk) => {
                match lock(&self.inbound).fragments.finish(chunk) {
                    Some(payload) => {
                        trace!(peer = %self.remote, len = payload.len(), "reassembled");
                        work.push(payload);
                    }
                    None => debug!(peer = %self.remote, "end of discarded fragment stream"),
                }
            }
            CoreRecord::StreamRequest { total_length, .. } => {
                debug!(peer = %self.remote, total_length, "stream requested, not supported");
            }
            CoreRecord::StreamCancel => {
                self.send_reliable(&CoreRecord::StreamCancelAck.encode())?;
            }
            CoreRecord::StreamCancelAck => {
                debug!(peer = %self.remote, "stream cancel acknowledged");
            }
            CoreRecord::Cluster(body) => {
                let mut entries = ClusterEntries::new(&body);
                let nested: Vec<Vec<u8>> = entries.by_ref().map(<[u8]>::to_vec).collect();
                if entries.is_truncated() {
                    debug!(peer = %self.remote, "cluster entry overruns body, rest skipped");
                }
                work.extend(nested.into_iter().rev());
            }
        }
        Ok(())
    }

    fn on_connect(&self, client_key: i32, version: u16) {
        let Role::Server(policy) = self.role else {
            warn!(peer = %self.remote, "client received Connect");
            return;
        };
        let phase = self.phase();
        if matches!(phase, ConnectionPhase::Closing | ConnectionPhase::Closed) {
            return;
        }

        let rekey = phase == ConnectionPhase::Online;
        if rekey && self.client_key_matches(client_key, policy) {
            // Our response was lost; answer again with the same key.
            if let Some(server_key) = self.session_key() {
                let _ = self.enqueue(CoreRecord::ConnectResponse { server_key }.encode());
            }
            return;
        }

        let server_key = policy.server_key(client_key);
        let _ = self.enqueue(CoreRecord::ConnectResponse { server_key }.encode());
        if rekey {
            info!(peer = %self.remote, "peer reconnected with a new key, resetting session");
            *lock(&self.outbound) = OutboundWindow::default();
            let mut inbound = lock(&self.inbound);
            inbound.window.clear();
            inbound.fragments.clear();
        }
        self.install_cipher(client_key, server_key);
        self.set_phase(ConnectionPhase::Online);
        info!(peer = %self.remote, version, "connection online");
        self.deliver(Delivery::Connected);
    }

    fn client_key_matches(&self, client_key: i32, policy: ServerKeyPolicy) -> bool {
        match policy {
            ServerKeyPolicy::Echo => self.session_key() == Some(client_key),
            // A random key carries no trace of the client's; treat a repeat
            // Connect as a lost response.
            ServerKeyPolicy::Random => true,
        }
    }

    fn on_reliable(&self, seq: u32, inner: Vec<u8>, work: &mut Vec<Vec<u8>>) {
        let (outcome, buffered) = {
            let mut inbound = lock(&self.inbound);
            let outcome = inbound.window.receive(seq, inner, self.config.reorder_limit);
            (outcome, inbound.window.buffered())
        };

        match outcome {
            InboundOutcome::Duplicate { ack } => {
                trace!(peer = %self.remote, seq, "duplicate envelope");
                let _ = self.enqueue(CoreRecord::Ack { seq: ack }.encode());
            }
            InboundOutcome::Accepted { ready } => {
                if buffered > REORDER_WARN_THRESHOLD {
                    warn!(peer = %self.remote, seq, buffered, "reorder buffer growing");
                }
                let mut inners = Vec::with_capacity(ready.len());
                for (seq, inner) in ready {
                    let _ = self.enqueue(CoreRecord::Ack { seq }.encode());
                    inners.push(inner);
                }
                work.extend(inners.into_iter().rev());
            }
            InboundOutcome::OutOfWindow => {
                debug!(peer = %self.remote, seq, "envelope beyond reorder window");
            }
        }
    }

    fn on_disconnect(&self) {
        info!(peer = %self.remote, "peer disconnected");
        self.release();
        self.deliver(Delivery::Closed);
    }

    fn install_cipher(&self, client_key: i32, server_key: i32) {
        let cipher = crypto::establish(client_key, server_key);
        *self.cipher.write().unwrap_or_else(PoisonError::into_inner) = Some(cipher);
        *lock(&self.session_key) = Some(server_key);
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        *lock(&self.phase) = phase;
    }
}
