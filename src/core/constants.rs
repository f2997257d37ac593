//! Protocol constants for the Subspace core transport.
//!
//! Wire values are fixed by the protocol and MUST NOT be changed; timing
//! values are defaults that the config builders may override.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// First byte of every transport-internal record.
pub const CORE_MARKER: u8 = 0x00;

/// Encryption protocol version carried in the Connect record.
pub const VIE_VERSION: u16 = 0x0001;

/// Largest datagram either side will emit or accept.
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Payloads longer than this are split into fragments.
pub const MAX_CHUNK_SIZE: usize = 480;

/// Largest record that fits in one cluster entry (one-byte length prefix).
pub const MAX_CLUSTER_ENTRY: usize = 255;

/// Unencrypted bytes at the start of an application record.
pub const APP_CLEAR_PREFIX: usize = 1;

/// Unencrypted bytes at the start of a transport-internal record.
pub const CORE_CLEAR_PREFIX: usize = 2;

// =============================================================================
// CORE RECORD KINDS
// =============================================================================

/// Client key offer.
pub const KIND_CONNECT: u8 = 0x01;

/// Server key answer.
pub const KIND_CONNECT_RESPONSE: u8 = 0x02;

/// Sequenced envelope carrying one inner record.
pub const KIND_RELIABLE: u8 = 0x03;

/// Cumulative acknowledgement.
pub const KIND_ACK: u8 = 0x04;

/// Periodic clock and counter probe.
pub const KIND_HEARTBEAT: u8 = 0x05;

/// Answer to a heartbeat.
pub const KIND_HEARTBEAT_RESPONSE: u8 = 0x06;

/// Session teardown.
pub const KIND_DISCONNECT: u8 = 0x07;

/// Non-final slice of a large payload.
pub const KIND_FRAGMENT: u8 = 0x08;

/// Final slice of a large payload.
pub const KIND_FRAGMENT_TAIL: u8 = 0x09;

/// Announces a streamed transfer.
pub const KIND_STREAM_REQUEST: u8 = 0x0A;

/// Aborts a streamed transfer.
pub const KIND_STREAM_CANCEL: u8 = 0x0B;

/// Confirms a stream abort.
pub const KIND_STREAM_CANCEL_ACK: u8 = 0x0C;

/// Batch of length-prefixed records.
pub const KIND_CLUSTER: u8 = 0x0E;

// =============================================================================
// CIPHER
// =============================================================================

/// Number of 32-bit words in the VIE keystream table.
pub const VIE_TABLE_WORDS: usize = 130;

// =============================================================================
// QUEUES
// =============================================================================

/// Capacity of each inbound delivery queue.
pub const INBOUND_QUEUE_SIZE: usize = 500;

/// Capacity of each outbound record queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 500;

/// Reorder buffer size past which a warning is logged.
pub const REORDER_WARN_THRESHOLD: usize = 30;

/// Reliable records further ahead than this are dropped unacknowledged.
pub const REORDER_LIMIT: u32 = 1024;

/// Largest payload a fragment stream may reassemble to.
pub const MAX_REASSEMBLY_SIZE: usize = 1 << 20;

// =============================================================================
// TIMING
// =============================================================================

/// Interval between heartbeats sent by a client.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Unacknowledged envelopes older than this are retransmitted.
pub const RESEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the client checks for envelopes to retransmit.
pub const RESEND_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// How often the server sweeps every connection for retransmits.
pub const SERVER_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-attempt wait for a ConnectResponse.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Number of Connect attempts before giving up.
pub const HANDSHAKE_ATTEMPTS: u32 = 3;

/// Socket read timeout so loops can observe shutdown.
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time a closing connection is given to flush queued records.
pub const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Bound on waiting for a worker task to exit.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// NETWORK
// =============================================================================

/// Conventional zone server port.
pub const DEFAULT_PORT: u16 = 5000;
