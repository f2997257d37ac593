//! Per-connection tunables.

use std::time::Duration;

use crate::core::constants::*;

/// Settings shared by every connection of one endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Payloads longer than this are fragmented.
    pub max_chunk_size: usize,

    /// Receive buffer size; larger datagrams are truncated by the OS.
    pub max_datagram_size: usize,

    /// Capacity of the application delivery queue.
    pub inbound_queue_size: usize,

    /// Capacity of the per-connection outbound queue.
    pub outbound_queue_size: usize,

    /// Age after which an unacknowledged envelope is sent again.
    pub resend_timeout: Duration,

    /// How often pending envelopes are checked.
    pub resend_sweep_interval: Duration,

    /// Heartbeat period, or `None` to only answer peer heartbeats.
    pub heartbeat_interval: Option<Duration>,

    /// How far ahead of the next expected sequence number a reliable
    /// record may be buffered.
    pub reorder_limit: u32,

    /// Largest payload a fragment stream may reassemble to.
    pub max_reassembly_size: usize,

    /// Socket read timeout used to poll for shutdown.
    pub poll_interval: Duration,

    /// Time allowed to flush queued records on close.
    pub close_grace_period: Duration,

    /// Bound on waiting for each worker task to exit.
    pub join_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: MAX_CHUNK_SIZE,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            inbound_queue_size: INBOUND_QUEUE_SIZE,
            outbound_queue_size: OUTBOUND_QUEUE_SIZE,
            resend_timeout: RESEND_TIMEOUT,
            resend_sweep_interval: RESEND_SWEEP_INTERVAL,
            heartbeat_interval: Some(HEARTBEAT_INTERVAL),
            reorder_limit: REORDER_LIMIT,
            max_reassembly_size: MAX_REASSEMBLY_SIZE,
            poll_interval: SOCKET_POLL_INTERVAL,
            close_grace_period: CLOSE_GRACE_PERIOD,
            join_timeout: JOIN_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Defaults for the server side: slower sweep, no unsolicited
    /// heartbeats.
    pub fn server() -> Self {
        Self {
            resend_sweep_interval: SERVER_SWEEP_INTERVAL,
            heartbeat_interval: None,
            ..Self::default()
        }
    }

    /// Start a builder from the client defaults.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Clone)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Start from an existing configuration.
    pub fn from_config(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Set the fragmentation threshold.
    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.config.max_chunk_size = size.max(1);
        self
    }

    /// Set the receive buffer size.
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.config.max_datagram_size = size;
        self
    }

    /// Set both queue capacities.
    pub fn queue_size(mut self, size: usize) -> Self {
        self.config.inbound_queue_size = size.max(1);
        self.config.outbound_queue_size = size.max(1);
        self
    }

    /// Set the resend age threshold.
    pub fn resend_timeout(mut self, timeout: Duration) -> Self {
        self.config.resend_timeout = timeout;
        self
    }

    /// Set the resend sweep period.
    pub fn resend_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.resend_sweep_interval = interval;
        self
    }

    /// Set or disable the heartbeat period.
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the reorder window.
    pub fn reorder_limit(mut self, limit: u32) -> Self {
        self.config.reorder_limit = limit;
        self
    }

    /// Set the largest payload fragments may reassemble to.
    pub fn max_reassembly_size(mut self, size: usize) -> Self {
        self.config.max_reassembly_size = size;
        self
    }

    /// Set the socket poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the close grace period.
    pub fn close_grace_period(mut self, period: Duration) -> Self {
        self.config.close_grace_period = period;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportConfig {
        self.config
    }
}
