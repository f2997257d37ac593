//! Subspace transport layer.
//!
//! Everything between the record codec and the UDP socket:
//!
//! - **Connection state machine**: [`Connection`] with handshake, dispatch
//!   and lifecycle handling
//! - **Reliable delivery**: [`OutboundWindow`] / [`InboundWindow`] for
//!   sequencing, cumulative acks and resends
//! - **Heartbeats**: [`TransportClock`] and [`HeartbeatTracker`]
//! - **Async sockets**: [`DatagramSocket`] wrapper for tokio UDP
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Client / Server                  │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │  reliability, fragments, clusters       │
//! ├─────────────────────────────────────────┤
//! │      Codec + VIE cipher                 │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod config;
mod connection;
mod error;
mod reliable;
mod socket;
mod timing;

pub use config::{TransportConfig, TransportConfigBuilder};
pub use connection::*;
pub use error::*;
pub use reliable::{
    FragmentAccumulator, InboundOutcome, InboundWindow, OutboundWindow, PendingEnvelope,
};
pub use socket::*;
pub use timing::{HeartbeatSample, HeartbeatTracker, TransportClock, TICK};
