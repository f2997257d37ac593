//! # Subspace transport
//!
//! The "core" UDP protocol spoken by Subspace / Continuum game clients and
//! zone servers: a small record codec, the legacy VIE stream cipher, and a
//! semi-reliable connection layer with acks, fragmentation, clustering and
//! heartbeats.
//!
//! ## Feature Flags
//!
//! - `transport` (default): connections, sockets and timers (tokio)
//! - `client` (default): [`client::Client`] with the key exchange
//! - `server` (default): [`server::Server`] multiplexer
//!
//! The codec and cipher are always built and have no async dependencies.
//!
//! ## Modules
//!
//! - [`core`]: constants, the record error type and the cipher trait
//! - [`codec`]: schema-driven records and the core record set
//! - [`crypto`]: VIE cipher and handshake key selection
//! - [`transport`]: per-peer connection state machine
//! - [`client`] / [`server`]: task-driven endpoints
//!
//! ## Example Usage
//!
//! ```rust
//! use subspace_transport::codec::CoreRecord;
//! use subspace_transport::crypto::VieCipher;
//! use subspace_transport::core::SessionCipher;
//!
//! let ack = CoreRecord::Ack { seq: 7 }.encode();
//! assert_eq!(ack, [0x00, 0x04, 7, 0, 0, 0]);
//!
//! let cipher = VieCipher::new(0x5678);
//! let wire = cipher.encrypt(&ack, 2);
//! assert_eq!(&wire[..2], &ack[..2]);
//! assert_eq!(cipher.decrypt(&wire, 2), ack);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Always included
pub mod codec;
pub mod core;
pub mod crypto;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::codec::{CoreKind, CoreRecord, Record, RecordSchema};
    pub use crate::core::*;
    pub use crate::crypto::{generate_key, ServerKeyPolicy, VieCipher};

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        Connection, ConnectionPhase, ConnectionStats, Delivery, HeartbeatSample, TransportConfig,
        TransportError, TransportResult,
    };

    #[cfg(feature = "client")]
    pub use crate::client::{Client, ClientBuilder, ClientConfig, ClientError, Received};

    #[cfg(feature = "server")]
    pub use crate::server::{Server, ServerBuilder, ServerConfig, ServerError, ServerEvent};
}

// Re-export commonly used items at crate root
pub use crate::codec::CoreRecord;
pub use crate::core::{RecordError, SessionCipher};

#[cfg(feature = "transport")]
pub use crate::transport::{Connection, ConnectionPhase, TransportConfig, TransportError};
