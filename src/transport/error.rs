//! Transport layer error types.
//!
//! Most of these never reach the application: the receive path logs them
//! and drops the offending datagram.

use std::io;

use thiserror::Error;

use crate::core::RecordError;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Record could not be decoded or encoded.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A non-handshake record arrived or left before the key exchange.
    #[error("cipher used before key exchange")]
    CipherNotReady,

    /// Bounded queue is full; the newest item was dropped.
    #[error("queue full")]
    QueueFull,

    /// Connection is closing or closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl TransportError {
    /// Errors that only cost the current datagram or record.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            Self::Record(_) | Self::CipherNotReady | Self::QueueFull
        )
    }

    /// Errors after which the connection is unusable.
    ///
    /// ICMP-driven and interrupted socket calls are transient: the next
    /// datagram may well succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
