//! Subspace Echo Demo
//!
//! Runs either an echo server or a client that exercises it.
//!
//! Environment variables:
//! - SUBSPACE_MODE: "server" (default) or "client"
//! - SUBSPACE_ADDR: bind address (server, default 0.0.0.0:5000) or server
//!   address (client, default 127.0.0.1:5000)
//! - RUST_LOG: tracing filter, e.g. `info` or `subspace_transport=debug`

mod client;
mod server;

use std::net::{AddrParseError, SocketAddr};

use subspace_transport::client::ClientError;
use subspace_transport::core::constants::DEFAULT_PORT;
use subspace_transport::server::ServerError;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Errors that end the demo.
#[derive(Debug, Error)]
pub enum DemoError {
    /// SUBSPACE_MODE is neither server nor client.
    #[error("unknown mode {0:?}, expected \"server\" or \"client\"")]
    InvalidMode(String),

    /// SUBSPACE_ADDR does not parse.
    #[error("invalid address {value:?}: {source}")]
    InvalidAddr {
        /// Raw value.
        value: String,
        /// Parse failure.
        #[source]
        source: AddrParseError,
    },

    /// Client failure.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Server failure.
    #[error(transparent)]
    Server(#[from] ServerError),
}

fn address(default: SocketAddr) -> Result<SocketAddr, DemoError> {
    match std::env::var("SUBSPACE_ADDR") {
        Ok(value) => value
            .parse()
            .map_err(|source| DemoError::InvalidAddr { value, source }),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "echo demo failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DemoError> {
    let mode = std::env::var("SUBSPACE_MODE").unwrap_or_else(|_| "server".into());
    match mode.as_str() {
        "server" => {
            let addr = address(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))?;
            server::run(addr).await
        }
        "client" => {
            let addr = address(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))?;
            client::run(addr).await
        }
        other => Err(DemoError::InvalidMode(other.to_string())),
    }
}
