//! Echo server: every application record is sent back reliably.

use std::net::SocketAddr;
use std::time::Duration;

use subspace_transport::server::{ServerBuilder, ServerEvent};
use tracing::{info, warn};

use crate::DemoError;

/// Serve until Ctrl-C.
pub async fn run(bind_addr: SocketAddr) -> Result<(), DemoError> {
    let server = ServerBuilder::new().bind_addr(bind_addr).bind().await?;
    info!(addr = %server.local_addr(), "echo server ready");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = server.recv(Duration::from_millis(100)) => match event? {
                Some(ServerEvent::PeerConnected { addr }) => {
                    info!(peer = %addr, sessions = server.session_count().await, "peer connected");
                }
                Some(ServerEvent::Payload { from, data }) => {
                    if let Err(e) = server.send(from, &data, true).await {
                        warn!(peer = %from, error = %e, "echo failed");
                    }
                }
                Some(ServerEvent::PeerDisconnected { addr }) => {
                    info!(peer = %addr, "peer disconnected");
                }
                None => {}
            },
        }
    }

    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
