//! Client key exchange.
//!
//! Sends Connect in the clear and waits for the matching ConnectResponse,
//! retransmitting on every attempt. Nothing else is accepted until the
//! exchange completes.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::ClientError;
use crate::codec::CoreRecord;
use crate::core::constants::VIE_VERSION;
use crate::transport::DatagramSocket;

/// Outcome of a completed key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Key this client offered.
    pub client_key: i32,
    /// Key the server answered with; drives the session cipher.
    pub server_key: i32,
    /// Attempts used, starting at 1.
    pub attempts: u32,
}

/// Run the Connect / ConnectResponse exchange against `server`.
///
/// Each attempt sends one Connect and waits up to `timeout` for an
/// answer. Datagrams from other addresses and anything other than a
/// ConnectResponse are ignored.
pub async fn handshake(
    socket: &mut DatagramSocket,
    server: SocketAddr,
    client_key: i32,
    attempts: u32,
    timeout: Duration,
) -> Result<HandshakeOutcome, ClientError> {
    let connect = CoreRecord::Connect {
        key: client_key,
        version: VIE_VERSION,
    }
    .encode();

    for attempt in 1..=attempts {
        debug!(%server, attempt, "sending Connect");
        socket.send_to(&connect, server).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some((data, from)) = socket.recv_from_timeout(remaining).await? else {
                break;
            };
            if from != server {
                trace!(%from, "ignoring datagram from unexpected address");
                continue;
            }
            match CoreRecord::parse(data) {
                Ok(Some(CoreRecord::ConnectResponse { server_key })) => {
                    info!(%server, server_key, attempt, "handshake complete");
                    return Ok(HandshakeOutcome {
                        client_key,
                        server_key,
                        attempts: attempt,
                    });
                }
                Ok(_) => trace!(%server, "ignoring record during handshake"),
                Err(e) => debug!(%server, error = %e, "dropping malformed handshake record"),
            }
        }
    }

    Err(ClientError::HandshakeTimeout { attempts })
}
