//! Echo client: sends a handful of records, one large enough to be
//! fragmented, and checks each comes back.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use subspace_transport::client::{ClientBuilder, Received};
use tracing::{info, warn};

use crate::DemoError;

const ROUNDS: u8 = 5;

/// Connect, echo, disconnect.
pub async fn run(server_addr: SocketAddr) -> Result<(), DemoError> {
    let mut client = ClientBuilder::new().server_addr(server_addr).connect().await?;
    info!(local = %client.local_addr(), server_key = client.server_key(), "connected");

    let large: Vec<u8> = std::iter::once(0x02)
        .chain((0..1999u32).map(|i| (i % 250) as u8))
        .collect();
    let mut payloads: Vec<Vec<u8>> = (0..ROUNDS)
        .map(|i| format!("\x01echo #{i}").into_bytes())
        .collect();
    payloads.push(large);

    for payload in &payloads {
        let started = Instant::now();
        client.send(payload, true)?;
        match client.receive(Duration::from_secs(5)).await {
            Received::Payload(reply) if reply == *payload => {
                info!(len = reply.len(), elapsed = ?started.elapsed(), "echoed");
            }
            Received::Payload(reply) => warn!(len = reply.len(), "unexpected reply"),
            Received::Closed => {
                warn!("server closed the connection");
                return Ok(());
            }
            Received::TimedOut => warn!(len = payload.len(), "no echo within 5s"),
        }
    }

    if let Some(srtt) = client.connection().smoothed_rtt() {
        info!(?srtt, "heartbeat round trip");
    }
    info!(stats = ?client.stats(), "closing");
    client.close().await;
    Ok(())
}
