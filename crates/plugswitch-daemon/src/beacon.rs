//! Alpaca UDP discovery responder

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Discovery request payload prefix
pub const DISCOVERY_MESSAGE: &[u8] = b"alpacadiscovery1";

/// Standard Alpaca discovery port
pub const DISCOVERY_PORT: u16 = 32227;

/// Reply body announcing the HTTP port
pub fn discovery_response(alpaca_port: u16) -> Vec<u8> {
    serde_json::json!({ "AlpacaPort": alpaca_port })
        .to_string()
        .into_bytes()
}

/// Bind the discovery socket
pub async fn bind(address: &str, port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(format!("{}:{}", address, port)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Answer discovery requests until `cancel` fires
pub async fn run(socket: UdpSocket, alpaca_port: u16, cancel: CancellationToken) -> Result<()> {
    let reply = discovery_response(alpaca_port);
    let mut buf = [0u8; 1024];

    info!(address = %socket.local_addr()?, alpaca_port, "Alpaca discovery responder started");

    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "Discovery receive failed");
                    continue;
                }
            },
        };

        if !buf[..len].starts_with(DISCOVERY_MESSAGE) {
            debug!(peer = %peer, len, "Ignoring non-discovery datagram");
            continue;
        }

        debug!(peer = %peer, "Answering Alpaca discovery");
        if let Err(e) = socket.send_to(&reply, peer).await {
            warn!(peer = %peer, error = %e, "Discovery reply failed");
        }
    }

    info!("Alpaca discovery responder stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_answers_discovery() {
        let socket = bind("127.0.0.1", 0).await.unwrap();
        let address = socket.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(socket, 5555, cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", address).await.unwrap();
        client.send_to(b"alpacadiscovery1", address).await.unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(body["AlpacaPort"], 5555);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
