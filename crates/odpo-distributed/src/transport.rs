//! TCP transport for the worker ring.
//!
//! Every worker holds one outgoing stream to its successor and one incoming
//! stream from its predecessor. Frames are length-prefixed so a receiver can
//! reject a peer that disagrees about the payload size.

use crate::config::DistributedConfig;
use crate::error::{DistributedError, DistributedResult};
use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5000;

/// Sending half: the stream to the next worker.
pub struct TransportSender {
    stream: OwnedWriteHalf,
}

/// Receiving half: the stream from the previous worker.
pub struct TransportReceiver {
    stream: OwnedReadHalf,
}

impl TransportSender {
    /// Send one length-prefixed frame.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let header = (data.len() as u32).to_le_bytes();
        self.stream.write_all(&header).await?;
        self.stream.write_all(data).await?;
        Ok(())
    }
}

impl TransportReceiver {
    /// Receive one frame into `buffer`, which must match the frame size exactly.
    pub async fn recv(&mut self, buffer: &mut [u8]) -> Result<()> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        let announced = u32::from_le_bytes(header) as usize;
        if announced != buffer.len() {
            return Err(DistributedError::Protocol(format!(
                "peer announced a {announced}-byte frame, expected {}",
                buffer.len()
            ))
            .into());
        }

        self.stream.read_exact(buffer).await?;
        Ok(())
    }
}

/// Ring links over TCP.
pub struct TcpTransport;

impl TcpTransport {
    /// Join the ring: dial the successor while accepting the predecessor.
    pub async fn connect(config: &DistributedConfig) -> Result<(TransportSender, TransportReceiver)> {
        let listen_addr = config.local_addr();
        let listener = TcpListener::bind(listen_addr).await?;
        info!(rank = config.rank, %listen_addr, "Waiting for ring predecessor");

        let successor = config.nodes[config.next_rank()];
        let accept_within = Duration::from_millis(config.connection_timeout_ms);

        let (outgoing, incoming) = tokio::try_join!(
            dial(successor, config.max_retries),
            accept(&listener, listen_addr, accept_within),
        )?;

        let (_, write_half) = outgoing.into_split();
        let (read_half, _) = incoming.into_split();
        Ok((
            TransportSender { stream: write_half },
            TransportReceiver { stream: read_half },
        ))
    }
}

/// Connect to `addr`, backing off exponentially while it is not listening yet.
async fn dial(addr: SocketAddr, max_retries: u32) -> DistributedResult<TcpStream> {
    for attempt in 0..max_retries {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                disable_nagle(&stream);
                info!(%addr, attempt, "Connected to ring successor");
                return Ok(stream);
            }
            Err(e) => {
                if attempt == 0 {
                    debug!(%addr, error = %e, "Successor not up yet");
                }
                let shift = (attempt + 1).min(6);
                let delay = (INITIAL_BACKOFF_MS << shift).min(MAX_BACKOFF_MS);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
    Err(DistributedError::MaxRetriesExceeded { addr, max_retries })
}

async fn accept(
    listener: &TcpListener,
    listen_addr: SocketAddr,
    within: Duration,
) -> DistributedResult<TcpStream> {
    let (stream, peer) = timeout(within, listener.accept())
        .await
        .map_err(|_| DistributedError::ConnectionTimeout(listen_addr, within))??;
    disable_nagle(&stream);
    info!(%peer, "Accepted ring predecessor");
    Ok(stream)
}

fn disable_nagle(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "Could not set TCP_NODELAY");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Reserve `n` free loopback addresses.
    pub(crate) fn free_addrs(n: usize) -> Vec<SocketAddr> {
        let listeners: Vec<_> = (0..n)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners.iter().map(|l| l.local_addr().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_two_node_frames() {
        let nodes = free_addrs(2);
        let a = DistributedConfig::new(nodes.clone(), 0);
        let b = DistributedConfig::new(nodes, 1);

        let (ra, rb) = tokio::join!(TcpTransport::connect(&a), TcpTransport::connect(&b));
        let (mut send_a, mut recv_a) = ra.unwrap();
        let (mut send_b, mut recv_b) = rb.unwrap();

        send_a.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        recv_b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        send_b.send(b"pong!").await.unwrap();
        let mut wrong = [0u8; 4];
        assert!(recv_a.recv(&mut wrong).await.is_err());
    }
}
