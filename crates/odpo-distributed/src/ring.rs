//! Ring all-reduce and ring broadcast over [`TcpTransport`].

use crate::{
    config::DistributedConfig,
    error::DistributedError,
    transport::{TcpTransport, TransportReceiver, TransportSender},
    DistributedBackend,
};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Backend connecting all workers in a single TCP ring.
pub struct RingBackend {
    rank: usize,
    world_size: usize,
    sender: Mutex<TransportSender>,
    receiver: Mutex<TransportReceiver>,
}

impl RingBackend {
    /// Connect to the ring described by `config`.
    pub async fn new(config: DistributedConfig) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = TcpTransport::connect(&config).await?;
        Ok(Self {
            rank: config.rank,
            world_size: config.world_size(),
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        })
    }

    /// Element range of chunk `idx` when `len` elements are split over the ring.
    fn chunk_range(&self, len: usize, idx: usize) -> std::ops::Range<usize> {
        let chunk_size = len / self.world_size;
        let remainder = len % self.world_size;
        let start = idx * chunk_size + idx.min(remainder);
        let end = start + chunk_size + usize::from(idx < remainder);
        start..end
    }
}

#[async_trait]
impl DistributedBackend for RingBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_reduce(&self, buffer: &mut [f32]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        let len = buffer.len();
        let ws = self.world_size;

        let mut sender = self.sender.lock().await;
        let mut receiver = self.receiver.lock().await;
        let mut recv_buf = vec![0f32; len / ws + 1];

        // Scatter-reduce: after ws - 1 rounds chunk (rank + 1) % ws holds the full sum.
        let mut send_idx = self.rank;
        let mut recv_idx = (self.rank + ws - 1) % ws;
        for _ in 0..ws - 1 {
            let send_range = self.chunk_range(len, send_idx);
            let recv_range = self.chunk_range(len, recv_idx);
            let outgoing = buffer[send_range].to_vec();
            let incoming = &mut recv_buf[..recv_range.len()];

            tokio::try_join!(
                sender.send(bytemuck::cast_slice(&outgoing[..])),
                receiver.recv(bytemuck::cast_slice_mut(&mut *incoming))
            )?;

            for (dst, src) in buffer[recv_range].iter_mut().zip(incoming.iter()) {
                *dst += *src;
            }

            send_idx = recv_idx;
            recv_idx = (recv_idx + ws - 1) % ws;
        }

        // All-gather: circulate the reduced chunks.
        send_idx = (self.rank + 1) % ws;
        recv_idx = self.rank;
        for _ in 0..ws - 1 {
            let send_range = self.chunk_range(len, send_idx);
            let recv_range = self.chunk_range(len, recv_idx);
            let outgoing = buffer[send_range].to_vec();
            let incoming = &mut recv_buf[..recv_range.len()];

            tokio::try_join!(
                sender.send(bytemuck::cast_slice(&outgoing[..])),
                receiver.recv(bytemuck::cast_slice_mut(&mut *incoming))
            )?;

            buffer[recv_range].copy_from_slice(incoming);

            send_idx = recv_idx;
            recv_idx = (recv_idx + ws - 1) % ws;
        }

        Ok(())
    }

    async fn broadcast(&self, buffer: &mut [u8], root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(DistributedError::InvalidRoot {
                root,
                world_size: self.world_size,
            }
            .into());
        }
        if self.world_size == 1 {
            return Ok(());
        }

        let next = (self.rank + 1) % self.world_size;
        if self.rank != root {
            self.receiver.lock().await.recv(buffer).await?;
        }
        if next != root {
            self.sender.lock().await.send(buffer).await?;
        }
        Ok(())
    }

    async fn barrier(&self) -> Result<()> {
        let mut token = [0f32; 1];
        self.all_reduce(&mut token).await
    }
}
