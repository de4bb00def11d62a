//! Synchronous collectives used by the trainer.
//!
//! The training loop is blocking MLX code, so it talks to the cluster through
//! [`Collective`]. [`LocalCollective`] is the single-process implementation;
//! [`BlockingCollective`] drives a [`DistributedContext`] on its own tokio
//! runtime.

use crate::{config::DistributedConfig, error::DistributedError, ring::RingBackend, DistributedContext};
use anyhow::Result;
use tokio::runtime::Runtime;
use tracing::info;

/// Collective operations available to a data-parallel worker.
pub trait Collective {
    /// Rank of this worker.
    fn rank(&self) -> usize;

    /// Number of workers.
    fn world_size(&self) -> usize;

    /// Return `value` as held by `root` on every worker.
    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64>;

    /// Element-wise sum across workers, in place.
    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<()>;

    /// Element-wise mean across workers, in place.
    fn all_reduce_mean(&self, buffer: &mut [f32]) -> Result<()> {
        self.all_reduce_sum(buffer)?;
        let ws = self.world_size() as f32;
        for v in buffer.iter_mut() {
            *v /= ws;
        }
        Ok(())
    }

    /// Mean over the concatenation of every worker's `values`.
    ///
    /// Returns NaN when no worker contributed any value.
    fn gather_mean(&self, values: &[f32]) -> Result<f32> {
        let mut acc = [values.iter().sum::<f32>(), values.len() as f32];
        self.all_reduce_sum(&mut acc)?;
        Ok(acc[0] / acc[1])
    }

    /// Whether this worker logs and writes artifacts.
    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-process collective: every operation is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64> {
        if root != 0 {
            return Err(DistributedError::InvalidRoot {
                root,
                world_size: 1,
            }
            .into());
        }
        Ok(value)
    }

    fn all_reduce_sum(&self, _buffer: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

/// Blocking adapter over the TCP ring.
pub struct BlockingCollective {
    runtime: Runtime,
    context: DistributedContext,
}

impl BlockingCollective {
    /// Join the ring described by `config` and block until it is formed.
    ///
    /// Must not be called from within an async runtime.
    pub fn connect(config: DistributedConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| DistributedError::Runtime(e.to_string()))?;
        let backend = runtime.block_on(RingBackend::new(config))?;
        let context = DistributedContext::new(Box::new(backend));
        info!(
            rank = context.rank(),
            world_size = context.world_size(),
            "Joined worker ring"
        );
        Ok(Self { runtime, context })
    }

    /// Block until every worker reaches this point.
    pub fn barrier(&self) -> Result<()> {
        self.runtime.block_on(self.context.barrier())
    }
}

impl Collective for BlockingCollective {
    fn rank(&self) -> usize {
        self.context.rank()
    }

    fn world_size(&self) -> usize {
        self.context.world_size()
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64> {
        let mut buf = value.to_le_bytes();
        self.runtime.block_on(self.context.broadcast(&mut buf, root))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<()> {
        self.runtime.block_on(self.context.all_reduce(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::free_addrs;

    #[test]
    fn test_local_collective_identity() {
        let c = LocalCollective;
        let mut buf = [1.0, 2.0];
        c.all_reduce_mean(&mut buf).unwrap();
        assert_eq!(buf, [1.0, 2.0]);
        assert_eq!(c.broadcast_u64(7, 0).unwrap(), 7);
        assert!(c.broadcast_u64(7, 1).is_err());
        assert!(c.is_main_process());
    }

    #[test]
    fn test_local_gather_mean() {
        let c = LocalCollective;
        assert_eq!(c.gather_mean(&[1.0, 0.0, 1.0, 1.0]).unwrap(), 0.75);
        assert!(c.gather_mean(&[]).unwrap().is_nan());
    }

    #[test]
    fn test_blocking_collective_two_workers() {
        let nodes = free_addrs(2);
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let nodes = nodes.clone();
                std::thread::spawn(move || {
                    let c = BlockingCollective::connect(DistributedConfig::new(nodes, rank)).unwrap();
                    let time = c.broadcast_u64(1000 + rank as u64, 0).unwrap();
                    let mut grads = [rank as f32 * 2.0, 4.0];
                    c.all_reduce_mean(&mut grads).unwrap();
                    let values: Vec<f32> = if rank == 0 { vec![1.0, 1.0] } else { vec![0.0, 0.0] };
                    let acc = c.gather_mean(&values).unwrap();
                    c.barrier().unwrap();
                    (time, grads, acc)
                })
            })
            .collect();

        for handle in handles {
            let (time, grads, acc) = handle.join().unwrap();
            assert_eq!(time, 1000);
            assert_eq!(grads, [1.0, 4.0]);
            assert_eq!(acc, 0.5);
        }
    }
}
