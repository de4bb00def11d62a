//! Distributed execution layer for odpo.
//!
//! Data-parallel workers exchange gradients and metrics through a small set
//! of collectives. The trainer only sees the synchronous [`Collective`]
//! capability, so the whole algorithm runs unchanged in a single process
//! with [`LocalCollective`].
//!
//! # Multi-worker setup
//!
//! ```ignore
//! use odpo_distributed::{BlockingCollective, DistributedConfig};
//!
//! let config = DistributedConfig::new(
//!     vec!["192.168.1.10:52416".parse()?, "192.168.1.11:52416".parse()?],
//!     0, // This worker's rank
//! );
//! let collective = BlockingCollective::connect(config)?;
//! ```
//!
//! # Layers
//!
//! ```text
//! trainer ──► Collective (sync) ──► DistributedContext ──► DistributedBackend (async)
//!                                                              └─ RingBackend ─► TcpTransport
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;

pub mod collective;
pub mod config;
pub mod error;
pub mod ring;
pub mod transport;

pub use collective::{BlockingCollective, Collective, LocalCollective};
pub use config::DistributedConfig;
pub use error::{DistributedError, DistributedResult};
pub use ring::RingBackend;

/// Asynchronous collectives over a fixed set of workers.
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Index of this worker in `0..world_size`.
    fn rank(&self) -> usize;

    /// Number of workers in the ring.
    fn world_size(&self) -> usize;

    /// Element-wise sum of `buffer` across all workers, in place.
    async fn all_reduce(&self, buffer: &mut [f32]) -> Result<()>;

    /// Overwrite `buffer` on every worker with the bytes held by `root`.
    async fn broadcast(&self, buffer: &mut [u8], root: usize) -> Result<()>;

    /// Return once every worker has entered.
    async fn barrier(&self) -> Result<()>;
}

/// Backend wrapper that traces every collective it runs.
pub struct DistributedContext {
    backend: Box<dyn DistributedBackend>,
}

impl DistributedContext {
    /// Wrap `backend`.
    pub fn new(backend: Box<dyn DistributedBackend>) -> Self {
        Self { backend }
    }

    /// Index of this worker.
    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    /// Number of workers.
    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    /// Sum `buffer` across workers.
    pub async fn all_reduce(&self, buffer: &mut [f32]) -> Result<()> {
        let started = Instant::now();
        let outcome = self.backend.all_reduce(buffer).await;
        debug!(
            floats = buffer.len(),
            ms = started.elapsed().as_secs_f64() * 1e3,
            ok = outcome.is_ok(),
            "all_reduce"
        );
        outcome
    }

    /// Copy `root`'s `buffer` to every worker.
    pub async fn broadcast(&self, buffer: &mut [u8], root: usize) -> Result<()> {
        let started = Instant::now();
        let outcome = self.backend.broadcast(buffer, root).await;
        debug!(
            bytes = buffer.len(),
            root,
            ms = started.elapsed().as_secs_f64() * 1e3,
            ok = outcome.is_ok(),
            "broadcast"
        );
        outcome
    }

    /// Wait for every worker.
    pub async fn barrier(&self) -> Result<()> {
        self.backend.barrier().await
    }
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::collective::{BlockingCollective, Collective, LocalCollective};
    pub use crate::config::DistributedConfig;
    pub use crate::error::{DistributedError, DistributedResult};
    pub use crate::ring::RingBackend;
    pub use crate::DistributedBackend;
    pub use crate::DistributedContext;
}
