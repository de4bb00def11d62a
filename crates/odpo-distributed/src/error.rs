//! Errors raised by the ring transport and the collectives built on it.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Failure of a collective or of the links underneath it.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Socket failure on an established link.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The previous rank never connected.
    #[error("no connection from the previous rank on {0} within {1:?}")]
    ConnectionTimeout(SocketAddr, Duration),

    /// The next rank refused every connection attempt.
    #[error("gave up connecting to {addr} after {max_retries} attempts")]
    MaxRetriesExceeded { addr: SocketAddr, max_retries: u32 },

    /// Broadcast source outside `0..world_size`.
    #[error("root rank {root} does not exist in a world of {world_size}")]
    InvalidRoot { root: usize, world_size: usize },

    /// A peer sent a frame of unexpected size.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bad node list or rank.
    #[error("configuration error: {0}")]
    Config(String),

    /// The async runtime backing the blocking collective failed.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result of a distributed operation.
pub type DistributedResult<T> = Result<T, DistributedError>;
