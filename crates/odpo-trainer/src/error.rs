//! Error type for the online DPO trainer.

use mlx_rs::error::Exception;
use odpo_core::OdpoError;

/// Error type for online DPO training.
#[derive(Debug, thiserror::Error)]
pub enum OnlineDpoError {
    /// MLX error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Invalid tensor shape or batch composition.
    #[error("Shape error: {0}")]
    Shape(String),
    /// Core error (layout, config parsing, serialization).
    #[error(transparent)]
    Core(#[from] OdpoError),
    /// Collective operation failed on this or a peer worker.
    #[error("Collective error: {0}")]
    Collective(#[from] anyhow::Error),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for online DPO operations.
pub type OnlineDpoResult<T> = std::result::Result<T, OnlineDpoError>;
