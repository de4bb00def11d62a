//! Error types for odpo.

use thiserror::Error;

/// Result type alias for odpo operations.
pub type Result<T> = std::result::Result<T, OdpoError>;

/// Main error type for odpo operations.
#[derive(Error, Debug)]
pub enum OdpoError {
    /// Configuration errors. Always fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A batch size relation that must divide exactly does not.
    #[error("Batch layout error: {message} ({numerator} is not a multiple of {denominator})")]
    NonDivisible {
        /// What was being divided.
        message: String,
        /// Dividend.
        numerator: usize,
        /// Divisor.
        denominator: usize,
    },

    /// Tensor shape mismatch.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Training errors.
    #[error("Training error: {0}")]
    Training(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<serde_yaml::Error> for OdpoError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for OdpoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
