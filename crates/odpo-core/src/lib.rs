//! Core types, traits, and configuration for odpo.
//!
//! This crate provides the foundational pieces shared by the trainer, the
//! distributed layer and the CLI:
//!
//! - Run configuration (training, rollout and online DPO sections)
//! - Batch layout arithmetic with exact-division checks
//! - Error handling infrastructure
//! - Learning rate scheduling
//! - Telemetry callback trait and metric types

#![warn(missing_docs)]

mod config;
mod error;
pub mod layout;
pub mod scheduler;
mod traits;
mod types;

pub use config::*;
pub use error::*;
pub use layout::{exact_div, BatchLayout};
pub use scheduler::LearningRateScheduler;
pub use traits::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{OdpoError, Result};
    pub use crate::layout::BatchLayout;
    pub use crate::scheduler::LearningRateScheduler;
    pub use crate::traits::*;
    pub use crate::types::*;
}
