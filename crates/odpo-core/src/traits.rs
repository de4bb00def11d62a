//! Core trait definitions.

use crate::{InspectionTable, RunInfo, UpdateMetrics};

/// Receiver for training telemetry.
///
/// All hooks default to no-ops. The trainer only invokes callbacks on the
/// main process, so implementations never need to deduplicate across ranks.
pub trait TrainingCallback: Send {
    /// Called once before the first update.
    fn on_train_start(&mut self, _run: &RunInfo) {}

    /// Called after every update step with the reduced metrics.
    fn on_update_end(&mut self, _update: usize, _metrics: &UpdateMetrics) {}

    /// Called whenever the evaluation sampler produced a table.
    fn on_eval_table(&mut self, _update: usize, _table: &InspectionTable) {}

    /// Called once after the last update.
    fn on_train_end(&mut self) {}
}
