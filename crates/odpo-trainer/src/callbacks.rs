//! Telemetry sinks for the online DPO loop.
//!
//! - [`ProgressCallback`] - progress bar over update steps
//! - [`LoggingCallback`] - `tracing` events
//! - [`MetricsJsonCallback`] - JSONL metrics file, one object per update
//! - [`CompositeCallback`] - fan-out to several sinks
//!
//! The trainer only calls sinks on the main process.

use odpo_core::{InspectionTable, RunInfo, TrainingCallback, UpdateMetrics};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Rows of the inspection table printed to the log.
pub const TABLE_PREVIEW_ROWS: usize = 5;

/// Progress bar over update steps.
pub struct ProgressCallback {
    progress: indicatif::ProgressBar,
}

impl ProgressCallback {
    /// Create a progress bar for `total_updates` updates.
    pub fn new(total_updates: usize) -> Self {
        let progress = indicatif::ProgressBar::new(total_updates as u64);
        match indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        {
            Ok(style) => progress.set_style(style.progress_chars("#>-")),
            Err(e) => tracing::warn!(error = %e, "Invalid progress template, using default style"),
        }
        Self { progress }
    }
}

impl TrainingCallback for ProgressCallback {
    fn on_train_start(&mut self, run: &RunInfo) {
        self.progress.set_length(run.num_total_batches as u64);
        self.progress.reset();
    }

    fn on_update_end(&mut self, update: usize, metrics: &UpdateMetrics) {
        self.progress.set_position(update as u64);
        if let Some(loss) = metrics.get("loss/policy_avg") {
            self.progress.set_message(format!("loss: {loss:.4}"));
        }
    }

    fn on_train_end(&mut self) {
        self.progress.finish_with_message("Training complete!");
    }
}

/// Logs every update's metrics and the head of every inspection table.
pub struct LoggingCallback {
    log_every: usize,
}

impl LoggingCallback {
    /// Log every `log_every` updates (at least every update).
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every: log_every.max(1),
        }
    }
}

impl Default for LoggingCallback {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TrainingCallback for LoggingCallback {
    fn on_train_start(&mut self, run: &RunInfo) {
        tracing::info!(
            run_name = %run.run_name,
            world_size = run.world_size,
            updates = run.num_total_batches,
            "Training started"
        );
    }

    fn on_update_end(&mut self, update: usize, metrics: &UpdateMetrics) {
        if update % self.log_every != 0 {
            return;
        }
        tracing::info!(
            update,
            episode = metrics.get("episode").unwrap_or_default(),
            loss = metrics.get("loss/policy_avg").unwrap_or(f64::NAN),
            scores = metrics.get("objective/scores").unwrap_or(f64::NAN),
            kl = metrics.get("objective/kl").unwrap_or(f64::NAN),
            accuracy = metrics.get("rewards/accuracies").unwrap_or(f64::NAN),
            lr = metrics.get("lr").unwrap_or_default(),
            "Update complete"
        );
    }

    fn on_eval_table(&mut self, update: usize, table: &InspectionTable) {
        tracing::info!(
            update,
            rows = table.len(),
            "Evaluation samples\n{}",
            table.render(TABLE_PREVIEW_ROWS)
        );
    }

    fn on_train_end(&mut self) {
        tracing::info!("Training complete");
    }
}

/// JSONL metrics sink.
///
/// ```json
/// {"event": "update", "update": 3, "metrics": {"eps": 12.0, "lr": 0.00005}, "timestamp": "2024-12-31T12:00:00Z"}
/// ```
pub struct MetricsJsonCallback {
    writer: BufWriter<File>,
    path: PathBuf,
    run_name: Option<String>,
}

impl MetricsJsonCallback {
    /// Create or truncate the metrics file at `path`, creating its directory.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            writer: BufWriter::new(File::create(&path)?),
            path,
            run_name: None,
        })
    }

    /// Name written in the `train_start` event instead of the generated one.
    pub fn with_run_name(self, name: impl Into<String>) -> Self {
        Self {
            run_name: Some(name.into()),
            ..self
        }
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line and flush it. Write failures are logged, not raised.
    fn emit(&mut self, event: &str, mut fields: serde_json::Value) {
        if let serde_json::Value::Object(map) = &mut fields {
            map.insert("event".into(), event.into());
            map.insert("timestamp".into(), chrono::Utc::now().to_rfc3339().into());
        }
        let written = serde_json::to_writer(&mut self.writer, &fields)
            .map_err(std::io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush());
        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), error = %e, "Dropped metrics event");
        }
    }
}

impl TrainingCallback for MetricsJsonCallback {
    fn on_train_start(&mut self, run: &RunInfo) {
        let run_name = self.run_name.clone().unwrap_or_else(|| run.run_name.clone());
        self.emit(
            "train_start",
            serde_json::json!({
                "run_name": run_name,
                "world_size": run.world_size,
                "num_total_batches": run.num_total_batches,
            }),
        );
    }

    fn on_update_end(&mut self, update: usize, metrics: &UpdateMetrics) {
        self.emit(
            "update",
            serde_json::json!({ "update": update, "metrics": metrics }),
        );
    }

    fn on_eval_table(&mut self, update: usize, table: &InspectionTable) {
        self.emit(
            "eval_table",
            serde_json::json!({ "update": update, "rows": table.rows }),
        );
    }

    fn on_train_end(&mut self) {
        self.emit("train_end", serde_json::json!({}));
    }
}

/// Forwards every event to each registered sink, in order.
#[derive(Default)]
pub struct CompositeCallback {
    sinks: Vec<Box<dyn TrainingCallback>>,
}

impl CompositeCallback {
    /// Create an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink.
    pub fn add(&mut self, sink: Box<dyn TrainingCallback>) {
        self.sinks.push(sink);
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TrainingCallback for CompositeCallback {
    fn on_train_start(&mut self, run: &RunInfo) {
        for sink in &mut self.sinks {
            sink.on_train_start(run);
        }
    }

    fn on_update_end(&mut self, update: usize, metrics: &UpdateMetrics) {
        for sink in &mut self.sinks {
            sink.on_update_end(update, metrics);
        }
    }

    fn on_eval_table(&mut self, update: usize, table: &InspectionTable) {
        for sink in &mut self.sinks {
            sink.on_eval_table(update, table);
        }
    }

    fn on_train_end(&mut self) {
        for sink in &mut self.sinks {
            sink.on_train_end();
        }
    }
}
