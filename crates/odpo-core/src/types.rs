//! Common type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scalar metrics reported once per update step, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateMetrics {
    values: BTreeMap<String, f64>,
}

impl UpdateMetrics {
    /// Create an empty metric map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a metric.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    /// Look up a metric.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Iterate metrics in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no metric has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One row of the evaluation inspection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRow {
    /// Rendered prompt.
    pub query: String,
    /// Rendered (truncated) model response.
    pub model_response: String,
    /// Scorer output for the response.
    pub score: f32,
}

/// Table of sampled completions produced by the evaluation sampler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionTable {
    /// Rows in sampling order.
    pub rows: Vec<InspectionRow>,
}

impl InspectionTable {
    /// Append a row.
    pub fn push(&mut self, row: InspectionRow) {
        self.rows.push(row);
    }

    /// First `n` rows.
    #[must_use]
    pub fn head(&self, n: usize) -> &[InspectionRow] {
        &self.rows[..n.min(self.rows.len())]
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render the first `n` rows as a plain text table.
    #[must_use]
    pub fn render(&self, n: usize) -> String {
        let rows = self.head(n);
        let query_w = rows
            .iter()
            .map(|r| r.query.len())
            .chain(std::iter::once("query".len()))
            .max()
            .unwrap_or(0);
        let resp_w = rows
            .iter()
            .map(|r| r.model_response.len())
            .chain(std::iter::once("model response".len()))
            .max()
            .unwrap_or(0);

        let mut out = format!(
            "{:<query_w$} | {:<resp_w$} | score\n",
            "query", "model response"
        );
        out.push_str(&format!("{}-+-{}-+------\n", "-".repeat(query_w), "-".repeat(resp_w)));
        for row in rows {
            out.push_str(&format!(
                "{:<query_w$} | {:<resp_w$} | {:.4}\n",
                row.query, row.model_response, row.score
            ));
        }
        out
    }
}

impl fmt::Display for InspectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(self.rows.len()))
    }
}

/// Identity of a training run, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    /// `"{exp_name}__{seed}__{unix_time}"` unless configured explicitly.
    pub run_name: String,
    /// This worker's rank.
    pub rank: usize,
    /// Number of workers.
    pub world_size: usize,
    /// Per-worker seed used after the shared loader shuffle.
    pub local_seed: u64,
    /// Number of update steps the run will take.
    pub num_total_batches: usize,
}

impl RunInfo {
    /// Offset between the seeds of consecutive ranks.
    pub const RANK_SEED_STRIDE: u64 = 100_003;

    /// Seed for `rank` derived from the shared seed.
    #[must_use]
    pub fn local_seed_for(seed: u64, rank: usize) -> u64 {
        seed.wrapping_add(rank as u64 * Self::RANK_SEED_STRIDE)
    }

    /// Default run name.
    #[must_use]
    pub fn default_run_name(exp_name: &str, seed: u64, unix_time: u64) -> String {
        format!("{exp_name}__{seed}__{unix_time}")
    }

    /// Whether this worker is rank 0.
    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_ordering() {
        let mut metrics = UpdateMetrics::new();
        metrics.insert("objective/kl", 0.5);
        metrics.insert("eps", 10.0);
        let names: Vec<_> = metrics.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["eps", "objective/kl"]);
        assert_eq!(metrics.get("eps"), Some(10.0));
        assert_eq!(metrics.get("missing"), None);
    }

    #[test]
    fn test_metrics_serialize_flat() {
        let mut metrics = UpdateMetrics::new();
        metrics.insert("lr", 1e-3);
        let json = serde_json::to_string(&metrics).unwrap();
        assert_eq!(json, r#"{"lr":0.001}"#);
    }

    #[test]
    fn test_table_head_and_render() {
        let mut table = InspectionTable::default();
        for i in 0..7 {
            table.push(InspectionRow {
                query: format!("q{i}"),
                model_response: format!("r{i}"),
                score: i as f32,
            });
        }
        assert_eq!(table.head(5).len(), 5);
        assert_eq!(table.head(50).len(), 7);
        let rendered = table.render(5);
        assert!(rendered.contains("q4"));
        assert!(!rendered.contains("q5"));
    }

    #[test]
    fn test_seeds_and_names() {
        assert_eq!(RunInfo::local_seed_for(1, 0), 1);
        assert_eq!(RunInfo::local_seed_for(1, 2), 200_007);
        assert_eq!(
            RunInfo::default_run_name("online_dpo", 1, 1700000000),
            "online_dpo__1__1700000000"
        );
    }
}
