//! Per-update metric reduction.

use odpo_core::UpdateMetrics;
use odpo_distributed::Collective;

use crate::error::OnlineDpoResult;
use crate::objective::ObjectiveStats;
use crate::online_dpo::StepStats;
use crate::pairing::PreferencePairs;

/// Local inputs to one update's metrics.
#[derive(Debug)]
pub struct UpdateSummary<'a> {
    /// Objective terms of the rollout.
    pub objective: &'a ObjectiveStats,
    /// Post-penalty scores of every completion.
    pub scores: &'a [f32],
    /// Pairs formed from `scores`.
    pub pairs: &'a PreferencePairs,
    /// Per-chunk training statistics.
    pub stats: &'a StepStats,
    /// Eos tokens in the raw responses on this worker.
    pub num_eos_tokens: usize,
    /// Learning rate used for this update.
    pub learning_rate: f64,
    /// Cumulative episodes.
    pub episode: usize,
    /// Seconds since training started.
    pub elapsed_secs: f64,
}

/// Reduce `summary` into the update's metric map.
///
/// Every per-sample quantity is averaged over all samples on all workers.
/// `val/num_eos_tokens` stays local.
pub fn reduce_metrics<C: Collective + ?Sized>(
    collective: &C,
    summary: &UpdateSummary<'_>,
) -> OnlineDpoResult<UpdateMetrics> {
    let objective = summary.objective;
    let stats = summary.stats;
    let mut metrics = UpdateMetrics::new();

    let eps = if summary.elapsed_secs > 0.0 {
        (summary.episode as f64 / summary.elapsed_secs).floor()
    } else {
        0.0
    };
    metrics.insert("eps", eps);

    let reduced: [(&str, Vec<f32>); 13] = [
        ("objective/kl", objective.kl.clone()),
        ("objective/entropy", objective.entropy.clone()),
        ("objective/non_score_reward", objective.non_score_reward.clone()),
        ("objective/rlhf_reward", objective.rlhf_reward.clone()),
        ("objective/scores", summary.scores.to_vec()),
        ("objective/scores_margin", summary.pairs.margins.clone()),
        ("rewards/chosen", stats.collect(|s| s.chosen_reward)),
        ("rewards/rejected", stats.collect(|s| s.rejected_reward)),
        (
            "rewards/accuracies",
            stats.collect(|s| if s.prefers_chosen() { 1.0 } else { 0.0 }),
        ),
        (
            "rewards/margins",
            stats.collect(|s| s.chosen_reward - s.rejected_reward),
        ),
        ("loss/policy_avg", stats.collect(|s| s.loss)),
        ("logps/chosen", stats.collect(|s| s.chosen_logps)),
        ("logps/rejected", stats.collect(|s| s.rejected_logps)),
    ];
    for (name, values) in reduced {
        let value = collective.gather_mean(&values)?;
        metrics.insert(name, f64::from(value));
    }

    metrics.insert("val/num_eos_tokens", summary.num_eos_tokens as f64);
    metrics.insert("lr", summary.learning_rate);
    metrics.insert("episode", summary.episode as f64);
    Ok(metrics)
}
