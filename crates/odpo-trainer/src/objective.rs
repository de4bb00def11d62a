//! KL-regularized objective, tracked for monitoring only.

use mlx_rs::error::Exception;
use mlx_rs::{Array, Dtype};

use crate::logprob_utils::masked_sum;
use crate::rollout::RolloutRecord;

/// Per-completion objective terms of one rollout.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveStats {
    /// `sum_t (logprob - ref_logprob)` per completion.
    pub kl: Vec<f32>,
    /// `sum_t -logprob` over valid positions, per completion.
    pub entropy: Vec<f32>,
    /// `-beta * kl` per completion.
    pub non_score_reward: Vec<f32>,
    /// `score + non_score_reward` per completion.
    pub rlhf_reward: Vec<f32>,
}

impl ObjectiveStats {
    /// Compute the objective terms for `record`.
    ///
    /// Masked positions hold the same sentinel on both sides and cancel in
    /// the KL. The entropy proxy skips them.
    pub fn from_rollout(record: &RolloutRecord, beta: f64) -> Result<Self, Exception> {
        Self::compute(
            &record.logprobs,
            &record.ref_logprobs,
            &record.padding_mask,
            &record.scores,
            beta,
        )
    }

    /// Compute the objective terms from sentinel-filled `[N, L]` logprobs,
    /// their `[N, L]` padding mask and `[N]` scores.
    pub fn compute(
        logprobs: &Array,
        ref_logprobs: &Array,
        padding_mask: &Array,
        scores: &Array,
        beta: f64,
    ) -> Result<Self, Exception> {
        let kl = logprobs.subtract(ref_logprobs)?.sum_axes(&[1i32], false)?;
        let non_score_reward = kl.multiply(&Array::from_f32(-(beta as f32)))?;
        let rlhf_reward = scores.as_dtype(Dtype::Float32)?.add(&non_score_reward)?;
        let entropy = masked_sum(&logprobs.negative()?, padding_mask)?;

        Ok(Self {
            kl: host(&kl)?,
            entropy: host(&entropy)?,
            non_score_reward: host(&non_score_reward)?,
            rlhf_reward: host(&rlhf_reward)?,
        })
    }

    /// Mean KL over completions.
    pub fn mean_kl(&self) -> f32 {
        mean(&self.kl)
    }

    /// Mean entropy proxy over completions.
    pub fn mean_entropy(&self) -> f32 {
        mean(&self.entropy)
    }
}

fn host(array: &Array) -> Result<Vec<f32>, Exception> {
    array.eval()?;
    Ok(array.as_slice::<f32>().to_vec())
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}
