//! Rollout: sample two completions per prompt, score them, mask them.

use mlx_rs::error::Exception;
use mlx_rs::ops::concatenate_axis;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::{Array, Dtype};
use odpo_core::{RolloutConfig, GENERATIONS_PER_PROMPT};
use tracing::debug;

use crate::error::OnlineDpoResult;
use crate::generation::{GenerationConfig, SequenceGenerator};
use crate::logprob_utils::{
    gather_logprobs, masked_fill, padding_mask, sequence_lengths, truncate_response,
    INVALID_LOGPROB, TEMPERATURE_EPS,
};
use crate::models::{forward, get_reward, ForwardModel, ScoreModel};

/// Everything one update step learns from its rollout.
///
/// Rows `i` and `i + num_prompts()` are the two completions of prompt `i`.
/// Dropped at the end of the step.
#[derive(Debug)]
pub struct RolloutRecord {
    /// Number of query columns.
    pub context_length: i32,
    /// `[N, ctx + L]` query followed by the raw sampled response.
    pub query_responses: Array,
    /// `[N, L]` raw sampled responses.
    pub responses: Array,
    /// `[N, L]` responses after stop-token truncation.
    pub postprocessed_responses: Array,
    /// `[N, L]` policy logprobs at sampling time, sentinel on padding.
    pub logprobs: Array,
    /// `[N, L]` reference logprobs, sentinel on padding.
    pub ref_logprobs: Array,
    /// `[N]` index of the last valid response token.
    pub sequence_lengths: Array,
    /// `[N, L]` true past each row's sequence length.
    pub padding_mask: Array,
    /// `[N]` scores after the missing-terminator penalty.
    pub scores: Array,
}

impl RolloutRecord {
    /// Number of completions.
    pub fn num_completions(&self) -> usize {
        self.scores.dim(0) as usize
    }

    /// Number of prompts (completions / 2).
    pub fn num_prompts(&self) -> usize {
        self.num_completions() / GENERATIONS_PER_PROMPT
    }

    /// Host copy of the scores.
    pub fn score_values(&self) -> Result<Vec<f32>, Exception> {
        let scores = self.scores.as_dtype(Dtype::Float32)?;
        scores.eval()?;
        Ok(scores.as_slice::<f32>().to_vec())
    }
}

/// Replace scores of completions that never emit `eos_token_id`.
///
/// `responses` are the raw samples: truncation at a distinct stop token may
/// cut an eos that the completion did produce.
pub fn apply_non_eos_penalty(
    scores: &Array,
    responses: &Array,
    eos_token_id: i32,
    penalty_reward_value: f32,
) -> Result<Array, Exception> {
    let contains_eos = responses
        .eq(&Array::from_int(eos_token_id))?
        .as_dtype(Dtype::Int32)?
        .sum_axes(&[-1i32], false)?
        .gt(&Array::from_int(0))?;
    mlx_rs::ops::r#where(&contains_eos, scores, &Array::from_f32(penalty_reward_value))
}

/// Generate, score and mask two completions for every prompt in `prompts`.
///
/// `prompts` is `[P, ctx]`, left padded. Work is done in forward sub-batches of
/// `config.local_rollout_forward_batch_size` completions.
pub fn collect_rollout<P, R, S>(
    policy: &mut P,
    reference: &mut R,
    scorer: &mut S,
    prompts: &Array,
    config: &RolloutConfig,
) -> OnlineDpoResult<RolloutRecord>
where
    P: SequenceGenerator + ?Sized,
    R: ForwardModel + ?Sized,
    S: ScoreModel + ?Sized,
{
    let pad = config.pad_token_id;
    let stop_token_id = config.resolved_stop_token_id();
    let generation_config = GenerationConfig::rollout(config);
    let ref_temperature = Array::from_f32(config.temperature + TEMPERATURE_EPS);

    let queries = concatenate_axis(&[prompts, prompts], 0)?;
    let total = queries.dim(0);
    let context_length = queries.dim(1);
    let chunk = config.local_rollout_forward_batch_size as i32;

    let mut query_responses = Vec::new();
    let mut responses = Vec::new();
    let mut postprocessed = Vec::new();
    let mut logprobs = Vec::new();
    let mut ref_logprobs = Vec::new();
    let mut lengths = Vec::new();
    let mut scores = Vec::new();

    let mut start = 0;
    while start < total {
        let end = (start + chunk).min(total);
        let query = queries.index((start..end, ..));

        let generation = policy.generate(&query, pad, &generation_config)?;
        let query_response = generation.query_responses;
        let response = query_response.index((.., context_length..));
        let logprob = gather_logprobs(&generation.logits, &response)?;

        let width = query_response.dim(1);
        let ref_logits = forward(reference, &query_response, pad)?
            .index((.., context_length - 1..width - 1, ..))
            .divide(&ref_temperature)?;
        let ref_logprob = gather_logprobs(&ref_logits, &response)?;

        let post = truncate_response(stop_token_id, pad, &response)?;
        let post_query_response = concatenate_axis(&[&query, &post], 1)?;
        let sequence_length = sequence_lengths(&post, pad)?;
        let score = get_reward(scorer, &post_query_response, pad, context_length)?
            .as_dtype(Dtype::Float32)?;

        for array in [&logprob, &ref_logprob, &score] {
            array.eval()?;
        }

        query_responses.push(query_response);
        responses.push(response);
        postprocessed.push(post);
        logprobs.push(logprob);
        ref_logprobs.push(ref_logprob);
        lengths.push(sequence_length);
        scores.push(score);
        start = end;
    }

    let query_responses = concat_rows(&query_responses)?;
    let responses = concat_rows(&responses)?;
    let postprocessed_responses = concat_rows(&postprocessed)?;
    let sequence_lengths = concat_rows(&lengths)?;
    let mut scores = concat_rows(&scores)?;

    if config.non_eos_penalty {
        scores = apply_non_eos_penalty(
            &scores,
            &responses,
            config.eos_token_id,
            config.penalty_reward_value,
        )?;
    }

    let padding_mask = padding_mask(&sequence_lengths, responses.dim(1))?;
    let logprobs = masked_fill(&concat_rows(&logprobs)?, &padding_mask, INVALID_LOGPROB)?;
    let ref_logprobs = masked_fill(&concat_rows(&ref_logprobs)?, &padding_mask, INVALID_LOGPROB)?;

    for array in [
        &query_responses,
        &logprobs,
        &ref_logprobs,
        &padding_mask,
        &scores,
    ] {
        array.eval()?;
    }
    debug!(completions = total, context_length, "Rollout collected");

    Ok(RolloutRecord {
        context_length,
        query_responses,
        responses,
        postprocessed_responses,
        logprobs,
        ref_logprobs,
        sequence_lengths,
        padding_mask,
        scores,
    })
}

fn concat_rows(parts: &[Array]) -> Result<Array, Exception> {
    let refs: Vec<&Array> = parts.iter().collect();
    concatenate_axis(&refs, 0)
}
