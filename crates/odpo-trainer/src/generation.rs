//! Autoregressive sampling for rollouts and evaluation.
//!
//! Generation never stops early: every row receives exactly
//! `max_new_tokens` tokens so rollouts stay rectangular. Truncation at the
//! stop token happens afterwards, in
//! [`truncate_response`](crate::logprob_utils::truncate_response).

use mlx_rs::error::Exception;
use mlx_rs::ops::indexing::{put_along_axis, take_along_axis, IndexOp};
use mlx_rs::ops::{argpartition_axis, argsort_axis, concatenate_axis, zeros_like};
use mlx_rs::random::categorical;
use mlx_rs::Array;
use odpo_core::RolloutConfig;

use crate::logprob_utils::TEMPERATURE_EPS;
use crate::models::{masked_inputs, ForwardModel};

/// Temperature used by the evaluation sampler (before the epsilon offset).
pub const EVAL_TEMPERATURE: f32 = 0.01;

/// Sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Number of tokens appended to every query.
    pub max_new_tokens: usize,
    /// Logits are divided by this before sampling.
    pub temperature: f32,
    /// Top-k filtering (0 = disabled).
    pub top_k: usize,
    /// Nucleus filtering (1.0 = disabled).
    pub top_p: f32,
}

impl GenerationConfig {
    /// Sampling used for training rollouts.
    pub fn rollout(config: &RolloutConfig) -> Self {
        Self {
            max_new_tokens: config.response_length,
            temperature: config.temperature + TEMPERATURE_EPS,
            top_k: 0,
            top_p: 1.0,
        }
    }

    /// Near-greedy sampling used by the evaluation sampler.
    pub fn evaluation(config: &RolloutConfig) -> Self {
        Self {
            max_new_tokens: config.response_length,
            temperature: EVAL_TEMPERATURE + TEMPERATURE_EPS,
            top_k: 0,
            top_p: 1.0,
        }
    }
}

/// Output of one generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    /// `[B, context_length + max_new_tokens]` query followed by the sampled tokens.
    pub query_responses: Array,
    /// `[B, max_new_tokens, V]` temperature-scaled logits each token was sampled from.
    pub logits: Array,
}

/// A policy that can sample continuations.
///
/// The default implementation runs [`sample_sequences`] over the model's own
/// forward pass.
pub trait SequenceGenerator: ForwardModel {
    /// Sample `config.max_new_tokens` tokens after each left-padded query.
    fn generate(
        &mut self,
        queries: &Array,
        pad_token_id: i32,
        config: &GenerationConfig,
    ) -> Result<Generation, Exception> {
        sample_sequences(self, queries, pad_token_id, config)
    }
}

/// Categorical sampling loop over any [`ForwardModel`].
///
/// Padding in `queries` is masked out. Sampled tokens are always attended to,
/// even when they equal `pad_token_id`.
pub fn sample_sequences<M: ForwardModel + ?Sized>(
    model: &mut M,
    queries: &Array,
    pad_token_id: i32,
    config: &GenerationConfig,
) -> Result<Generation, Exception> {
    if config.max_new_tokens == 0 {
        return Err(Exception::custom("max_new_tokens must be positive"));
    }
    let batch = queries.dim(0);
    let (mut input_ids, mut attention_mask) = masked_inputs(queries, pad_token_id)?;
    let mut query_responses = queries.clone();
    let attend = Array::ones::<bool>(&[batch, 1])?;
    let temperature = Array::from_f32(config.temperature);

    let mut step_logits = Vec::with_capacity(config.max_new_tokens);
    for _ in 0..config.max_new_tokens {
        let logits = model.forward(&input_ids, &attention_mask)?;
        let last = logits.index((.., -1, ..));
        let scaled = filter_logits(&last.divide(&temperature)?, config)?;

        let next = categorical(&scaled, -1, None, None)?
            .as_dtype(queries.dtype())?
            .expand_dims(-1i32)?;

        query_responses = concatenate_axis(&[&query_responses, &next], 1)?;
        input_ids = concatenate_axis(&[&input_ids, &next], 1)?;
        attention_mask = concatenate_axis(&[&attention_mask, &attend], 1)?;
        step_logits.push(scaled.expand_dims(1i32)?);

        // Materialize each step so the graph does not grow with the sequence.
        input_ids.eval()?;
    }

    let parts: Vec<&Array> = step_logits.iter().collect();
    let logits = concatenate_axis(&parts, 1)?;

    Ok(Generation {
        query_responses,
        logits,
    })
}

/// Apply top-k then top-p filtering to `[B, V]` logits.
fn filter_logits(logits: &Array, config: &GenerationConfig) -> Result<Array, Exception> {
    let vocab = logits.dim(-1) as usize;
    let mut logits = logits.clone();
    if config.top_k > 0 && config.top_k < vocab {
        logits = top_k_filter(&logits, config.top_k)?;
    }
    if config.top_p < 1.0 {
        logits = top_p_filter(&logits, config.top_p, vocab)?;
    }
    Ok(logits)
}

fn top_k_filter(logits: &Array, k: usize) -> Result<Array, Exception> {
    let neg_inf = Array::from_f32(f32::NEG_INFINITY);
    let partitioned = argpartition_axis(&logits.negative()?, (k - 1) as i32, -1)?;
    let dropped = partitioned.index((.., k as i32..));
    put_along_axis(logits, &dropped, &neg_inf, -1)
}

fn top_p_filter(logits: &Array, top_p: f32, vocab: usize) -> Result<Array, Exception> {
    let neg_inf = Array::from_f32(f32::NEG_INFINITY);
    let log_probs = logits.subtract(&logits.logsumexp_axis(-1, true)?)?;
    let probs = log_probs.exp()?;

    let sorted_indices = argsort_axis(logits, -1)?;
    let sorted_probs = take_along_axis(&probs, &sorted_indices, -1)?;
    let cumulative = sorted_probs.cumsum(-1, None, None)?;

    let vocab_range = Array::from_iter(0..vocab as i32, &[1, vocab as i32]);
    let inverse = put_along_axis(&zeros_like(&sorted_indices)?, &sorted_indices, &vocab_range, -1)?;
    let cumulative = take_along_axis(&cumulative, &inverse, -1)?;

    let keep = cumulative.gt(&Array::from_f32(1.0 - top_p))?;
    mlx_rs::ops::r#where(&keep, logits, &neg_inf)
}
