//! Small built-in models for smoke runs and tests.
//!
//! [`TinyCausalLm`] is a causal bag-of-embeddings language model: position `t`
//! sees the mean embedding of all valid tokens up to `t`. [`TargetTokenScorer`]
//! rewards sequences for containing a chosen token.

use mlx_rs::{
    builder::Builder,
    error::Exception,
    macros::ModuleParameters,
    module::Module,
    nn, Array, Dtype,
};

use crate::generation::SequenceGenerator;
use crate::models::{ForwardModel, ScoreModel};

/// Tiny causal language model.
#[derive(Debug, ModuleParameters)]
pub struct TinyCausalLm {
    /// Token embeddings.
    #[param]
    pub embed_tokens: nn::Embedding,
    /// Output projection to the vocabulary.
    #[param]
    pub lm_head: nn::Linear,
    /// Vocabulary size.
    pub vocab_size: i32,
}

impl TinyCausalLm {
    /// Create a randomly initialized model.
    pub fn new(vocab_size: i32, hidden_size: i32) -> Result<Self, Exception> {
        let embed_tokens = nn::Embedding::new(vocab_size, hidden_size)?;
        let lm_head = nn::LinearBuilder::new(hidden_size, vocab_size).build()?;
        Ok(Self {
            embed_tokens,
            lm_head,
            vocab_size,
        })
    }
}

impl ForwardModel for TinyCausalLm {
    fn forward(&mut self, input_ids: &Array, attention_mask: &Array) -> Result<Array, Exception> {
        let mask = attention_mask.as_dtype(Dtype::Float32)?.expand_dims(-1i32)?;
        let embedded = Module::forward(&mut self.embed_tokens, input_ids)?.multiply(&mask)?;

        let summed = embedded.cumsum(1, None, None)?;
        let counts = mlx_rs::ops::maximum(&mask.cumsum(1, None, None)?, &Array::from_f32(1.0))?;
        let context = summed.divide(&counts)?;

        let hidden = mlx_rs::ops::tanh(&context.add(&embedded)?)?;
        Module::forward(&mut self.lm_head, &hidden)
    }
}

impl SequenceGenerator for TinyCausalLm {}

/// Scores position `t` with the number of `target_token` occurrences in `0..=t`.
#[derive(Debug, Clone)]
pub struct TargetTokenScorer {
    /// Token being rewarded.
    pub target_token: i32,
}

impl TargetTokenScorer {
    /// Create a scorer for `target_token`.
    pub fn new(target_token: i32) -> Self {
        Self { target_token }
    }
}

impl ScoreModel for TargetTokenScorer {
    fn score_positions(
        &mut self,
        input_ids: &Array,
        attention_mask: &Array,
    ) -> Result<Array, Exception> {
        let hits = input_ids
            .eq(&Array::from_int(self.target_token))?
            .as_dtype(Dtype::Float32)?
            .multiply(&attention_mask.as_dtype(Dtype::Float32)?)?;
        hits.cumsum(1, None, None)
    }
}
