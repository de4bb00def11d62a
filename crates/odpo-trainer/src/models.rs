//! Model interfaces used by the trainer.
//!
//! The trainer never looks inside a model. The policy and the reference are
//! [`ForwardModel`]s (token ids to per-position logits), the policy also acts
//! as a [`SequenceGenerator`](crate::generation::SequenceGenerator), and the
//! scorer is a [`ScoreModel`] (token ids to per-position scalar outputs).

use mlx_rs::error::Exception;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;

use crate::error::OnlineDpoResult;
use crate::logprob_utils::first_true_indices;

/// A model producing next-token logits for every position.
pub trait ForwardModel {
    /// Run the model.
    ///
    /// # Arguments
    /// * `input_ids` - `[B, T]` token ids, padding already replaced by 0
    /// * `attention_mask` - `[B, T]` boolean mask, true on real tokens
    ///
    /// # Returns
    /// Logits `[B, T, V]`.
    fn forward(&mut self, input_ids: &Array, attention_mask: &Array) -> Result<Array, Exception>;
}

/// A model producing one scalar per position, read at the last valid token.
pub trait ScoreModel {
    /// Per-position scores `[B, T]`.
    fn score_positions(
        &mut self,
        input_ids: &Array,
        attention_mask: &Array,
    ) -> Result<Array, Exception>;
}

/// Split padded ids into model inputs: `(ids with pad replaced by 0, ids != pad)`.
pub fn masked_inputs(query_responses: &Array, pad_token_id: i32) -> Result<(Array, Array), Exception> {
    let attention_mask = query_responses.ne(&Array::from_int(pad_token_id))?;
    let zero = Array::from_int(0).as_dtype(query_responses.dtype())?;
    let input_ids = mlx_rs::ops::r#where(&attention_mask, query_responses, &zero)?;
    Ok((input_ids, attention_mask))
}

/// Forward `query_responses` through `model` with padding masked out.
pub fn forward<M: ForwardModel + ?Sized>(
    model: &mut M,
    query_responses: &Array,
    pad_token_id: i32,
) -> Result<Array, Exception> {
    let (input_ids, attention_mask) = masked_inputs(query_responses, pad_token_id)?;
    model.forward(&input_ids, &attention_mask)
}

/// Score each row of `query_responses` at its last valid token.
///
/// The last valid token sits at `context_length + first_true_indices(response == pad) - 1`.
/// A response that starts with padding is therefore scored on the final query token.
///
/// # Returns
/// Scores `[B]`.
pub fn get_reward<S: ScoreModel + ?Sized>(
    scorer: &mut S,
    query_responses: &Array,
    pad_token_id: i32,
    context_length: i32,
) -> Result<Array, Exception> {
    let (input_ids, attention_mask) = masked_inputs(query_responses, pad_token_id)?;
    let reward_logits = scorer.score_positions(&input_ids, &attention_mask)?;

    let responses = query_responses.index((.., context_length..));
    let first_pad = first_true_indices(&responses.eq(&Array::from_int(pad_token_id))?)?;
    let last_index = first_pad.add(&Array::from_int(context_length - 1))?;

    reward_logits
        .take_along_axis(&last_index.expand_dims(-1i32)?, 1)?
        .squeeze_axes(&[-1i32])
}

/// Build the policy and the reference from the same MLX seed.
///
/// The generator is reseeded before each `build`, so both start from
/// identical weights.
pub fn seeded_pair<M>(
    seed: u64,
    mut build: impl FnMut() -> Result<M, Exception>,
) -> OnlineDpoResult<(M, M)> {
    mlx_rs::random::seed(seed)?;
    let policy = build()?;
    mlx_rs::random::seed(seed)?;
    let reference = build()?;
    Ok((policy, reference))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::Dtype;

    /// Scores position `t` of every row as `t`, and records the last mask it saw.
    struct PositionScorer {
        last_mask: Option<Array>,
    }

    impl ScoreModel for PositionScorer {
        fn score_positions(
            &mut self,
            input_ids: &Array,
            attention_mask: &Array,
        ) -> Result<Array, Exception> {
            self.last_mask = Some(attention_mask.clone());
            let (b, t) = (input_ids.dim(0), input_ids.dim(1));
            let row = mlx_rs::ops::arange::<_, f32>(0, t, None)?;
            mlx_rs::ops::broadcast_to(&row.expand_dims(0i32)?, &[b, t])
        }
    }

    #[test]
    fn test_masked_inputs_zero_padding() {
        let qr = Array::from_slice(&[9i32, 4, 5, 9], &[1, 4]);
        let (ids, mask) = masked_inputs(&qr, 9).unwrap();
        ids.eval().unwrap();
        mask.eval().unwrap();
        assert_eq!(ids.as_slice::<i32>(), &[0, 4, 5, 0]);
        assert_eq!(mask.as_slice::<bool>(), &[false, true, true, false]);
    }

    #[test]
    fn test_reward_read_at_last_valid_token() {
        // context_length = 2; responses: [7, 0, 0], [7, 8, 3], [0, 0, 0]
        let qr = Array::from_slice(
            &[1i32, 2, 7, 0, 0, 1, 2, 7, 8, 3, 1, 2, 0, 0, 0],
            &[3, 5],
        );
        let mut scorer = PositionScorer { last_mask: None };
        let scores = get_reward(&mut scorer, &qr, 0, 2).unwrap();
        let scores = scores.as_dtype(Dtype::Float32).unwrap();
        scores.eval().unwrap();
        assert_eq!(scores.as_slice::<f32>(), &[2.0, 4.0, 1.0]);

        let mask = scorer.last_mask.unwrap();
        mask.eval().unwrap();
        assert_eq!(&mask.as_slice::<bool>()[..5], &[true, true, true, false, false]);
    }

    #[test]
    fn test_seeded_pair_starts_identical() {
        use crate::toy::TinyCausalLm;
        use mlx_rs::module::ModuleParameters;

        let (policy, reference) = seeded_pair(21, || TinyCausalLm::new(8, 4)).unwrap();
        let policy = policy.parameters().flatten();
        let reference = reference.parameters().flatten();
        assert_eq!(policy.len(), reference.len());
        for (key, value) in &policy {
            let other = &reference[key];
            value.eval().unwrap();
            other.eval().unwrap();
            assert_eq!(value.as_slice::<f32>(), other.as_slice::<f32>(), "{key}");
        }

        let failed = seeded_pair(21, || -> Result<TinyCausalLm, Exception> {
            Err(Exception::custom("no weights"))
        });
        assert!(failed.is_err());
    }
}
