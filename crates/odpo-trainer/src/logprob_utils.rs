//! Per-token log probabilities and response masking.
//!
//! Every response row in a rollout has the same padded length. A position `p`
//! is valid iff `p <= sequence_length`; invalid positions carry
//! [`INVALID_LOGPROB`] and never contribute to a sum.

use mlx_rs::error::Exception;
use mlx_rs::ops::indexing::argmax_axis;
use mlx_rs::ops::{arange, concatenate_axis};
use mlx_rs::{Array, Dtype};

/// Sentinel written into masked logprob positions.
///
/// Identical on the policy and the reference side, so masked positions cancel
/// in `logprobs - ref_logprobs`.
pub const INVALID_LOGPROB: f32 = 1.0;

/// Offset added to the sampling temperature before dividing logits.
pub const TEMPERATURE_EPS: f32 = 1e-7;

/// Log probability of `tokens` under `logits`.
///
/// Equivalent to `log_softmax(logits, -1).take_along_axis(tokens, -1)` but
/// gathers first and subtracts the logsumexp, so the full `[B, T, V]` log
/// softmax is never materialized.
///
/// # Arguments
/// * `logits` - `[B, T, V]`
/// * `tokens` - `[B, T]` token ids
///
/// # Returns
/// `[B, T]` log probabilities as `Float32`.
pub fn gather_logprobs(logits: &Array, tokens: &Array) -> Result<Array, Exception> {
    let indices = tokens.as_dtype(Dtype::Int32)?.expand_dims(-1i32)?;
    let selected = logits.take_along_axis(&indices, -1)?;
    let lse = logits.logsumexp_axis(-1, true)?;
    selected
        .subtract(&lse)?
        .squeeze_axes(&[-1i32])?
        .as_dtype(Dtype::Float32)
}

/// Per row, the index of the first `true` in `bools` (`[B, T]`), or `T` when
/// the row has none.
pub fn first_true_indices(bools: &Array) -> Result<Array, Exception> {
    let rows = bools.dim(0);
    let hits = bools.as_dtype(Dtype::Int32)?;
    // A trailing always-true column makes argmax land on T for empty rows.
    let sentinel = Array::ones::<i32>(&[rows, 1])?;
    let padded = concatenate_axis(&[&hits, &sentinel], 1)?;
    argmax_axis(&padded, 1, None)?.as_dtype(Dtype::Int32)
}

/// Replace every token after the first `stop_token_id` with `pad_token_id`.
///
/// The stop token itself is kept. Without a stop token the responses are
/// returned unchanged.
pub fn truncate_response(
    stop_token_id: Option<i32>,
    pad_token_id: i32,
    responses: &Array,
) -> Result<Array, Exception> {
    let Some(stop) = stop_token_id else {
        return Ok(responses.clone());
    };
    let trunc_idx = first_true_indices(&responses.eq(&Array::from_int(stop))?)?;
    let positions = arange::<_, i32>(0, responses.dim(1), None)?.expand_dims(0i32)?;
    let after_stop = positions.gt(&trunc_idx.expand_dims(-1i32)?)?;
    mlx_rs::ops::r#where(
        &after_stop,
        &Array::from_int(pad_token_id).as_dtype(responses.dtype())?,
        responses,
    )
}

/// Index of the last valid token of each post-truncation response.
///
/// `first_true_indices(responses == pad) - 1`, so a row without padding has
/// length `T - 1` and every position valid.
pub fn sequence_lengths(responses: &Array, pad_token_id: i32) -> Result<Array, Exception> {
    let first_pad = first_true_indices(&responses.eq(&Array::from_int(pad_token_id))?)?;
    first_pad.subtract(&Array::from_int(1))
}

/// `[B, T]` mask that is true at positions past each row's sequence length.
pub fn padding_mask(sequence_lengths: &Array, response_length: i32) -> Result<Array, Exception> {
    let positions = arange::<_, i32>(0, response_length, None)?.expand_dims(0i32)?;
    positions.gt(&sequence_lengths.expand_dims(-1i32)?)
}

/// Write `value` wherever `mask` is true.
pub fn masked_fill(values: &Array, mask: &Array, value: f32) -> Result<Array, Exception> {
    mlx_rs::ops::r#where(mask, &Array::from_f32(value), values)
}

/// Row sums of `values` over the positions where `mask` is false.
pub fn masked_sum(values: &Array, mask: &Array) -> Result<Array, Exception> {
    let keep = mlx_rs::ops::r#where(mask, &Array::from_f32(0.0), &Array::from_f32(1.0))?;
    values.multiply(&keep)?.sum_axes(&[1i32], false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(a: &Array) -> Vec<i32> {
        a.eval().unwrap();
        a.as_slice::<i32>().to_vec()
    }

    #[test]
    fn test_gather_matches_full_log_softmax() {
        let logits_data: Vec<f32> = vec![
            1.0, 2.0, 3.0, 4.0, 5.0, //
            5.0, 4.0, 3.0, 2.0, 1.0, //
            0.0, 0.0, 0.0, 0.0, 0.0, //
        ];
        let logits = Array::from_slice(&logits_data, &[1, 3, 5]);
        let tokens = Array::from_slice(&[2i32, 0, 4], &[1, 3]);

        let lp = gather_logprobs(&logits, &tokens).unwrap();
        lp.eval().unwrap();
        assert_eq!(lp.shape(), &[1, 3]);

        let full = mlx_rs::nn::log_softmax(&logits, -1).unwrap();
        full.eval().unwrap();
        let full: &[f32] = full.as_slice();
        let lp: &[f32] = lp.as_slice();

        assert!((lp[0] - full[2]).abs() < 1e-5);
        assert!((lp[1] - full[5]).abs() < 1e-5);
        assert!((lp[2] - (1.0f32 / 5.0).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_gather_large_logits_finite() {
        let logits = Array::from_slice(&[1e7_f32, 1e7 + 1.0, 1e7 - 1.0], &[1, 1, 3]);
        let tokens = Array::from_slice(&[0i32], &[1, 1]);
        let lp = gather_logprobs(&logits, &tokens).unwrap();
        lp.eval().unwrap();
        let v: &[f32] = lp.as_slice();
        assert!(v[0].is_finite());
        assert!(v[0] <= 0.0);
    }

    #[test]
    fn test_first_true_indices() {
        let bools = Array::from_slice(
            &[false, true, true, false, false, false, true, false, false, false, false, true],
            &[3, 4],
        );
        assert_eq!(ints(&first_true_indices(&bools).unwrap()), vec![1, 4, 3]);
    }

    #[test]
    fn test_truncate_keeps_stop_token() {
        let responses = Array::from_slice(&[5i32, 2, 7, 8, 2, 9, 9, 9, 4, 4, 4, 4], &[3, 4]);
        let out = truncate_response(Some(2), 0, &responses).unwrap();
        assert_eq!(ints(&out), vec![5, 2, 0, 0, 2, 0, 0, 0, 4, 4, 4, 4]);
    }

    #[test]
    fn test_truncate_without_stop_token_is_identity() {
        let responses = Array::from_slice(&[5i32, 2, 7, 8], &[1, 4]);
        let out = truncate_response(None, 0, &responses).unwrap();
        assert_eq!(ints(&out), vec![5, 2, 7, 8]);
    }

    #[test]
    fn test_sequence_lengths_and_padding_mask() {
        let post = Array::from_slice(&[5i32, 2, 0, 0, 3, 3, 3, 3], &[2, 4]);
        let lens = sequence_lengths(&post, 0).unwrap();
        assert_eq!(ints(&lens), vec![1, 3]);

        let mask = padding_mask(&lens, 4).unwrap();
        mask.eval().unwrap();
        let m: &[bool] = mask.as_slice();
        assert_eq!(m, &[false, false, true, true, false, false, false, false]);
    }

    #[test]
    fn test_masked_positions_hold_sentinel_and_are_excluded() {
        let values = Array::from_slice(&[-1.0f32, -2.0, -3.0, -4.0], &[1, 4]);
        let mask = Array::from_slice(&[false, false, true, true], &[1, 4]);

        let filled = masked_fill(&values, &mask, INVALID_LOGPROB).unwrap();
        filled.eval().unwrap();
        assert_eq!(filled.as_slice::<f32>(), &[-1.0, -2.0, 1.0, 1.0]);

        let total = masked_sum(&filled, &mask).unwrap();
        total.eval().unwrap();
        assert_eq!(total.as_slice::<f32>(), &[-3.0]);
    }
}
