//! Closed-form preference losses.
//!
//! Both losses take the DPO logits
//! `(chosen - rejected) - (ref_chosen - ref_rejected)` of summed logprobs.

use mlx_rs::error::Exception;
use mlx_rs::{nn, Array};
use odpo_core::LossType;

/// DPO logits from summed response logprobs.
pub fn dpo_logits(
    chosen_logps: &Array,
    rejected_logps: &Array,
    ref_chosen_logps: &Array,
    ref_rejected_logps: &Array,
) -> Result<Array, Exception> {
    let pi_logratios = chosen_logps.subtract(rejected_logps)?;
    let ref_logratios = ref_chosen_logps.subtract(ref_rejected_logps)?;
    pi_logratios.subtract(&ref_logratios)
}

/// Per-pair loss.
///
/// - `Sigmoid`: `-log(sigmoid(beta * logits))`, computed as `softplus(-beta * logits)`
/// - `Ipo`: `(logits - 1 / (2 * beta))^2`
pub fn preference_losses(loss_type: LossType, beta: f64, logits: &Array) -> Result<Array, Exception> {
    match loss_type {
        LossType::Sigmoid => {
            let scaled = logits.multiply(&Array::from_f32(beta as f32))?;
            nn::softplus(&scaled.negative()?)
        }
        LossType::Ipo => {
            let target = Array::from_f32((1.0 / (2.0 * beta)) as f32);
            let diff = logits.subtract(&target)?;
            diff.multiply(&diff)
        }
    }
}

/// Implicit rewards `beta * (logps - ref_logps)`.
pub fn implicit_rewards(beta: f64, logps: &Array, ref_logps: &Array) -> Result<Array, Exception> {
    logps
        .subtract(ref_logps)?
        .multiply(&Array::from_f32(beta as f32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(loss_type: LossType, beta: f64, logits: &[f32]) -> Vec<f32> {
        let logits = Array::from_slice(logits, &[logits.len() as i32]);
        let out = preference_losses(loss_type, beta, &logits).unwrap();
        out.eval().unwrap();
        out.as_slice::<f32>().to_vec()
    }

    #[test]
    fn test_zero_logits_scenario() {
        // sums (-10, -12, -9, -11) give pi_logratio 2 and ref_logratio 2
        let logits = dpo_logits(
            &Array::from_slice(&[-10.0f32], &[1]),
            &Array::from_slice(&[-12.0f32], &[1]),
            &Array::from_slice(&[-9.0f32], &[1]),
            &Array::from_slice(&[-11.0f32], &[1]),
        )
        .unwrap();
        logits.eval().unwrap();
        assert_eq!(logits.as_slice::<f32>(), &[0.0]);

        let sigmoid = values(LossType::Sigmoid, 0.05, &[0.0]);
        assert!((sigmoid[0] - std::f32::consts::LN_2).abs() < 1e-4);

        let ipo = values(LossType::Ipo, 0.05, &[0.0]);
        assert!((ipo[0] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_sigmoid_strictly_decreasing() {
        let grid: Vec<f32> = (-20..=20).map(|i| i as f32 * 2.5).collect();
        let losses = values(LossType::Sigmoid, 0.1, &grid);
        for pair in losses.windows(2) {
            assert!(pair[1] < pair[0], "{} !< {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn test_ipo_minimum_and_symmetry() {
        let beta = 0.25;
        let center = (1.0 / (2.0 * beta)) as f32;
        let losses = values(LossType::Ipo, beta, &[center, center - 1.5, center + 1.5]);
        assert!(losses[0].abs() < 1e-6);
        assert!((losses[1] - losses[2]).abs() < 1e-5);
        assert!(losses[1] > 0.0);
    }

    #[test]
    fn test_implicit_rewards() {
        let r = implicit_rewards(
            0.5,
            &Array::from_slice(&[-2.0f32, -1.0], &[2]),
            &Array::from_slice(&[-3.0f32, -1.0], &[2]),
        )
        .unwrap();
        r.eval().unwrap();
        assert_eq!(r.as_slice::<f32>(), &[0.5, 0.0]);
    }
}
