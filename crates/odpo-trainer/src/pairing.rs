//! Preference pairing within prompt groups.

use mlx_rs::Array;
use odpo_core::GENERATIONS_PER_PROMPT;

use crate::error::{OnlineDpoError, OnlineDpoResult};

/// Mapping from prompt index to the rollout rows holding its completions.
///
/// With `n` prompts, prompt `i` owns rows `i` and `i + n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptGroups {
    num_prompts: usize,
}

impl PromptGroups {
    /// Groups for a rollout of `num_completions` rows.
    pub fn new(num_completions: usize) -> OnlineDpoResult<Self> {
        if num_completions == 0 || num_completions % GENERATIONS_PER_PROMPT != 0 {
            return Err(OnlineDpoError::Shape(format!(
                "rollout of {num_completions} completions cannot be split into groups of {GENERATIONS_PER_PROMPT}"
            )));
        }
        Ok(Self {
            num_prompts: num_completions / GENERATIONS_PER_PROMPT,
        })
    }

    /// Number of prompts.
    pub fn num_prompts(&self) -> usize {
        self.num_prompts
    }

    /// Rows of prompt `prompt`, first-half replica first.
    pub fn members(&self, prompt: usize) -> [usize; GENERATIONS_PER_PROMPT] {
        [prompt, prompt + self.num_prompts]
    }
}

/// One (chosen, rejected) pair per prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferencePairs {
    /// Row of the preferred completion for each prompt.
    pub chosen: Vec<usize>,
    /// Row of the other completion for each prompt.
    pub rejected: Vec<usize>,
    /// `score[chosen] - score[rejected]`, never negative.
    pub margins: Vec<f32>,
}

impl PreferencePairs {
    /// Pair the two completions of every prompt by score.
    ///
    /// Ties go to the first-half replica.
    pub fn from_scores(scores: &[f32]) -> OnlineDpoResult<Self> {
        let groups = PromptGroups::new(scores.len())?;
        let n = groups.num_prompts();
        let mut chosen = Vec::with_capacity(n);
        let mut rejected = Vec::with_capacity(n);
        let mut margins = Vec::with_capacity(n);

        for prompt in 0..n {
            let [first, second] = groups.members(prompt);
            let (c, r) = if scores[first] >= scores[second] {
                (first, second)
            } else {
                (second, first)
            };
            chosen.push(c);
            rejected.push(r);
            margins.push(scores[c] - scores[r]);
        }

        Ok(Self {
            chosen,
            rejected,
            margins,
        })
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.chosen.len()
    }

    /// Whether there are no pairs.
    pub fn is_empty(&self) -> bool {
        self.chosen.is_empty()
    }

    /// Chosen rows for the given prompts, as an index array.
    pub fn chosen_rows(&self, prompts: &[usize]) -> Array {
        rows(&self.chosen, prompts)
    }

    /// Rejected rows for the given prompts, as an index array.
    pub fn rejected_rows(&self, prompts: &[usize]) -> Array {
        rows(&self.rejected, prompts)
    }

    /// Mean pairing margin.
    pub fn mean_margin(&self) -> f32 {
        if self.margins.is_empty() {
            return 0.0;
        }
        self.margins.iter().sum::<f32>() / self.margins.len() as f32
    }
}

fn rows(table: &[usize], prompts: &[usize]) -> Array {
    let idx: Vec<i32> = prompts.iter().map(|&p| table[p] as i32).collect();
    Array::from_slice(&idx, &[idx.len() as i32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_completion_pairing() {
        let pairs = PreferencePairs::from_scores(&[1.0, 0.0]).unwrap();
        assert_eq!((pairs.chosen[0], pairs.rejected[0]), (0, 1));
        let pairs = PreferencePairs::from_scores(&[0.0, 1.0]).unwrap();
        assert_eq!((pairs.chosen[0], pairs.rejected[0]), (1, 0));
        let pairs = PreferencePairs::from_scores(&[0.3, 0.3]).unwrap();
        assert_eq!((pairs.chosen[0], pairs.rejected[0]), (0, 1));
        assert_eq!(pairs.margins[0], 0.0);
    }

    #[test]
    fn test_eight_completion_scenario() {
        let scores = [0.5, 0.2, 0.9, 0.1, 0.3, 0.4, 0.2, 0.8];
        let pairs = PreferencePairs::from_scores(&scores).unwrap();
        assert_eq!(pairs.chosen, vec![0, 5, 2, 7]);
        assert_eq!(pairs.rejected, vec![4, 1, 6, 3]);
        let expected = [0.2, 0.2, 0.7, 0.7];
        for (m, e) in pairs.margins.iter().zip(expected) {
            assert!((m - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_pairs_are_disjoint_within_group_and_nonnegative() {
        let scores = [3.0, -1.0, 2.0, 2.0, 0.0, 4.0];
        let pairs = PreferencePairs::from_scores(&scores).unwrap();
        let groups = PromptGroups::new(scores.len()).unwrap();
        for p in 0..pairs.len() {
            let members = groups.members(p);
            assert!(members.contains(&pairs.chosen[p]));
            assert!(members.contains(&pairs.rejected[p]));
            assert_ne!(pairs.chosen[p], pairs.rejected[p]);
            assert!(pairs.margins[p] >= 0.0);
        }
    }

    #[test]
    fn test_pairing_is_idempotent() {
        let scores = [0.1, 0.9, 0.4, 0.4];
        let a = PreferencePairs::from_scores(&scores).unwrap();
        let b = PreferencePairs::from_scores(&scores).unwrap();
        assert_eq!(a, b);

        // Re-pairing an already ordered rollout keeps every first-half row chosen.
        let reordered: Vec<f32> = a
            .chosen
            .iter()
            .chain(a.rejected.iter())
            .map(|&i| scores[i])
            .collect();
        let c = PreferencePairs::from_scores(&reordered).unwrap();
        assert_eq!(c.chosen, vec![0, 1]);
        assert_eq!(c.margins, a.margins);
    }

    #[test]
    fn test_odd_rollout_rejected() {
        assert!(PreferencePairs::from_scores(&[1.0, 2.0, 3.0]).is_err());
        assert!(PreferencePairs::from_scores(&[]).is_err());
    }

    #[test]
    fn test_row_arrays() {
        let pairs = PreferencePairs::from_scores(&[0.5, 0.2, 0.9, 0.1, 0.3, 0.4, 0.2, 0.8]).unwrap();
        let chosen = pairs.chosen_rows(&[3, 1]);
        chosen.eval().unwrap();
        assert_eq!(chosen.as_slice::<i32>(), &[7, 5]);
        let rejected = pairs.rejected_rows(&[3, 1]);
        rejected.eval().unwrap();
        assert_eq!(rejected.as_slice::<i32>(), &[3, 1]);
    }
}
