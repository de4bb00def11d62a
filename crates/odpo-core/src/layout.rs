//! Batch size arithmetic.
//!
//! Every size the training loop uses is derived here once, at startup. All
//! relations that slice a batch must divide exactly; a remainder is a fatal
//! configuration error rather than a silently dropped tail.

use crate::{OdpoError, Result, RunConfig, GENERATIONS_PER_PROMPT};
use serde::Serialize;

/// Divide `numerator` by `denominator`, failing unless the division is exact.
pub fn exact_div(numerator: usize, denominator: usize, message: &str) -> Result<usize> {
    if denominator == 0 || numerator % denominator != 0 {
        return Err(OdpoError::NonDivisible {
            message: message.to_string(),
            numerator,
            denominator,
        });
    }
    Ok(numerator / denominator)
}

/// Derived batch sizes for one run.
///
/// "Local" sizes are per worker; the others span all workers. Completion
/// counts include the `G` replicas of each prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchLayout {
    /// Number of workers.
    pub world_size: usize,
    /// Completions per prompt (`G`).
    pub generations_per_prompt: usize,
    /// Prompts per accumulation chunk on one worker.
    pub per_device_train_batch_size: usize,
    /// Completions per worker per update.
    pub local_batch_size: usize,
    /// Chunk size across workers.
    pub micro_batch_size: usize,
    /// Completions per update across workers.
    pub batch_size: usize,
    /// Completions per minibatch across workers.
    pub mini_batch_size: usize,
    /// Completions per minibatch on one worker.
    pub local_mini_batch_size: usize,
    /// Prompts drawn from the loader per update on one worker.
    pub local_dataloader_batch_size: usize,
    /// Prompts per minibatch on one worker.
    pub prompts_per_mini_batch: usize,
    /// Accumulation chunks per minibatch.
    pub chunks_per_mini_batch: usize,
    /// Total episodes the run is budgeted for.
    pub total_episodes: usize,
    /// Number of update steps.
    pub num_total_batches: usize,
    /// Run the evaluation sampler every this many updates (`None` disables it).
    pub sample_generations_freq: Option<usize>,
}

impl BatchLayout {
    /// Derive the layout for `world_size` workers over a dataset of `dataset_len` prompts.
    pub fn new(config: &RunConfig, world_size: usize, dataset_len: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(OdpoError::Config("world_size must be positive".into()));
        }
        let training = &config.training;
        let dpo = &config.online_dpo;
        let g = dpo.num_generation_per_prompt;
        if g != GENERATIONS_PER_PROMPT {
            return Err(OdpoError::Config(format!(
                "num_generation_per_prompt must be {GENERATIONS_PER_PROMPT}, got {g}"
            )));
        }

        let per_device = training.per_device_train_batch_size;
        let local_batch_size =
            per_device * training.gradient_accumulation_steps * dpo.num_mini_batches;
        let micro_batch_size = per_device * world_size;
        let batch_size = local_batch_size * world_size;
        let mini_batch_size = exact_div(
            batch_size,
            dpo.num_mini_batches,
            "`batch_size` must be a multiple of `num_mini_batches`",
        )?;
        let local_mini_batch_size = exact_div(
            local_batch_size,
            dpo.num_mini_batches,
            "`local_batch_size` must be a multiple of `num_mini_batches`",
        )?;
        let local_dataloader_batch_size = exact_div(
            local_batch_size,
            g,
            "`local_batch_size` must be a multiple of `num_generation_per_prompt`",
        )?;
        let prompts_per_mini_batch = exact_div(
            local_mini_batch_size,
            g,
            "`local_mini_batch_size` must be a multiple of `num_generation_per_prompt`",
        )?;
        let chunks_per_mini_batch = exact_div(
            prompts_per_mini_batch,
            per_device,
            "prompts per minibatch must be a multiple of `per_device_train_batch_size`",
        )?;

        let total_episodes = match training.total_episodes {
            Some(episodes) => episodes,
            None => (training.num_train_epochs * dataset_len as f64) as usize,
        };
        if total_episodes == 0 {
            return Err(OdpoError::Config(
                "total_episodes resolved to zero; provide a non-empty dataset or set total_episodes"
                    .into(),
            ));
        }
        let num_total_batches = total_episodes.div_ceil(batch_size);
        let num_sample_generations = config.rollout.num_sample_generations;
        let sample_generations_freq = (num_sample_generations > 0)
            .then(|| (num_total_batches / num_sample_generations).max(1));

        Ok(Self {
            world_size,
            generations_per_prompt: g,
            per_device_train_batch_size: per_device,
            local_batch_size,
            micro_batch_size,
            batch_size,
            mini_batch_size,
            local_mini_batch_size,
            local_dataloader_batch_size,
            prompts_per_mini_batch,
            chunks_per_mini_batch,
            total_episodes,
            num_total_batches,
            sample_generations_freq,
        })
    }

    /// Whether the evaluation sampler runs after `update` (1-based).
    #[must_use]
    pub fn is_sample_generation_step(&self, update: usize) -> bool {
        matches!(self.sample_generations_freq, Some(freq) if update % freq == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OnlineDpoConfig, TrainingConfig};

    fn config(per_device: usize, accum: usize, mini_batches: usize) -> RunConfig {
        RunConfig {
            training: TrainingConfig {
                per_device_train_batch_size: per_device,
                gradient_accumulation_steps: accum,
                ..Default::default()
            },
            online_dpo: OnlineDpoConfig {
                num_mini_batches: mini_batches,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_div() {
        assert_eq!(exact_div(12, 4, "x").unwrap(), 3);
        let err = exact_div(10, 4, "ten by four").unwrap_err();
        assert!(err.to_string().contains("ten by four"));
        assert!(exact_div(1, 0, "zero").is_err());
    }

    #[test]
    fn test_layout_single_worker() {
        let layout = BatchLayout::new(&config(2, 4, 2), 1, 100).unwrap();
        assert_eq!(layout.local_batch_size, 16);
        assert_eq!(layout.batch_size, 16);
        assert_eq!(layout.micro_batch_size, 2);
        assert_eq!(layout.mini_batch_size, 8);
        assert_eq!(layout.local_mini_batch_size, 8);
        assert_eq!(layout.local_dataloader_batch_size, 8);
        assert_eq!(layout.prompts_per_mini_batch, 4);
        assert_eq!(layout.chunks_per_mini_batch, 2);
        assert_eq!(layout.total_episodes, 100);
        assert_eq!(layout.num_total_batches, 7);
        assert_eq!(layout.sample_generations_freq, Some(1));
    }

    #[test]
    fn test_layout_multi_worker() {
        let layout = BatchLayout::new(&config(4, 2, 1), 4, 1000).unwrap();
        assert_eq!(layout.local_batch_size, 8);
        assert_eq!(layout.micro_batch_size, 16);
        assert_eq!(layout.batch_size, 32);
        assert_eq!(layout.num_total_batches, 32);
        assert_eq!(layout.sample_generations_freq, Some(3));
        assert!(layout.is_sample_generation_step(3));
        assert!(!layout.is_sample_generation_step(4));
    }

    #[test]
    fn test_odd_local_batch_is_fatal() {
        // 1 * 1 * 1 = 1 completion cannot hold a pair.
        let err = BatchLayout::new(&config(1, 1, 1), 1, 10).unwrap_err();
        assert!(matches!(err, OdpoError::NonDivisible { .. }));
    }

    #[test]
    fn test_minibatch_must_hold_whole_pairs() {
        assert!(BatchLayout::new(&config(1, 6, 3), 1, 10).is_ok());
        assert!(BatchLayout::new(&config(3, 2, 1), 1, 10).is_ok());
        // 6 completions into 2 minibatches of 3 splits a pair.
        assert!(BatchLayout::new(&config(3, 1, 2), 1, 10).is_err());
    }

    #[test]
    fn test_chunks_must_tile_the_minibatch() {
        // 2 * 3 completions per minibatch: 3 prompts in chunks of 2.
        let err = BatchLayout::new(&config(2, 3, 1), 1, 10).unwrap_err();
        assert!(matches!(
            err,
            OdpoError::NonDivisible {
                numerator: 3,
                denominator: 2,
                ..
            }
        ));
        assert!(BatchLayout::new(&config(2, 1, 1), 1, 10).is_err());
        assert_eq!(
            BatchLayout::new(&config(2, 6, 1), 1, 10)
                .unwrap()
                .chunks_per_mini_batch,
            3
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        let layout = BatchLayout::new(&RunConfig::default(), 1, 64).unwrap();
        assert_eq!(layout.prompts_per_mini_batch, 8);
        assert_eq!(layout.chunks_per_mini_batch, 1);
    }

    #[test]
    fn test_explicit_total_episodes_and_no_sampling() {
        let mut run = config(1, 2, 1);
        run.training.total_episodes = Some(10);
        run.rollout.num_sample_generations = 0;
        let layout = BatchLayout::new(&run, 1, 0).unwrap();
        assert_eq!(layout.num_total_batches, 5);
        assert_eq!(layout.sample_generations_freq, None);
        assert!(!layout.is_sample_generation_step(5));
    }
}
