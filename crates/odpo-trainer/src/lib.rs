//! Online DPO training on MLX.
//!
//! This crate provides:
//! - Rollout generation with two sampled completions per prompt
//! - Masked sequence accounting (truncation, sequence lengths, sentinels)
//! - Score-based preference pairing
//! - Sigmoid and IPO preference losses
//! - The minibatch training loop with gradient accumulation across workers
//! - Evaluation sampling and telemetry callbacks
//!
//! # Example
//!
//! ```ignore
//! use odpo_core::RunConfig;
//! use odpo_distributed::LocalCollective;
//! use odpo_trainer::{
//!     seeded_pair, OnlineDpoTrainer, PolicyOptimizer, PromptDataset, TargetTokenScorer, TinyCausalLm,
//! };
//!
//! let config = RunConfig::from_yaml_file("run.yaml")?;
//! let dataset = PromptDataset::from_jsonl("prompts.jsonl")?;
//! let (mut policy, mut reference) = seeded_pair(config.training.seed, || TinyCausalLm::new(32, 16))?;
//! let mut scorer = TargetTokenScorer::new(5);
//! let mut optimizer = PolicyOptimizer::from_config(&config.training)?;
//!
//! let mut trainer = OnlineDpoTrainer::new(config, LocalCollective, dataset.len())?;
//! trainer.train(&mut policy, &mut reference, &mut scorer, &mut optimizer, &dataset, None)?;
//! ```

#![warn(missing_docs)]

pub mod callbacks;
pub mod data;
pub mod error;
pub mod eval;
pub mod generation;
pub mod gradients;
pub mod logprob_utils;
pub mod loss;
pub mod metrics;
pub mod models;
pub mod objective;
pub mod online_dpo;
pub mod optimizer;
pub mod pairing;
pub mod rollout;
pub mod toy;

pub use callbacks::*;
pub use data::{left_pad, PromptDataset, PromptLoader, PromptLoaderConfig, PromptRecord};
pub use error::{OnlineDpoError, OnlineDpoResult};
pub use eval::{render_tokens, sample_evaluation};
pub use generation::{sample_sequences, Generation, GenerationConfig, SequenceGenerator};
pub use gradients::{accumulate_gradients, all_reduce_gradients};
pub use loss::{dpo_logits, implicit_rewards, preference_losses};
pub use metrics::{reduce_metrics, UpdateSummary};
pub use models::{forward, get_reward, seeded_pair, ForwardModel, ScoreModel};
pub use objective::ObjectiveStats;
pub use online_dpo::{ChunkStats, OnlineDpoTrainer, StepStats, TrainerState};
pub use optimizer::{PolicyOptimizer, ScheduledOptimizer};
pub use pairing::{PreferencePairs, PromptGroups};
pub use rollout::{apply_non_eos_penalty, collect_rollout, RolloutRecord};
pub use toy::{TargetTokenScorer, TinyCausalLm};
