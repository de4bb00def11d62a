//! Online DPO trainer.
//!
//! Every update step:
//! 1. Samples two completions per prompt from the current policy
//! 2. Scores them and keeps the higher-scoring one as chosen
//! 3. Runs `num_epochs` passes of minibatched DPO over the resulting pairs
//! 4. Reduces metrics across workers and hands them to the callbacks
//!
//! The reference model stays frozen for the whole run.

use std::time::Instant;

use mlx_rs::error::Exception;
use mlx_rs::module::{FlattenedModuleParam, ModuleParameters};
use mlx_rs::ops::concatenate_axis;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::transforms::eval_params;
use mlx_rs::{nn, stop_gradient, Array, Dtype};
use odpo_core::{
    BatchLayout, InspectionTable, LearningRateScheduler, LossType, RunConfig, RunInfo,
    TrainingCallback, UpdateMetrics,
};
use odpo_distributed::Collective;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::callbacks::{CompositeCallback, TABLE_PREVIEW_ROWS};
use crate::data::{PromptDataset, PromptLoader, PromptLoaderConfig};
use crate::error::{OnlineDpoError, OnlineDpoResult};
use crate::eval::sample_evaluation;
use crate::generation::SequenceGenerator;
use crate::gradients::{accumulate_gradients, all_reduce_gradients};
use crate::logprob_utils::{
    gather_logprobs, masked_fill, masked_sum, INVALID_LOGPROB, TEMPERATURE_EPS,
};
use crate::loss::{dpo_logits, implicit_rewards, preference_losses};
use crate::metrics::{reduce_metrics, UpdateSummary};
use crate::models::{forward, ForwardModel, ScoreModel};
use crate::objective::ObjectiveStats;
use crate::optimizer::ScheduledOptimizer;
use crate::pairing::PreferencePairs;
use crate::rollout::{collect_rollout, RolloutRecord};

/// Progress counters of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainerState {
    /// Completions sampled across all workers so far.
    pub episode: usize,
    /// One per minibatch, plus one per update at metric time.
    pub global_step: usize,
    /// Completed update steps.
    pub update: usize,
    /// `episode / dataset_len`.
    pub epoch: f64,
    /// Optimizer steps applied to the policy.
    pub optimizer_steps: usize,
}

/// Statistics of one accumulation chunk, each a mean over its pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChunkStats {
    /// Preference loss.
    pub loss: f32,
    /// `beta * (chosen_logps - ref_chosen_logps)`.
    pub chosen_reward: f32,
    /// `beta * (rejected_logps - ref_rejected_logps)`.
    pub rejected_reward: f32,
    /// Summed response logprob of the chosen completions.
    pub chosen_logps: f32,
    /// Summed response logprob of the rejected completions.
    pub rejected_logps: f32,
}

impl ChunkStats {
    /// Whether the chunk's mean chosen reward beats its mean rejected reward.
    pub fn prefers_chosen(&self) -> bool {
        self.chosen_reward > self.rejected_reward
    }
}

/// Chunk statistics of one update, threaded through the epoch and
/// minibatch loops and returned by each.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepStats {
    chunks: Vec<ChunkStats>,
}

impl StepStats {
    /// Append the statistics of one chunk.
    #[must_use]
    pub fn record(mut self, chunk: ChunkStats) -> Self {
        self.chunks.push(chunk);
        self
    }

    /// Recorded chunks, in training order.
    pub fn chunks(&self) -> &[ChunkStats] {
        &self.chunks
    }

    /// Number of recorded chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Project every chunk to one value.
    pub fn collect(&self, field: impl Fn(&ChunkStats) -> f32) -> Vec<f32> {
        self.chunks.iter().map(field).collect()
    }
}

/// Loss inputs shared by every chunk of an update.
#[derive(Debug, Clone, Copy)]
struct LossSettings {
    beta: f64,
    loss_type: LossType,
    temperature: f32,
    pad_token_id: i32,
    context_length: i32,
}

/// A rollout with its pairs and per-row reference sums.
struct PairedRollout<'a> {
    record: &'a RolloutRecord,
    pairs: &'a PreferencePairs,
    ref_sums: Array,
}

impl PairedRollout<'_> {
    /// Rows of `prompts`, chosen completions first.
    fn chunk(&self, prompts: &[usize]) -> Result<ChunkBatch, Exception> {
        let chosen = self.pairs.chosen_rows(prompts);
        let rejected = self.pairs.rejected_rows(prompts);
        let rows = concatenate_axis(&[&chosen, &rejected], 0)?;
        let num_pairs = prompts.len() as i32;
        let ref_sums = self.ref_sums.take_axis(&rows, 0)?;

        Ok(ChunkBatch {
            num_pairs,
            query_responses: self.record.query_responses.take_axis(&rows, 0)?,
            responses: self.record.responses.take_axis(&rows, 0)?,
            padding_mask: self.record.padding_mask.take_axis(&rows, 0)?,
            ref_chosen: ref_sums.index(..num_pairs),
            ref_rejected: ref_sums.index(num_pairs..),
        })
    }
}

/// Chosen rows `0..num_pairs`, rejected rows `num_pairs..`.
struct ChunkBatch {
    num_pairs: i32,
    query_responses: Array,
    responses: Array,
    padding_mask: Array,
    ref_chosen: Array,
    ref_rejected: Array,
}

/// Summed response logprobs of every row of `batch` under `model`.
fn response_logp_sums<M: ForwardModel + ?Sized>(
    model: &mut M,
    batch: &ChunkBatch,
    settings: &LossSettings,
) -> Result<Array, Exception> {
    let width = batch.query_responses.dim(1);
    let logits = forward(model, &batch.query_responses, settings.pad_token_id)?
        .index((.., settings.context_length - 1..width - 1, ..))
        .divide(&Array::from_f32(settings.temperature + TEMPERATURE_EPS))?;
    let logprobs = gather_logprobs(&logits, &batch.responses)?;
    let logprobs = masked_fill(&logprobs, &batch.padding_mask, INVALID_LOGPROB)?;
    masked_sum(&logprobs, &batch.padding_mask)
}

/// Loss, statistics and gradients of one chunk, from a single policy forward.
fn chunk_loss_and_grads<P>(
    policy: &mut P,
    batch: &ChunkBatch,
    settings: &LossSettings,
) -> OnlineDpoResult<(ChunkStats, FlattenedModuleParam)>
where
    P: ForwardModel + ModuleParameters,
{
    let n = batch.num_pairs;
    let mut sums: Option<Array> = None;

    let (loss, grads) = {
        let loss_fn = |model: &mut P, _: ()| -> Result<Array, Exception> {
            let logps = response_logp_sums(model, batch, settings)?;
            let logits = dpo_logits(
                &logps.index(..n),
                &logps.index(n..),
                &batch.ref_chosen,
                &batch.ref_rejected,
            )?;
            sums = Some(stop_gradient(&logps)?);
            preference_losses(settings.loss_type, settings.beta, &logits)?.mean(None)
        };
        let mut value_and_grad = nn::value_and_grad(loss_fn);
        value_and_grad(policy, ())?
    };

    let sums = sums.ok_or_else(|| OnlineDpoError::Shape("loss was never evaluated".into()))?;
    let chosen_logps = sums.index(..n);
    let rejected_logps = sums.index(n..);
    let chosen_rewards = implicit_rewards(settings.beta, &chosen_logps, &batch.ref_chosen)?;
    let rejected_rewards = implicit_rewards(settings.beta, &rejected_logps, &batch.ref_rejected)?;

    let stats = ChunkStats {
        loss: scalar_mean(&loss)?,
        chosen_reward: scalar_mean(&chosen_rewards)?,
        rejected_reward: scalar_mean(&rejected_rewards)?,
        chosen_logps: scalar_mean(&chosen_logps)?,
        rejected_logps: scalar_mean(&rejected_logps)?,
    };
    Ok((stats, grads))
}

fn scalar_mean(array: &Array) -> Result<f32, Exception> {
    let mean = array.mean(None)?;
    mean.eval()?;
    Ok(mean.item::<f32>())
}

/// Online DPO trainer over a collective of `C`.
///
/// Gradients of the chunks in a minibatch are accumulated, weighted by
/// chunk size, averaged over workers and applied in one optimizer step.
pub struct OnlineDpoTrainer<C: Collective> {
    config: RunConfig,
    layout: BatchLayout,
    run: RunInfo,
    scheduler: LearningRateScheduler,
    state: TrainerState,
    collective: C,
    callbacks: CompositeCallback,
    rng: StdRng,
    dataset_len: usize,
    start_time: Instant,
}

impl<C: Collective> OnlineDpoTrainer<C> {
    /// Validate `config` and derive the run layout for a dataset of
    /// `dataset_len` prompts.
    ///
    /// Every worker must call this; rank 0's clock names the run.
    pub fn new(config: RunConfig, collective: C, dataset_len: usize) -> OnlineDpoResult<Self> {
        config.validate()?;
        let layout = BatchLayout::new(&config, collective.world_size(), dataset_len)?;

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let start_unix_time = collective.broadcast_u64(now, 0)?;
        let training = &config.training;
        let run_name = training.run_name.clone().unwrap_or_else(|| {
            RunInfo::default_run_name(&training.exp_name, training.seed, start_unix_time)
        });
        let local_seed = RunInfo::local_seed_for(training.seed, collective.rank());
        let run = RunInfo {
            run_name,
            rank: collective.rank(),
            world_size: collective.world_size(),
            local_seed,
            num_total_batches: layout.num_total_batches,
        };
        let scheduler = LearningRateScheduler::from_config(training, layout.num_total_batches);

        info!(
            run_name = %run.run_name,
            rank = run.rank,
            world_size = run.world_size,
            batch_size = layout.batch_size,
            mini_batch_size = layout.mini_batch_size,
            num_total_batches = layout.num_total_batches,
            loss_type = %config.online_dpo.loss_type,
            "Online DPO trainer initialized"
        );

        Ok(Self {
            config,
            layout,
            run,
            scheduler,
            state: TrainerState::default(),
            collective,
            callbacks: CompositeCallback::new(),
            rng: StdRng::seed_from_u64(local_seed),
            dataset_len,
            start_time: Instant::now(),
        })
    }

    /// Register a telemetry sink. Sinks only fire on the main process.
    pub fn add_callback(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.add(callback);
    }

    /// Derived batch sizes.
    pub fn layout(&self) -> &BatchLayout {
        &self.layout
    }

    /// Run identity.
    pub fn run_info(&self) -> &RunInfo {
        &self.run
    }

    /// Progress counters.
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Train for `num_total_batches` updates.
    ///
    /// `eval_dataset`, when given, is sampled at the configured cadence and
    /// once in full after the last update.
    pub fn train<P, R, S, O>(
        &mut self,
        policy: &mut P,
        reference: &mut R,
        scorer: &mut S,
        optimizer: &mut O,
        train_dataset: &PromptDataset,
        eval_dataset: Option<&PromptDataset>,
    ) -> OnlineDpoResult<TrainerState>
    where
        P: SequenceGenerator + ModuleParameters,
        R: ForwardModel + ?Sized,
        S: ScoreModel + ?Sized,
        O: ScheduledOptimizer,
    {
        if train_dataset.len() != self.dataset_len {
            return Err(OnlineDpoError::Config(format!(
                "trainer was sized for {} prompts but the dataset has {}",
                self.dataset_len,
                train_dataset.len()
            )));
        }

        // Shared seed: every worker shuffles the prompts identically.
        let mut loader = PromptLoader::new(
            train_dataset,
            PromptLoaderConfig {
                batch_size: self.layout.local_dataloader_batch_size,
                shuffle: true,
                seed: self.config.training.seed,
                cycle: true,
                pad_token_id: self.config.rollout.pad_token_id,
                rank: self.run.rank,
                world_size: self.run.world_size,
            },
        )?;
        mlx_rs::random::seed(self.run.local_seed)?;
        self.rng = StdRng::seed_from_u64(self.run.local_seed);

        self.start_time = Instant::now();
        if self.collective.is_main_process() {
            self.callbacks.on_train_start(&self.run);
        }

        for update in 1..=self.layout.num_total_batches {
            let prompts = loader
                .next_batch()
                .ok_or_else(|| OnlineDpoError::Config("prompt loader ran dry".into()))?;
            let metrics = self.update_step(policy, reference, scorer, optimizer, &prompts)?;

            if self.collective.is_main_process() {
                self.callbacks.on_update_end(update, &metrics);
            }

            if let Some(eval_dataset) = eval_dataset {
                if self.layout.is_sample_generation_step(update) {
                    self.generate_completions(policy, scorer, eval_dataset, Some(1))?;
                }
            }
        }

        if let Some(eval_dataset) = eval_dataset {
            self.generate_completions(policy, scorer, eval_dataset, None)?;
        }

        if self.collective.is_main_process() {
            self.callbacks.on_train_end();
        }
        info!(
            episode = self.state.episode,
            optimizer_steps = self.state.optimizer_steps,
            "Online DPO training complete"
        );
        Ok(self.state.clone())
    }

    /// One rollout followed by `num_epochs` passes of preference training.
    pub fn update_step<P, R, S, O>(
        &mut self,
        policy: &mut P,
        reference: &mut R,
        scorer: &mut S,
        optimizer: &mut O,
        prompts: &Array,
    ) -> OnlineDpoResult<UpdateMetrics>
    where
        P: SequenceGenerator + ModuleParameters,
        R: ForwardModel + ?Sized,
        S: ScoreModel + ?Sized,
        O: ScheduledOptimizer,
    {
        self.state.update += 1;
        self.state.episode += self.layout.batch_size;
        self.scheduler.step();
        let learning_rate = self.scheduler.current_lr();
        optimizer.set_learning_rate(learning_rate as f32);

        let record = collect_rollout(policy, reference, scorer, prompts, &self.config.rollout)?;
        let scores = record.score_values()?;
        let pairs = PreferencePairs::from_scores(&scores)?;
        let objective = ObjectiveStats::from_rollout(&record, self.config.online_dpo.beta)?;
        debug!(
            update = self.state.update,
            pairs = pairs.len(),
            mean_margin = pairs.mean_margin(),
            mean_kl = objective.mean_kl(),
            mean_entropy = objective.mean_entropy(),
            "Rollout paired"
        );

        let stats = self.optimize(policy, optimizer, &record, &pairs)?;

        let num_eos_tokens = count_tokens(&record.responses, self.config.rollout.eos_token_id)?;
        let summary = UpdateSummary {
            objective: &objective,
            scores: &scores,
            pairs: &pairs,
            stats: &stats,
            num_eos_tokens,
            learning_rate,
            episode: self.state.episode,
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
        };
        let mut metrics = reduce_metrics(&self.collective, &summary)?;

        self.state.global_step += 1;
        self.state.epoch = self.state.episode as f64 / self.dataset_len as f64;
        metrics.insert("epoch", self.state.epoch);
        Ok(metrics)
    }

    /// Train on the pairs of `record` for `num_epochs` epochs.
    fn optimize<P, O>(
        &mut self,
        policy: &mut P,
        optimizer: &mut O,
        record: &RolloutRecord,
        pairs: &PreferencePairs,
    ) -> OnlineDpoResult<StepStats>
    where
        P: ForwardModel + ModuleParameters,
        O: ScheduledOptimizer,
    {
        let paired = PairedRollout {
            record,
            pairs,
            ref_sums: masked_sum(&record.ref_logprobs, &record.padding_mask)?,
        };
        let settings = LossSettings {
            beta: self.config.online_dpo.beta,
            loss_type: self.config.online_dpo.loss_type,
            temperature: self.config.rollout.temperature,
            pad_token_id: self.config.rollout.pad_token_id,
            context_length: record.context_length,
        };

        let mut stats = StepStats::default();
        for epoch in 0..self.config.online_dpo.num_epochs {
            let mut order: Vec<usize> = (0..pairs.len()).collect();
            order.shuffle(&mut self.rng);
            stats = self.train_epoch(policy, optimizer, &paired, &settings, &order, stats)?;
            debug!(update = self.state.update, epoch, chunks = stats.len(), "Epoch done");
        }
        Ok(stats)
    }

    fn train_epoch<P, O>(
        &mut self,
        policy: &mut P,
        optimizer: &mut O,
        paired: &PairedRollout<'_>,
        settings: &LossSettings,
        order: &[usize],
        mut stats: StepStats,
    ) -> OnlineDpoResult<StepStats>
    where
        P: ForwardModel + ModuleParameters,
        O: ScheduledOptimizer,
    {
        for minibatch in order.chunks(self.layout.prompts_per_mini_batch) {
            stats = self.train_minibatch(policy, optimizer, paired, settings, minibatch, stats)?;
        }
        Ok(stats)
    }

    /// Accumulate every chunk of `minibatch`, then take one optimizer step.
    fn train_minibatch<P, O>(
        &mut self,
        policy: &mut P,
        optimizer: &mut O,
        paired: &PairedRollout<'_>,
        settings: &LossSettings,
        minibatch: &[usize],
        mut stats: StepStats,
    ) -> OnlineDpoResult<StepStats>
    where
        P: ForwardModel + ModuleParameters,
        O: ScheduledOptimizer,
    {
        let mut accumulated: Option<FlattenedModuleParam> = None;
        for chunk in minibatch.chunks(self.layout.per_device_train_batch_size) {
            let batch = paired.chunk(chunk)?;
            let (chunk_stats, grads) = chunk_loss_and_grads(policy, &batch, settings)?;
            let weight = chunk.len() as f32 / minibatch.len() as f32;
            accumulated = Some(accumulate_gradients(accumulated, grads, weight)?);
            stats = stats.record(chunk_stats);
        }

        if let Some(grads) = accumulated {
            let grads = all_reduce_gradients(grads, &self.collective)?;
            optimizer.apply_gradients(policy, &grads)?;
            eval_params(policy.parameters())?;
            self.state.optimizer_steps += 1;
        }
        self.state.global_step += 1;
        Ok(stats)
    }

    /// Sample the eval set and publish the table from rank 0.
    ///
    /// Each worker samples its own shard. `max_batches = Some(1)` is the
    /// periodic preview; `None` runs the whole shard.
    pub fn generate_completions<P, S>(
        &mut self,
        policy: &mut P,
        scorer: &mut S,
        eval_dataset: &PromptDataset,
        max_batches: Option<usize>,
    ) -> OnlineDpoResult<InspectionTable>
    where
        P: SequenceGenerator + ?Sized,
        S: ScoreModel + ?Sized,
    {
        let mut loader = PromptLoader::new(
            eval_dataset,
            PromptLoaderConfig {
                batch_size: self.config.training.per_device_eval_batch_size,
                shuffle: false,
                seed: self.config.training.seed,
                cycle: false,
                pad_token_id: self.config.rollout.pad_token_id,
                rank: self.run.rank,
                world_size: self.run.world_size,
            },
        )?;
        let table = sample_evaluation(
            policy,
            scorer,
            &mut loader,
            &self.config.rollout,
            max_batches,
        )?;

        if self.collective.is_main_process() {
            info!(
                update = self.state.update,
                rows = table.len(),
                "Evaluation samples\n{}",
                table.render(TABLE_PREVIEW_ROWS)
            );
            self.callbacks.on_eval_table(self.state.update, &table);
        }
        Ok(table)
    }
}

fn count_tokens(tokens: &Array, token_id: i32) -> Result<usize, Exception> {
    let count = tokens
        .eq(&Array::from_int(token_id))?
        .as_dtype(Dtype::Int32)?
        .sum(None)?;
    count.eval()?;
    Ok(count.item::<i32>().max(0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logprob_utils::sequence_lengths;
    use crate::toy::TinyCausalLm;

    fn chunk_fixture() -> ChunkBatch {
        // One pair, context of 2, responses of 3. The rejected row ends early.
        let query_responses = Array::from_slice(&[4i32, 5, 6, 7, 2, 4, 5, 3, 2, 0], &[2, 5]);
        let responses = query_responses.index((.., 2..));
        let lens = sequence_lengths(&responses, 0).unwrap();
        let padding_mask = crate::logprob_utils::padding_mask(&lens, 3).unwrap();
        ChunkBatch {
            num_pairs: 1,
            query_responses,
            responses,
            padding_mask,
            ref_chosen: Array::from_slice(&[-6.0f32], &[1]),
            ref_rejected: Array::from_slice(&[-4.0f32], &[1]),
        }
    }

    fn settings(loss_type: LossType) -> LossSettings {
        LossSettings {
            beta: 0.1,
            loss_type,
            temperature: 0.7,
            pad_token_id: 0,
            context_length: 2,
        }
    }

    #[test]
    fn test_step_stats_accumulator() {
        let stats = StepStats::default()
            .record(ChunkStats {
                loss: 1.0,
                ..Default::default()
            })
            .record(ChunkStats {
                loss: 3.0,
                ..Default::default()
            });
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.collect(|s| s.loss), vec![1.0, 3.0]);
    }

    #[test]
    fn test_chunk_loss_matches_closed_form() {
        mlx_rs::random::seed(17).unwrap();
        let mut policy = TinyCausalLm::new(8, 8).unwrap();
        let batch = chunk_fixture();
        let settings = settings(LossType::Sigmoid);

        let sums = response_logp_sums(&mut policy, &batch, &settings).unwrap();
        sums.eval().unwrap();
        let sums: Vec<f32> = sums.as_slice::<f32>().to_vec();
        // rejected row keeps two valid tokens (3, 2); chosen keeps all three.
        assert!(sums.iter().all(|s| *s < 0.0));

        let (stats, grads) = chunk_loss_and_grads(&mut policy, &batch, &settings).unwrap();
        let logits = (sums[0] - sums[1]) - (-6.0 - -4.0);
        let expected = (1.0 + (-0.1 * logits).exp()).ln();
        assert!((stats.loss - expected).abs() < 1e-4, "{} vs {}", stats.loss, expected);
        assert!((stats.chosen_logps - sums[0]).abs() < 1e-4);
        assert!((stats.chosen_reward - 0.1 * (sums[0] + 6.0)).abs() < 1e-4);
        assert!((stats.rejected_reward - 0.1 * (sums[1] + 4.0)).abs() < 1e-4);
        assert!(!grads.is_empty());
    }

    #[test]
    fn test_ipo_chunk_loss() {
        mlx_rs::random::seed(17).unwrap();
        let mut policy = TinyCausalLm::new(8, 8).unwrap();
        let batch = chunk_fixture();
        let settings = settings(LossType::Ipo);
        let sums = response_logp_sums(&mut policy, &batch, &settings).unwrap();
        sums.eval().unwrap();
        let sums: Vec<f32> = sums.as_slice::<f32>().to_vec();

        let (stats, _) = chunk_loss_and_grads(&mut policy, &batch, &settings).unwrap();
        let logits = (sums[0] - sums[1]) + 2.0;
        let expected = (logits - 5.0).powi(2);
        assert!((stats.loss - expected).abs() < 1e-2, "{} vs {}", stats.loss, expected);
    }

    #[test]
    fn test_count_tokens() {
        let tokens = Array::from_slice(&[2i32, 4, 2, 0, 2, 1], &[2, 3]);
        assert_eq!(count_tokens(&tokens, 2).unwrap(), 3);
        assert_eq!(count_tokens(&tokens, 9).unwrap(), 0);
    }
}
