//! Configuration types for odpo.
//!
//! A run is described by a single [`RunConfig`], usually loaded from YAML.
//! Every field has a serde default so partial files are accepted.

use crate::{OdpoError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Number of completions sampled per prompt. Pairing is only defined for two.
pub const GENERATIONS_PER_PROMPT: usize = 2;

/// Top-level run configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Optimizer, batch sizing and bookkeeping.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Sampling and reward post-processing.
    #[serde(default)]
    pub rollout: RolloutConfig,

    /// Preference objective.
    #[serde(default)]
    pub online_dpo: OnlineDpoConfig,
}

impl RunConfig {
    /// Load a run configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parse a run configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to YAML.
    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;
        self.rollout.validate()?;
        self.online_dpo.validate()
    }
}

/// Training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Experiment name, the first component of the run name.
    #[serde(default = "default_exp_name")]
    pub exp_name: String,

    /// Explicit run name. Derived from `exp_name`, seed and start time when unset.
    #[serde(default)]
    pub run_name: Option<String>,

    /// Shared random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Learning rate scheduler type.
    #[serde(default)]
    pub lr_scheduler: LrSchedulerType,

    /// Warmup steps, counted in update steps.
    #[serde(default)]
    pub warmup_steps: usize,

    /// Weight decay (AdamW only).
    #[serde(default)]
    pub weight_decay: f64,

    /// Optimizer type.
    #[serde(default)]
    pub optimizer: OptimizerType,

    /// Prompts per device in one accumulation chunk.
    #[serde(default = "default_per_device_batch_size")]
    pub per_device_train_batch_size: usize,

    /// Prompts per device in one evaluation batch.
    #[serde(default = "default_per_device_batch_size")]
    pub per_device_eval_batch_size: usize,

    /// Gradient accumulation steps. Each minibatch holds
    /// `per_device_train_batch_size * gradient_accumulation_steps / 2` prompts,
    /// so this is usually even.
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,

    /// Passes over the prompt dataset, used when `total_episodes` is unset.
    #[serde(default = "default_train_epochs")]
    pub num_train_epochs: f64,

    /// Total number of episodes (sampled completions across all workers).
    #[serde(default)]
    pub total_episodes: Option<usize>,

    /// Output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            exp_name: default_exp_name(),
            run_name: None,
            seed: default_seed(),
            learning_rate: default_lr(),
            lr_scheduler: LrSchedulerType::default(),
            warmup_steps: 0,
            weight_decay: 0.0,
            optimizer: OptimizerType::default(),
            per_device_train_batch_size: default_per_device_batch_size(),
            per_device_eval_batch_size: default_per_device_batch_size(),
            gradient_accumulation_steps: default_gradient_accumulation_steps(),
            num_train_epochs: default_train_epochs(),
            total_episodes: None,
            output_dir: default_output_dir(),
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate < 0.0 {
            return Err(OdpoError::Config("learning_rate must be non-negative".into()));
        }
        if self.per_device_train_batch_size == 0 {
            return Err(OdpoError::Config(
                "per_device_train_batch_size must be positive".into(),
            ));
        }
        if self.per_device_eval_batch_size == 0 {
            return Err(OdpoError::Config(
                "per_device_eval_batch_size must be positive".into(),
            ));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(OdpoError::Config(
                "gradient_accumulation_steps must be positive".into(),
            ));
        }
        if self.total_episodes.is_none() && self.num_train_epochs <= 0.0 {
            return Err(OdpoError::Config(
                "num_train_epochs must be positive when total_episodes is unset".into(),
            ));
        }
        Ok(())
    }
}

/// Learning rate scheduler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    /// Constant learning rate.
    Constant,
    /// Linear decay to zero.
    #[default]
    Linear,
    /// Cosine annealing.
    Cosine,
}

/// Optimizer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    /// AdamW optimizer.
    #[default]
    AdamW,
    /// Plain SGD.
    Sgd,
}

/// Named stop token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopToken {
    /// Use the tokenizer's end-of-sequence id.
    Eos,
}

/// Rollout configuration: sampling and reward post-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Number of tokens sampled per completion.
    #[serde(default = "default_response_length")]
    pub response_length: usize,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Named stop token. Takes precedence over `stop_token_id`.
    #[serde(default)]
    pub stop_token: Option<StopToken>,

    /// Truncation token id.
    #[serde(default)]
    pub stop_token_id: Option<i32>,

    /// End-of-sequence token id.
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: i32,

    /// Padding token id.
    #[serde(default)]
    pub pad_token_id: i32,

    /// Replace the score of completions without an eos token.
    #[serde(default)]
    pub non_eos_penalty: bool,

    /// Score assigned by the eos penalty.
    #[serde(default = "default_penalty_reward_value")]
    pub penalty_reward_value: f32,

    /// Rows per no-grad forward pass during rollout.
    #[serde(default = "default_rollout_forward_batch_size")]
    pub local_rollout_forward_batch_size: usize,

    /// Number of evaluation sampling passes over the whole run. Zero disables them.
    #[serde(default = "default_num_sample_generations")]
    pub num_sample_generations: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            response_length: default_response_length(),
            temperature: default_temperature(),
            stop_token: None,
            stop_token_id: None,
            eos_token_id: default_eos_token_id(),
            pad_token_id: 0,
            non_eos_penalty: false,
            penalty_reward_value: default_penalty_reward_value(),
            local_rollout_forward_batch_size: default_rollout_forward_batch_size(),
            num_sample_generations: default_num_sample_generations(),
        }
    }
}

impl RolloutConfig {
    /// Effective truncation token: `stop_token: eos` resolves to `eos_token_id`.
    #[must_use]
    pub fn resolved_stop_token_id(&self) -> Option<i32> {
        match self.stop_token {
            Some(StopToken::Eos) => Some(self.eos_token_id),
            None => self.stop_token_id,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.response_length == 0 {
            return Err(OdpoError::Config("response_length must be positive".into()));
        }
        if !(self.temperature > 0.0) {
            return Err(OdpoError::Config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.local_rollout_forward_batch_size == 0 {
            return Err(OdpoError::Config(
                "local_rollout_forward_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Preference loss selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LossType {
    /// `-log(sigmoid(beta * logits))`.
    #[default]
    Sigmoid,
    /// `(logits - 1 / (2 * beta))^2`.
    Ipo,
}

impl FromStr for LossType {
    type Err = OdpoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sigmoid" => Ok(Self::Sigmoid),
            "ipo" => Ok(Self::Ipo),
            other => Err(OdpoError::Config(format!("invalid loss type {other}"))),
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sigmoid => f.write_str("sigmoid"),
            Self::Ipo => f.write_str("ipo"),
        }
    }
}

/// Online DPO objective configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineDpoConfig {
    /// Preference strength.
    #[serde(default = "default_beta")]
    pub beta: f64,

    /// Loss function.
    #[serde(default)]
    pub loss_type: LossType,

    /// Optimization epochs over each rollout.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,

    /// Minibatches each rollout is split into.
    #[serde(default = "default_one")]
    pub num_mini_batches: usize,

    /// Completions per prompt.
    #[serde(default = "default_generations_per_prompt")]
    pub num_generation_per_prompt: usize,
}

impl Default for OnlineDpoConfig {
    fn default() -> Self {
        Self {
            beta: default_beta(),
            loss_type: LossType::default(),
            num_epochs: default_num_epochs(),
            num_mini_batches: default_one(),
            num_generation_per_prompt: default_generations_per_prompt(),
        }
    }
}

impl OnlineDpoConfig {
    /// Set beta.
    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Set the loss type.
    pub fn with_loss_type(mut self, loss_type: LossType) -> Self {
        self.loss_type = loss_type;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.beta <= 0.0 {
            return Err(OdpoError::Config("beta must be positive".into()));
        }
        if self.num_epochs == 0 {
            return Err(OdpoError::Config("num_epochs must be positive".into()));
        }
        if self.num_mini_batches == 0 {
            return Err(OdpoError::Config("num_mini_batches must be positive".into()));
        }
        if self.num_generation_per_prompt != GENERATIONS_PER_PROMPT {
            return Err(OdpoError::Config(format!(
                "num_generation_per_prompt must be {GENERATIONS_PER_PROMPT}, got {}",
                self.num_generation_per_prompt
            )));
        }
        Ok(())
    }
}

// Default value functions
fn default_exp_name() -> String {
    "online_dpo".into()
}
fn default_seed() -> u64 {
    1
}
fn default_lr() -> f64 {
    5e-5
}
fn default_per_device_batch_size() -> usize {
    8
}
fn default_one() -> usize {
    1
}
fn default_gradient_accumulation_steps() -> usize {
    2
}
fn default_train_epochs() -> f64 {
    1.0
}
fn default_output_dir() -> String {
    "./output".into()
}
fn default_response_length() -> usize {
    53
}
fn default_temperature() -> f32 {
    0.7
}
fn default_eos_token_id() -> i32 {
    2
}
fn default_penalty_reward_value() -> f32 {
    -1.0
}
fn default_rollout_forward_batch_size() -> usize {
    64
}
fn default_num_sample_generations() -> usize {
    10
}
fn default_beta() -> f64 {
    0.05
}
fn default_num_epochs() -> usize {
    4
}
fn default_generations_per_prompt() -> usize {
    GENERATIONS_PER_PROMPT
}
