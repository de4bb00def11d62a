//! Optimizers with a scheduler-controlled learning rate.

use mlx_rs::{
    array,
    builder::Builder,
    error::Exception,
    module::{FlattenedModuleParam, ModuleParameters},
    optimizers::{AdamW, AdamWBuilder, Optimizer, Sgd},
};
use odpo_core::{OptimizerType, TrainingConfig};

/// An optimizer whose learning rate is set from outside before each update.
pub trait ScheduledOptimizer {
    /// Set the learning rate used by subsequent steps.
    fn set_learning_rate(&mut self, lr: f32);

    /// Current learning rate.
    fn learning_rate(&self) -> f32;

    /// Apply `gradients` to `model` once.
    fn apply_gradients<M: ModuleParameters>(
        &mut self,
        model: &mut M,
        gradients: &FlattenedModuleParam,
    ) -> Result<(), Exception>;
}

impl ScheduledOptimizer for AdamW {
    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = array!(lr);
    }

    fn learning_rate(&self) -> f32 {
        self.lr.item()
    }

    fn apply_gradients<M: ModuleParameters>(
        &mut self,
        model: &mut M,
        gradients: &FlattenedModuleParam,
    ) -> Result<(), Exception> {
        self.update(model, gradients)
    }
}

impl ScheduledOptimizer for Sgd {
    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = array!(lr);
    }

    fn learning_rate(&self) -> f32 {
        self.lr.item()
    }

    fn apply_gradients<M: ModuleParameters>(
        &mut self,
        model: &mut M,
        gradients: &FlattenedModuleParam,
    ) -> Result<(), Exception> {
        self.update(model, gradients)
    }
}

/// Optimizer selected by [`TrainingConfig::optimizer`].
#[derive(Debug)]
pub enum PolicyOptimizer {
    /// AdamW with decoupled weight decay.
    AdamW(AdamW),
    /// Plain SGD.
    Sgd(Sgd),
}

impl PolicyOptimizer {
    /// Build the configured optimizer at the configured base learning rate.
    pub fn from_config(config: &TrainingConfig) -> Result<Self, Exception> {
        let lr = config.learning_rate as f32;
        match config.optimizer {
            OptimizerType::AdamW => {
                let optimizer = AdamWBuilder::new(lr)
                    .weight_decay(config.weight_decay as f32)
                    .build()
                    .map_err(|_| Exception::custom("Failed to build AdamW optimizer"))?;
                Ok(Self::AdamW(optimizer))
            }
            OptimizerType::Sgd => Ok(Self::Sgd(Sgd::new(lr))),
        }
    }
}

impl ScheduledOptimizer for PolicyOptimizer {
    fn set_learning_rate(&mut self, lr: f32) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }

    fn learning_rate(&self) -> f32 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    fn apply_gradients<M: ModuleParameters>(
        &mut self,
        model: &mut M,
        gradients: &FlattenedModuleParam,
    ) -> Result<(), Exception> {
        match self {
            Self::AdamW(opt) => opt.apply_gradients(model, gradients),
            Self::Sgd(opt) => opt.apply_gradients(model, gradients),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_selects_optimizer() {
        let mut config = TrainingConfig::default();
        assert!(matches!(
            PolicyOptimizer::from_config(&config).unwrap(),
            PolicyOptimizer::AdamW(_)
        ));
        config.optimizer = OptimizerType::Sgd;
        assert!(matches!(
            PolicyOptimizer::from_config(&config).unwrap(),
            PolicyOptimizer::Sgd(_)
        ));
    }

    #[test]
    fn test_set_learning_rate() {
        let mut optimizer = PolicyOptimizer::from_config(&TrainingConfig::default()).unwrap();
        optimizer.set_learning_rate(1e-3);
        assert!((optimizer.learning_rate() - 1e-3).abs() < 1e-9);
    }
}
