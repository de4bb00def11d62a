//! Learning rate schedule over outer updates.
//!
//! One tick per update, taken at the start of the update before rollout:
//! the rate logged with an update is the rate its minibatches used. With the
//! linear schedule the last update of a run therefore trains at zero.

use std::f64::consts::PI;

use crate::{LrSchedulerType, TrainingConfig};

/// Warmup followed by a constant, linear or cosine decay toward `floor`.
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    peak: f64,
    floor: f64,
    horizon: usize,
    warmup: usize,
    shape: LrSchedulerType,
    ticks: usize,
}

impl LearningRateScheduler {
    /// Schedule reaching `peak` after `warmup` ticks and decaying until `horizon`.
    pub fn new(peak: f64, horizon: usize, warmup: usize, shape: LrSchedulerType) -> Self {
        Self {
            peak,
            floor: 0.0,
            horizon,
            warmup,
            shape,
            ticks: 0,
        }
    }

    /// Schedule spanning `num_updates` updates.
    pub fn from_config(config: &TrainingConfig, num_updates: usize) -> Self {
        Self::new(
            config.learning_rate,
            num_updates,
            config.warmup_steps,
            config.lr_scheduler,
        )
    }

    /// Decay toward `floor` instead of zero.
    pub fn with_min_lr(self, floor: f64) -> Self {
        Self { floor, ..self }
    }

    /// Rate after `tick` ticks.
    #[must_use]
    pub fn get_lr(&self, tick: usize) -> f64 {
        self.floor + (self.peak - self.floor) * self.multiplier(tick)
    }

    /// Fraction of the span `peak - floor` in effect after `tick` ticks.
    fn multiplier(&self, tick: usize) -> f64 {
        if tick < self.warmup {
            return tick as f64 / self.warmup as f64;
        }
        let decay_len = self.horizon.saturating_sub(self.warmup);
        if decay_len == 0 {
            return 1.0;
        }
        let progress = ((tick - self.warmup) as f64 / decay_len as f64).min(1.0);
        match self.shape {
            LrSchedulerType::Constant => 1.0,
            LrSchedulerType::Linear => 1.0 - progress,
            LrSchedulerType::Cosine => 0.5 * (1.0 + (PI * progress).cos()),
        }
    }

    /// Rate at the current tick.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.get_lr(self.ticks)
    }

    /// Advance one update.
    pub fn step(&mut self) {
        self.ticks += 1;
    }

    /// Ticks taken so far.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.ticks
    }

    /// Number of updates the decay spans.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.horizon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_constant_ignores_progress() {
        let schedule = LearningRateScheduler::new(2e-4, 50, 0, LrSchedulerType::Constant);
        assert!(close(schedule.get_lr(0), 2e-4));
        assert!(close(schedule.get_lr(49), 2e-4));
        assert!(close(schedule.get_lr(500), 2e-4));
    }

    #[test]
    fn test_linear_hits_zero_at_horizon() {
        let schedule = LearningRateScheduler::new(1.0, 10, 0, LrSchedulerType::Linear);
        assert!(close(schedule.get_lr(0), 1.0));
        assert!(close(schedule.get_lr(5), 0.5));
        assert!(close(schedule.get_lr(10), 0.0));
        assert!(close(schedule.get_lr(12), 0.0));
    }

    #[test]
    fn test_tick_precedes_first_use() {
        let mut schedule = LearningRateScheduler::new(1.0, 4, 0, LrSchedulerType::Linear);
        let seen: Vec<f64> = (0..4)
            .map(|_| {
                schedule.step();
                schedule.current_lr()
            })
            .collect();
        assert_eq!(schedule.current_step(), 4);
        assert_eq!(seen, vec![0.75, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn test_cosine_with_warmup_and_floor() {
        let schedule =
            LearningRateScheduler::new(1.0, 12, 4, LrSchedulerType::Cosine).with_min_lr(0.2);
        assert!(close(schedule.get_lr(0), 0.2));
        assert!(close(schedule.get_lr(2), 0.6));
        assert!(close(schedule.get_lr(4), 1.0));
        assert!(close(schedule.get_lr(8), 0.6));
        assert!(close(schedule.get_lr(12), 0.2));
    }

    #[test]
    fn test_from_config() {
        let config = TrainingConfig {
            learning_rate: 3e-6,
            ..Default::default()
        };
        let schedule = LearningRateScheduler::from_config(&config, 20);
        assert_eq!(schedule.total_steps(), 20);
        assert!((schedule.get_lr(0) - 3e-6).abs() < 1e-15);
    }
}
