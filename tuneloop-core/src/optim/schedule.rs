//! Learning-rate schedules with linear warmup.

use std::f64::consts::PI;

use crate::config::{LrSchedulerType, TrainingConfig};

/// Maps an update index to a learning rate.
///
/// During warmup the rate ramps linearly from 0; afterwards `Linear` decays to 0
/// at `total_steps`, `Cosine` follows half a cosine to 0, `Constant` holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub base_lr: f64,
    pub kind: LrSchedulerType,
    pub warmup_steps: u64,
    pub total_steps: u64,
}

impl LrSchedule {
    pub fn new(config: &TrainingConfig, total_steps: u64) -> Self {
        Self {
            base_lr: config.learning_rate,
            kind: config.lr_scheduler_type,
            warmup_steps: config.warmup_steps,
            total_steps,
        }
    }

    /// Rate for the update whose zero-based index is `step`.
    pub fn lr_at(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let progress = ((step - self.warmup_steps) as f64 / decay_steps).min(1.0);
        let factor = match self.kind {
            LrSchedulerType::Constant => 1.0,
            LrSchedulerType::Linear => 1.0 - progress,
            LrSchedulerType::Cosine => 0.5 * (1.0 + (PI * progress).cos()),
        };
        self.base_lr * factor.max(0.0)
    }
}
