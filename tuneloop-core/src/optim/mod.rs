//! Optimizers, gradient clipping and learning-rate schedules.
//!
//! Optimizers here are stateless update rules: their per-shard state slots
//! (moments, momentum buffers) live in [`OptimizerState`] so the offload
//! coordinator can place each slot on whichever memory tier the policy asks for.

pub mod clip;
pub mod schedule;

use serde::{Deserialize, Serialize};

use crate::config::{OptimizerKind, TrainingConfig};
use crate::model::ShardSpec;
pub use clip::{ClipOutcome, clip_grad_norm};
pub use schedule::LrSchedule;

/// A per-shard parameter update rule.
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;

    /// State buffers kept per shard, each as long as the shard.
    fn slots(&self) -> usize;

    /// Apply one update to a single shard. `step` is the zero-based update index.
    fn update(&self, step: u64, lr: f64, param: &mut [f32], grad: &[f32], state: &mut [Vec<f32>]);
}

/// AdamW (Adam with decoupled weight decay).
///
/// `p = (1 - lr * wd) * p - lr * m_hat / (sqrt(v_hat) + eps)`
#[derive(Debug, Clone, PartialEq)]
pub struct AdamW {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl Default for AdamW {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl Optimizer for AdamW {
    fn name(&self) -> &str {
        "adamw"
    }

    fn slots(&self) -> usize {
        2
    }

    fn update(&self, step: u64, lr: f64, param: &mut [f32], grad: &[f32], state: &mut [Vec<f32>]) {
        let [m, v] = state else {
            return;
        };
        let t = i32::try_from(step.saturating_add(1)).unwrap_or(i32::MAX);
        let bias1 = (1.0 - self.beta1.powi(t)) as f32;
        let bias2 = (1.0 - self.beta2.powi(t)) as f32;
        let (b1, b2) = (self.beta1 as f32, self.beta2 as f32);
        let (lr, eps) = (lr as f32, self.epsilon as f32);
        let decay = 1.0 - lr * self.weight_decay as f32;

        for i in 0..param.len() {
            let g = grad[i];
            m[i] = b1 * m[i] + (1.0 - b1) * g;
            v[i] = b2 * v[i] + (1.0 - b2) * g * g;
            let m_hat = m[i] / bias1;
            let v_hat = v[i] / bias2;
            param[i] = param[i] * decay - lr * m_hat / (v_hat.sqrt() + eps);
        }
    }
}

/// Stochastic gradient descent with optional heavy-ball momentum and L2 decay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sgd {
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn slots(&self) -> usize {
        usize::from(self.momentum > 0.0)
    }

    fn update(&self, _step: u64, lr: f64, param: &mut [f32], grad: &[f32], state: &mut [Vec<f32>]) {
        let lr = lr as f32;
        let wd = self.weight_decay as f32;
        let mu = self.momentum as f32;
        match state {
            [buf] => {
                for i in 0..param.len() {
                    let g = grad[i] + wd * param[i];
                    buf[i] = mu * buf[i] + g;
                    param[i] -= lr * buf[i];
                }
            }
            _ => {
                for i in 0..param.len() {
                    param[i] -= lr * (grad[i] + wd * param[i]);
                }
            }
        }
    }
}

/// Build the optimizer named by `config.optim`.
pub fn build_optimizer(config: &TrainingConfig) -> Box<dyn Optimizer> {
    match config.optim {
        OptimizerKind::AdamW => Box::new(AdamW {
            beta1: config.adam_beta1,
            beta2: config.adam_beta2,
            epsilon: config.adam_epsilon,
            weight_decay: config.weight_decay,
        }),
        OptimizerKind::Sgd => Box::new(Sgd {
            momentum: config.momentum,
            weight_decay: config.weight_decay,
        }),
    }
}

/// Every state slot of every shard, indexed `[shard][slot]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub shards: Vec<Vec<Vec<f32>>>,
}

impl OptimizerState {
    /// Zeroed state for `layout` with `slots` buffers per shard.
    pub fn zeros(layout: &[ShardSpec], slots: usize) -> Self {
        Self {
            shards: layout
                .iter()
                .map(|spec| vec![vec![0.0; spec.len]; slots])
                .collect(),
        }
    }

    /// Slots per shard, or 0 for an empty state.
    pub fn slots(&self) -> usize {
        self.shards.first().map_or(0, Vec::len)
    }

    /// Whether this state fits `layout` with `slots` buffers per shard.
    pub fn matches(&self, layout: &[ShardSpec], slots: usize) -> bool {
        self.shards.len() == layout.len()
            && self
                .shards
                .iter()
                .zip(layout)
                .all(|(shard, spec)| shard.len() == slots && shard.iter().all(|s| s.len() == spec.len))
    }

    pub fn bytes(&self) -> u64 {
        self.shards
            .iter()
            .flatten()
            .map(|s| (s.len() * std::mem::size_of::<f32>()) as u64)
            .sum()
    }
}
