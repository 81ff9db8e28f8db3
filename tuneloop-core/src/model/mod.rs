//! The model seam: an opaque differentiable function over sharded parameters.
//!
//! The orchestrator never looks inside a model. It only needs the shard
//! layout (so the offload coordinator can place shards on memory tiers), an
//! initializer, and forward/backward entry points.

mod builtin;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::data::MicroBatch;
use crate::error::{ConfigError, ModelError};
pub use builtin::{BigramModel, UnigramModel};

/// Name and element count of one parameter shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub name: String,
    pub len: usize,
}

impl ShardSpec {
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            len,
        }
    }

    pub fn bytes(&self) -> u64 {
        (self.len * std::mem::size_of::<f32>()) as u64
    }
}

/// Per-shard gradients, laid out like the model's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    shards: Vec<Vec<f32>>,
}

impl Gradients {
    pub fn new(shards: Vec<Vec<f32>>) -> Self {
        Self { shards }
    }

    pub fn zeros(layout: &[ShardSpec]) -> Self {
        Self {
            shards: layout.iter().map(|s| vec![0.0; s.len]).collect(),
        }
    }

    pub fn shards(&self) -> &[Vec<f32>] {
        &self.shards
    }

    pub fn shards_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.shards
    }

    pub fn into_shards(self) -> Vec<Vec<f32>> {
        self.shards
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Element-wise `self += other`. Shard layouts must match.
    pub fn add_assign(&mut self, other: &Gradients) -> Result<(), ModelError> {
        if self.shards.len() != other.shards.len() {
            return Err(ModelError::LayoutMismatch {
                expected: self.shards.len(),
                actual: other.shards.len(),
            });
        }
        for (dst, src) in self.shards.iter_mut().zip(&other.shards) {
            if dst.len() != src.len() {
                return Err(ModelError::Compute {
                    message: format!("shard length {} != {}", dst.len(), src.len()),
                });
            }
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f32) {
        for shard in &mut self.shards {
            for g in shard.iter_mut() {
                *g *= factor;
            }
        }
    }

    /// Sum of squares across every shard, accumulated in f64.
    pub fn squared_norm(&self) -> f64 {
        self.shards
            .iter()
            .flatten()
            .map(|&g| f64::from(g) * f64::from(g))
            .sum()
    }
}

/// Output of one forward/backward pass over a micro-batch.
#[derive(Debug, Clone)]
pub struct ForwardBackward {
    /// Mean loss over the micro-batch's predicted positions.
    pub loss: f32,
    pub gradients: Gradients,
}

/// An opaque differentiable model.
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// Parameter shards, in a fixed order.
    fn layout(&self) -> Vec<ShardSpec>;

    /// Fresh parameters for `layout()`, deterministic in `seed`.
    fn init_parameters(&self, seed: u64) -> Vec<Vec<f32>>;

    /// Loss and gradients for `batch`. `params[i]` is shard `i`.
    fn forward_backward(
        &self,
        params: &[&[f32]],
        batch: &MicroBatch,
    ) -> Result<ForwardBackward, ModelError>;

    /// Loss only, for evaluation.
    fn forward(&self, params: &[&[f32]], batch: &MicroBatch) -> Result<f32, ModelError>;
}

/// Resolve `model_name_or_path` to a model implementation.
pub fn load_model(reference: &str) -> Result<Arc<dyn Model>, ConfigError> {
    match reference.trim() {
        "builtin:bigram" => Ok(Arc::new(BigramModel::new())),
        "builtin:unigram" => Ok(Arc::new(UnigramModel::new())),
        other => Err(ConfigError::UnsupportedModel {
            reference: other.to_string(),
        }),
    }
}
