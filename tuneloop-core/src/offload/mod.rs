//! Offload coordinator: places parameters and optimizer state on memory tiers.
//!
//! The fast tier is the coordinator's own resident buffers. Depending on the
//! policy, optimizer slots (and, for full offload, parameters) live on a
//! [`SlowTier`] and are gathered into fast memory only for the duration of the
//! operation that needs them:
//!
//! | policy              | params        | optimizer state |
//! |---------------------|---------------|-----------------|
//! | `none`              | resident      | resident        |
//! | `optimizer-offload` | resident      | slow tier       |
//! | `full-offload`      | slow tier     | slow tier       |
//!
//! Every call is synchronous: it returns once the needed transfers are done.

pub mod descriptor;
pub mod tier;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::OffloadPolicy;
use crate::error::{OffloadError, Result};
use crate::model::{ForwardBackward, Model, ShardSpec};
use crate::optim::{Optimizer, OptimizerState};
use crate::trainer::AccumulatedGradients;
pub use descriptor::{OffloadPlan, TierSpec, parse_descriptor, resolve_offload_plan};
pub use tier::{DiskTier, HostTier, SlotKey, SlotKind, SlowTier};

/// Full copy of model parameters and optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub params: Vec<Vec<f32>>,
    pub optimizer: OptimizerState,
}

impl ModelSnapshot {
    /// Freshly initialized parameters and zeroed optimizer state.
    pub fn fresh(model: &dyn Model, optimizer: &dyn Optimizer, seed: u64) -> Self {
        let layout = model.layout();
        Self {
            params: model.init_parameters(seed),
            optimizer: OptimizerState::zeros(&layout, optimizer.slots()),
        }
    }

    /// Whether the snapshot fits `layout` with `slots` optimizer buffers per shard.
    pub fn matches(&self, layout: &[ShardSpec], slots: usize) -> bool {
        self.params.len() == layout.len()
            && self.params.iter().zip(layout).all(|(p, s)| p.len() == s.len)
            && self.optimizer.matches(layout, slots)
    }
}

/// Transfer and residency counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadStats {
    /// Bytes copied slow -> fast.
    pub gathered_bytes: u64,
    /// Bytes written fast -> slow.
    pub scattered_bytes: u64,
    /// High-water mark of fast-tier bytes.
    pub peak_fast_bytes: u64,
    /// Bytes currently held by the slow tier.
    pub slow_used_bytes: u64,
}

pub struct OffloadCoordinator {
    model: Arc<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    policy: OffloadPolicy,
    layout: Vec<ShardSpec>,
    /// Resident parameters; empty when parameters are offloaded.
    params: Vec<Vec<f32>>,
    /// Resident optimizer state; empty when optimizer state is offloaded.
    optim: Vec<Vec<Vec<f32>>>,
    slow: Box<dyn SlowTier>,
    resident_bytes: u64,
    stats: OffloadStats,
}

impl std::fmt::Debug for OffloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadCoordinator")
            .field("model", &self.model.name())
            .field("optimizer", &self.optimizer.name())
            .field("policy", &self.policy)
            .field("slow_tier", &self.slow.name())
            .field("stats", &self.stats)
            .finish()
    }
}

fn bytes_of(buf: &[f32]) -> u64 {
    (buf.len() * std::mem::size_of::<f32>()) as u64
}

impl OffloadCoordinator {
    /// Place `snapshot` according to `policy`.
    ///
    /// Fails with [`OffloadError::Capacity`] if the slow tier cannot hold its share.
    pub fn new(
        model: Arc<dyn Model>,
        optimizer: Box<dyn Optimizer>,
        policy: OffloadPolicy,
        slow: Box<dyn SlowTier>,
        snapshot: ModelSnapshot,
    ) -> std::result::Result<Self, OffloadError> {
        let layout = model.layout();
        if !snapshot.matches(&layout, optimizer.slots()) {
            return Err(OffloadError::LayoutMismatch {
                expected: layout.len(),
                actual: snapshot.params.len(),
            });
        }

        let mut coordinator = Self {
            model,
            optimizer,
            policy,
            layout,
            params: Vec::new(),
            optim: Vec::new(),
            slow,
            resident_bytes: 0,
            stats: OffloadStats::default(),
        };

        let ModelSnapshot { params, optimizer } = snapshot;
        if coordinator.params_offloaded() {
            for (shard, buf) in params.iter().enumerate() {
                coordinator.scatter(SlotKey::param(shard), buf)?;
            }
        } else {
            coordinator.resident_bytes += params.iter().map(|p| bytes_of(p)).sum::<u64>();
            coordinator.params = params;
        }
        if coordinator.optimizer_offloaded() {
            for (shard, slots) in optimizer.shards.iter().enumerate() {
                for (slot, buf) in slots.iter().enumerate() {
                    coordinator.scatter(SlotKey::optimizer(slot, shard), buf)?;
                }
            }
        } else {
            coordinator.resident_bytes += optimizer.bytes();
            coordinator.optim = optimizer.shards;
        }
        coordinator.stats.peak_fast_bytes = coordinator.resident_bytes;
        coordinator.stats.slow_used_bytes = coordinator.slow.used_bytes();

        tracing::info!(
            policy = %coordinator.policy,
            tier = coordinator.slow.name(),
            shards = coordinator.layout.len(),
            resident_bytes = coordinator.resident_bytes,
            slow_bytes = coordinator.stats.slow_used_bytes,
            "Placed model state"
        );
        Ok(coordinator)
    }

    pub fn policy(&self) -> OffloadPolicy {
        self.policy
    }

    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub fn layout(&self) -> &[ShardSpec] {
        &self.layout
    }

    pub fn stats(&self) -> OffloadStats {
        self.stats
    }

    fn params_offloaded(&self) -> bool {
        self.policy == OffloadPolicy::FullOffload
    }

    fn optimizer_offloaded(&self) -> bool {
        self.policy != OffloadPolicy::None
    }

    fn gather(&mut self, key: SlotKey) -> std::result::Result<Vec<f32>, OffloadError> {
        let buf = self.slow.load(key)?;
        self.stats.gathered_bytes += bytes_of(&buf);
        Ok(buf)
    }

    fn scatter(&mut self, key: SlotKey, buf: &[f32]) -> std::result::Result<(), OffloadError> {
        self.slow.store(key, buf)?;
        self.stats.scattered_bytes += bytes_of(buf);
        self.stats.slow_used_bytes = self.slow.used_bytes();
        Ok(())
    }

    fn note_fast(&mut self, staged: u64) {
        self.stats.peak_fast_bytes = self.stats.peak_fast_bytes.max(self.resident_bytes + staged);
    }

    /// Gather every parameter shard for a forward pass.
    fn gather_params(&mut self) -> std::result::Result<Vec<Vec<f32>>, OffloadError> {
        let mut gathered = Vec::with_capacity(self.layout.len());
        for shard in 0..self.layout.len() {
            gathered.push(self.gather(SlotKey::param(shard))?);
        }
        let staged = gathered.iter().map(|p| bytes_of(p)).sum();
        self.note_fast(staged);
        Ok(gathered)
    }

    /// Run forward/backward for one micro-batch, staging parameters as the policy requires.
    pub fn stage_forward_backward(
        &mut self,
        batch: &crate::data::MicroBatch,
    ) -> Result<ForwardBackward> {
        let out = if self.params_offloaded() {
            // Gathered shards are dropped on return; parameters are unchanged
            // by a forward pass, so nothing is written back.
            let gathered = self.gather_params()?;
            let views: Vec<&[f32]> = gathered.iter().map(Vec::as_slice).collect();
            self.model.forward_backward(&views, batch)?
        } else {
            let views: Vec<&[f32]> = self.params.iter().map(Vec::as_slice).collect();
            self.model.forward_backward(&views, batch)?
        };
        if out.gradients.num_shards() != self.layout.len() {
            return Err(OffloadError::LayoutMismatch {
                expected: self.layout.len(),
                actual: out.gradients.num_shards(),
            }
            .into());
        }
        Ok(out)
    }

    /// Loss only, for evaluation.
    pub fn stage_forward(&mut self, batch: &crate::data::MicroBatch) -> Result<f32> {
        if self.params_offloaded() {
            let gathered = self.gather_params()?;
            let views: Vec<&[f32]> = gathered.iter().map(Vec::as_slice).collect();
            Ok(self.model.forward(&views, batch)?)
        } else {
            let views: Vec<&[f32]> = self.params.iter().map(Vec::as_slice).collect();
            Ok(self.model.forward(&views, batch)?)
        }
    }

    /// Apply one optimizer update, shard by shard.
    ///
    /// Only a completed accumulation window can be passed here. For each shard
    /// the offloaded buffers are gathered, updated and scattered back before the
    /// next shard is touched, so at most one shard's offloaded state is staged.
    pub fn apply_optimizer_step(
        &mut self,
        grads: &AccumulatedGradients,
        lr: f64,
        step: u64,
    ) -> std::result::Result<(), OffloadError> {
        let grads = grads.gradients();
        if grads.num_shards() != self.layout.len() {
            return Err(OffloadError::LayoutMismatch {
                expected: self.layout.len(),
                actual: grads.num_shards(),
            });
        }
        let slots = self.optimizer.slots();

        for (shard, grad) in grads.shards().iter().enumerate() {
            let mut staged = 0;
            let mut param = if self.params_offloaded() {
                let buf = self.gather(SlotKey::param(shard))?;
                staged += bytes_of(&buf);
                buf
            } else {
                std::mem::take(&mut self.params[shard])
            };
            let mut state = if self.optimizer_offloaded() {
                let mut bufs = Vec::with_capacity(slots);
                for slot in 0..slots {
                    let buf = self.gather(SlotKey::optimizer(slot, shard))?;
                    staged += bytes_of(&buf);
                    bufs.push(buf);
                }
                bufs
            } else {
                std::mem::take(&mut self.optim[shard])
            };
            self.note_fast(staged);

            self.optimizer
                .update(step, lr, &mut param, grad, &mut state);

            if self.optimizer_offloaded() {
                for (slot, buf) in state.iter().enumerate() {
                    self.scatter(SlotKey::optimizer(slot, shard), buf)?;
                }
            } else {
                self.optim[shard] = state;
            }
            if self.params_offloaded() {
                self.scatter(SlotKey::param(shard), &param)?;
            } else {
                self.params[shard] = param;
            }
        }
        tracing::trace!(step, lr, policy = %self.policy, "Applied optimizer step");
        Ok(())
    }

    /// Copy of the current parameters and optimizer state, from whichever tier holds them.
    pub fn snapshot(&mut self) -> std::result::Result<ModelSnapshot, OffloadError> {
        let params = if self.params_offloaded() {
            self.gather_params()?
        } else {
            self.params.clone()
        };
        let optimizer = if self.optimizer_offloaded() {
            let slots = self.optimizer.slots();
            let mut shards = Vec::with_capacity(self.layout.len());
            for shard in 0..self.layout.len() {
                let mut bufs = Vec::with_capacity(slots);
                for slot in 0..slots {
                    bufs.push(self.gather(SlotKey::optimizer(slot, shard))?);
                }
                shards.push(bufs);
            }
            OptimizerState { shards }
        } else {
            OptimizerState {
                shards: self.optim.clone(),
            }
        };
        Ok(ModelSnapshot { params, optimizer })
    }
}
