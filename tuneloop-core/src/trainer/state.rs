//! Mutable training progress owned by the control thread.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters that, together with a model snapshot, fully describe a run's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed optimizer updates.
    pub global_step: u64,
    /// Current epoch, zero-based.
    pub epoch: usize,
    /// Micro-steps in the open accumulation window.
    pub accumulated_micro_steps: usize,
    /// Micro-steps folded into completed updates.
    pub total_micro_steps: u64,
    /// Micro-batches of `epoch` already consumed.
    pub epoch_cursor: usize,
    /// Run seed the data feed derives its epoch permutations from.
    pub data_seed: u64,
}

impl TrainingState {
    pub fn fresh(data_seed: u64) -> Self {
        Self {
            data_seed,
            ..Default::default()
        }
    }

    /// No accumulation window is open.
    pub fn at_step_boundary(&self) -> bool {
        self.accumulated_micro_steps == 0
    }
}

/// Where the accumulation scheduler is in its cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Accumulating,
    Clipping,
    Updating,
    Checkpointing,
    Logging,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Accumulating => "accumulating",
            Phase::Clipping => "clipping",
            Phase::Updating => "updating",
            Phase::Checkpointing => "checkpointing",
            Phase::Logging => "logging",
        };
        f.write_str(name)
    }
}
