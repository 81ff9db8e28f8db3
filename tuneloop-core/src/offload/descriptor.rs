//! DeepSpeed-style offload descriptors.
//!
//! Only the `zero_optimization.offload_param` / `offload_optimizer` sections are
//! read; every other key in the descriptor is ignored.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::tier::{DiskTier, HostTier, SlowTier};
use crate::config::{OffloadPolicy, TrainingConfig};
use crate::error::{ConfigError, OffloadError};

#[derive(Debug, Default, Deserialize)]
struct Descriptor {
    #[serde(default)]
    zero_optimization: ZeroOptimization,
}

#[derive(Debug, Default, Deserialize)]
struct ZeroOptimization {
    #[serde(default)]
    offload_param: Option<OffloadTarget>,
    #[serde(default)]
    offload_optimizer: Option<OffloadTarget>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OffloadDevice {
    #[default]
    None,
    Cpu,
    Nvme,
}

#[derive(Debug, Deserialize)]
struct OffloadTarget {
    #[serde(default)]
    device: OffloadDevice,
    #[serde(default)]
    nvme_path: Option<PathBuf>,
    /// Host tier cap, in f32 elements.
    #[serde(default)]
    max_in_cpu: Option<u64>,
}

/// Where offloaded buffers go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierSpec {
    Host { capacity_bytes: Option<u64> },
    Disk { root: PathBuf, capacity_bytes: Option<u64> },
}

/// Resolved offload policy plus slow-tier sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadPlan {
    pub policy: OffloadPolicy,
    pub tier: TierSpec,
}

impl OffloadPlan {
    /// Plan for `policy` with an unbounded host tier.
    pub fn host(policy: OffloadPolicy) -> Self {
        Self {
            policy,
            tier: TierSpec::Host {
                capacity_bytes: None,
            },
        }
    }

    /// Instantiate the slow tier.
    pub fn build_tier(&self) -> Result<Box<dyn SlowTier>, OffloadError> {
        Ok(match &self.tier {
            TierSpec::Host { capacity_bytes } => Box::new(HostTier::new(*capacity_bytes)),
            TierSpec::Disk {
                root,
                capacity_bytes,
            } => Box::new(DiskTier::new(root, *capacity_bytes)?),
        })
    }
}

fn descriptor_error(path: &Path, message: impl Into<String>) -> ConfigError {
    ConfigError::Descriptor {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn tier_for(path: &Path, target: &OffloadTarget) -> Result<TierSpec, ConfigError> {
    let capacity_bytes = target
        .max_in_cpu
        .map(|elements| elements.saturating_mul(std::mem::size_of::<f32>() as u64));
    match target.device {
        OffloadDevice::Nvme => {
            let root = target
                .nvme_path
                .clone()
                .ok_or_else(|| descriptor_error(path, "device \"nvme\" requires nvme_path"))?;
            Ok(TierSpec::Disk {
                root,
                capacity_bytes: None,
            })
        }
        _ => Ok(TierSpec::Host { capacity_bytes }),
    }
}

/// Parse a descriptor file into an offload plan.
pub fn parse_descriptor(path: &Path) -> Result<OffloadPlan, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| descriptor_error(path, e.to_string()))?;
    let descriptor: Descriptor =
        serde_json::from_str(&raw).map_err(|e| descriptor_error(path, e.to_string()))?;
    let zero = descriptor.zero_optimization;

    let active = |t: &Option<OffloadTarget>| {
        t.as_ref()
            .filter(|t| t.device != OffloadDevice::None)
            .map(|t| tier_for(path, t))
            .transpose()
    };
    if let Some(tier) = active(&zero.offload_param)? {
        return Ok(OffloadPlan {
            policy: OffloadPolicy::FullOffload,
            tier,
        });
    }
    if let Some(tier) = active(&zero.offload_optimizer)? {
        return Ok(OffloadPlan {
            policy: OffloadPolicy::OptimizerOffload,
            tier,
        });
    }
    Ok(OffloadPlan::host(OffloadPolicy::None))
}

/// Resolve the effective offload plan: the `deepspeed` descriptor wins over
/// `offload_policy` when both are set.
pub fn resolve_offload_plan(config: &TrainingConfig) -> Result<OffloadPlan, ConfigError> {
    let Some(path) = &config.deepspeed else {
        return Ok(OffloadPlan::host(config.offload_policy));
    };
    let plan = parse_descriptor(path)?;
    if config.offload_policy != OffloadPolicy::None && config.offload_policy != plan.policy {
        tracing::warn!(
            configured = %config.offload_policy,
            descriptor = %plan.policy,
            path = %path.display(),
            "offload_policy disagrees with the deepspeed descriptor; using the descriptor"
        );
    }
    Ok(plan)
}
