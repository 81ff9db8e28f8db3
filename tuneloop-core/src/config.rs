//! Configuration system for tuneloop.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI overrides.
//! The recognized key set is closed: an unknown key anywhere in the layers is a
//! [`ConfigError`], never silently ignored.

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Environment variable prefix (`TUNELOOP_LEARNING_RATE=1e-4`, ...).
pub const ENV_PREFIX: &str = "TUNELOOP_";

/// Memory-offload strategy for parameters and optimizer state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OffloadPolicy {
    /// Everything stays resident in fast memory.
    #[default]
    None,
    /// Optimizer state lives in slow memory and is gathered only for the optimizer step.
    OptimizerOffload,
    /// Parameters are offloaded too and gathered around every forward/backward pass.
    FullOffload,
}

impl fmt::Display for OffloadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffloadPolicy::None => write!(f, "none"),
            OffloadPolicy::OptimizerOffload => write!(f, "optimizer-offload"),
            OffloadPolicy::FullOffload => write!(f, "full-offload"),
        }
    }
}

/// Optimizer selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    AdamW,
    Sgd,
}

/// Learning-rate schedule applied after warmup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedulerType {
    Constant,
    #[default]
    Linear,
    Cosine,
}

/// Validated, immutable record of every training tunable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    /// Reference handed to the model loader (e.g. `builtin:bigram`).
    pub model_name_or_path: String,
    /// Training dataset reference (`path/to/data.jsonl` or `synthetic:<n>`).
    pub dataset: String,
    /// Optional evaluation dataset, evaluated at every epoch end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_dataset: Option<String>,
    /// Truncation / padding target for every sample.
    pub max_length: usize,
    pub pad_token_id: u32,
    /// Background loader threads; 0 loads on the control thread.
    pub data_loader_workers: usize,
    /// Preprocessing parallelism.
    pub num_proc: usize,
    /// Bounded queue depth per loader worker.
    pub prefetch_factor: usize,
    pub drop_last: bool,
    pub shuffle: bool,
    /// Keep only the first `max_samples` usable samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_samples: Option<usize>,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub max_epochs: usize,
    pub save_steps: u64,
    /// Retained checkpoints; 0 retains all.
    pub save_total_limit: usize,
    /// Consecutive failed saves tolerated before the run is aborted.
    pub max_consecutive_checkpoint_failures: usize,
    /// `latest` or a checkpoint id such as `checkpoint-400`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_checkpoint: Option<String>,
    pub learning_rate: f64,
    /// Global gradient-norm ceiling; 0 disables clipping.
    pub grad_norm_clip: f64,
    pub optim: OptimizerKind,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub momentum: f64,
    pub lr_scheduler_type: LrSchedulerType,
    pub warmup_steps: u64,
    pub offload_policy: OffloadPolicy,
    /// Path to a DeepSpeed-style JSON descriptor; overrides `offload_policy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deepspeed: Option<PathBuf>,
    pub logging_steps: u64,
    pub logging_dir: PathBuf,
    pub run_name: String,
    pub wandb_project: String,
    pub output_dir: PathBuf,
    pub seed: u64,
    pub world_size: usize,
    pub rank: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_name_or_path: String::new(),
            dataset: String::new(),
            eval_dataset: None,
            max_length: 512,
            pad_token_id: 0,
            data_loader_workers: 2,
            num_proc: 4,
            prefetch_factor: 2,
            drop_last: false,
            shuffle: true,
            max_samples: None,
            per_device_train_batch_size: 4,
            per_device_eval_batch_size: 4,
            gradient_accumulation_steps: 1,
            max_epochs: 1,
            save_steps: 500,
            save_total_limit: 0,
            max_consecutive_checkpoint_failures: 3,
            resume_from_checkpoint: None,
            learning_rate: 5e-5,
            grad_norm_clip: 1.0,
            optim: OptimizerKind::AdamW,
            weight_decay: 0.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            momentum: 0.0,
            lr_scheduler_type: LrSchedulerType::Linear,
            warmup_steps: 0,
            offload_policy: OffloadPolicy::None,
            deepspeed: None,
            logging_steps: 10,
            logging_dir: PathBuf::from("runs"),
            run_name: "default".to_string(),
            wandb_project: "tuneloop".to_string(),
            output_dir: PathBuf::from("output"),
            seed: 42,
            world_size: 1,
            rank: 0,
        }
    }
}

impl TrainingConfig {
    /// Directory holding this run's checkpoints.
    pub fn run_dir(&self) -> PathBuf {
        self.output_dir.join(&self.run_name)
    }

    /// JSONL file the metrics reporter appends to.
    pub fn metrics_path(&self) -> PathBuf {
        self.logging_dir
            .join(&self.wandb_project)
            .join(format!("{}.jsonl", self.run_name))
    }

    /// Check every numeric and referential invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_name_or_path.trim().is_empty() {
            return Err(ConfigError::MissingKey {
                key: "model_name_or_path".into(),
            });
        }
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::MissingKey {
                key: "dataset".into(),
            });
        }

        let positive = [
            ("max_length", self.max_length),
            ("num_proc", self.num_proc),
            ("prefetch_factor", self.prefetch_factor),
            (
                "per_device_train_batch_size",
                self.per_device_train_batch_size,
            ),
            ("per_device_eval_batch_size", self.per_device_eval_batch_size),
            (
                "gradient_accumulation_steps",
                self.gradient_accumulation_steps,
            ),
            ("max_epochs", self.max_epochs),
            (
                "max_consecutive_checkpoint_failures",
                self.max_consecutive_checkpoint_failures,
            ),
            ("world_size", self.world_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be at least 1"));
            }
        }
        if self.save_steps == 0 {
            return Err(ConfigError::invalid("save_steps", "must be at least 1"));
        }
        if self.logging_steps == 0 {
            return Err(ConfigError::invalid("logging_steps", "must be at least 1"));
        }
        if self.max_samples == Some(0) {
            return Err(ConfigError::invalid(
                "max_samples",
                "must be at least 1 when set",
            ));
        }
        if self.rank >= self.world_size {
            return Err(ConfigError::invalid(
                "rank",
                format!("{} is not below world_size {}", self.rank, self.world_size),
            ));
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::invalid(
                "learning_rate",
                "must be a positive finite number",
            ));
        }
        if !(self.grad_norm_clip.is_finite() && self.grad_norm_clip >= 0.0) {
            return Err(ConfigError::invalid(
                "grad_norm_clip",
                "must be a non-negative finite number",
            ));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(ConfigError::invalid("weight_decay", "must be non-negative"));
        }
        for (key, beta) in [
            ("adam_beta1", self.adam_beta1),
            ("adam_beta2", self.adam_beta2),
            ("momentum", self.momentum),
        ] {
            if !(0.0..1.0).contains(&beta) {
                return Err(ConfigError::invalid(key, "must be in [0, 1)"));
            }
        }
        if !(self.adam_epsilon.is_finite() && self.adam_epsilon > 0.0) {
            return Err(ConfigError::invalid("adam_epsilon", "must be positive"));
        }

        let name = Path::new(&self.run_name);
        if self.run_name.is_empty()
            || name.components().count() != 1
            || self.run_name.starts_with('.')
        {
            return Err(ConfigError::invalid(
                "run_name",
                "must be a single, non-hidden path component",
            ));
        }
        if self.wandb_project.is_empty() || Path::new(&self.wandb_project).components().count() != 1
        {
            return Err(ConfigError::invalid(
                "wandb_project",
                "must be a single path component",
            ));
        }

        Ok(())
    }
}

/// Explicit overrides, typically from command-line flags.
///
/// Only the fields that are set participate in the merge.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_from_checkpoint: Option<String>,
}

/// Load configuration from layered sources and validate it.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TUNELOOP_`)
/// 3. The config file (`.toml`, `.json`, `.yaml`/`.yml`)
/// 4. Built-in defaults
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<TrainingConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrainingConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        figment = match extension.as_deref() {
            Some("toml") => figment.merge(Toml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    path: path.to_path_buf(),
                });
            }
        };
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: TrainingConfig = figment.extract().map_err(|e| ConfigError::Parse {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
