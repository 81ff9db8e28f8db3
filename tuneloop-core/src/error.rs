//! Error types for the tuneloop core library.
//!
//! Uses `thiserror` for per-component error enums. Fatal conditions reach the
//! caller wrapped in [`TrainingAborted`], which names the component that
//! raised them and the last completed step, so a run can be resumed by hand.

use std::fmt;
use std::path::PathBuf;

/// Top-level error type for the tuneloop core library.
#[derive(Debug, thiserror::Error)]
pub enum TuneloopError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Offload error: {0}")]
    Offload(#[from] OffloadError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from loading and validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Unsupported configuration format: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("Missing required key: {key}")]
    MissingKey { key: String },

    #[error("Invalid value for '{key}': {message}")]
    Invalid { key: String, message: String },

    #[error("Configuration parse error: {message}")]
    Parse { message: String },

    #[error("Offload descriptor {path}: {message}")]
    Descriptor { path: PathBuf, message: String },

    #[error("Unsupported model reference: {reference}")]
    UnsupportedModel { reference: String },

    #[error("Unsupported dataset reference: {reference}")]
    UnsupportedDataset { reference: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Errors from the sharded data feed.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Dataset exhausted: {reason}")]
    Exhausted { reason: String },

    #[error("Failed to read dataset {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Malformed record at {path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Data loader worker pool failure: {message}")]
    WorkerPool { message: String },
}

/// Errors from the offload coordinator and its memory tiers.
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error(
        "{tier} tier cannot hold shard {key}: needs {needed_bytes} bytes, {available_bytes} available"
    )]
    Capacity {
        tier: String,
        key: String,
        needed_bytes: u64,
        available_bytes: u64,
    },

    #[error("Transfer of shard {key} via {tier} tier failed: {message}")]
    Transfer {
        tier: String,
        key: String,
        message: String,
    },

    #[error("Shard {key} is not resident in any tier")]
    MissingShard { key: String },

    #[error("Gradient layout mismatch: expected {expected} shards, got {actual}")]
    LayoutMismatch { expected: usize, actual: usize },
}

/// Errors from the checkpoint manager.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {id}")]
    NotFound { id: String },

    #[error("Failed to write checkpoint {id}: {message}")]
    Write { id: String, message: String },

    #[error("Checkpoint {id} is corrupt: {message}")]
    Corrupt { id: String, message: String },

    #[error("Checkpoint {id} does not match the model: {message}")]
    Incompatible { id: String, message: String },

    #[error("Refusing to checkpoint mid-window ({accumulated} micro-steps pending)")]
    InconsistentState { accumulated: usize },

    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Whether a failed resume may fall back to fresh training state.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from metric delivery. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metrics sink '{sink}' failed to deliver: {message}")]
    Delivery { sink: String, message: String },
}

/// Errors raised by a model's forward/backward computation.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Token id {token} is outside the vocabulary of {vocab_size}")]
    TokenOutOfRange { token: u32, vocab_size: usize },

    #[error("Parameter layout mismatch: expected {expected} shards, got {actual}")]
    LayoutMismatch { expected: usize, actual: usize },

    #[error("Model computation failed: {message}")]
    Compute { message: String },
}

/// The component a fatal error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    ConfigModel,
    DataFeed,
    OffloadCoordinator,
    AccumulationScheduler,
    CheckpointManager,
    MetricsReporter,
    Model,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::ConfigModel => "config model",
            Component::DataFeed => "data feed",
            Component::OffloadCoordinator => "offload coordinator",
            Component::AccumulationScheduler => "accumulation scheduler",
            Component::CheckpointManager => "checkpoint manager",
            Component::MetricsReporter => "metrics reporter",
            Component::Model => "model",
        };
        f.write_str(name)
    }
}

impl Component {
    /// Attribute an error to the component that owns its kind.
    pub fn of(err: &TuneloopError) -> Self {
        match err {
            TuneloopError::Config(_) => Component::ConfigModel,
            TuneloopError::Data(_) => Component::DataFeed,
            TuneloopError::Offload(_) => Component::OffloadCoordinator,
            TuneloopError::Checkpoint(_) => Component::CheckpointManager,
            TuneloopError::Model(_) => Component::Model,
            TuneloopError::Metrics(_) => Component::MetricsReporter,
            TuneloopError::Io(_) | TuneloopError::Serialization(_) => {
                Component::AccumulationScheduler
            }
        }
    }
}

/// A fatal error that ended a training run.
#[derive(Debug, thiserror::Error)]
#[error(
    "{component} aborted training (last completed global_step={global_step}, epoch={epoch}): {source}"
)]
pub struct TrainingAborted {
    pub component: Component,
    pub global_step: u64,
    pub epoch: usize,
    #[source]
    pub source: Box<TuneloopError>,
}

impl TrainingAborted {
    pub fn new(
        component: Component,
        global_step: u64,
        epoch: usize,
        source: impl Into<TuneloopError>,
    ) -> Self {
        Self {
            component,
            global_step,
            epoch,
            source: Box::new(source.into()),
        }
    }

    /// Abort before any step ran, attributing the error by its kind.
    pub fn at_startup(source: impl Into<TuneloopError>) -> Self {
        let source = source.into();
        Self {
            component: Component::of(&source),
            global_step: 0,
            epoch: 0,
            source: Box::new(source),
        }
    }
}

/// A type alias for results using the top-level `TuneloopError`.
pub type Result<T> = std::result::Result<T, TuneloopError>;
