//! # Tuneloop Core
//!
//! Core library for the tuneloop fine-tuning orchestrator.
//! Provides the sharded data feed, the offload coordinator, the gradient
//! accumulation scheduler, resumable checkpoints, metrics reporting and
//! layered configuration.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod offload;
pub mod optim;
pub mod persistence;
pub mod trainer;

// Re-export commonly used types at the crate root.
pub use checkpoint::{
    CheckpointId, CheckpointInfo, CheckpointManager, CheckpointManifest, CheckpointRef,
    ResumeOutcome,
};
pub use config::{
    ConfigOverrides, LrSchedulerType, OffloadPolicy, OptimizerKind, TrainingConfig, load_config,
};
pub use data::{ByteTokenizer, DataFeed, MicroBatch, Sample, Tokenizer};
pub use error::{
    CheckpointError, Component, ConfigError, DataError, MetricsError, ModelError, OffloadError,
    Result, TrainingAborted, TuneloopError,
};
pub use metrics::{JsonlSink, MemorySink, Metric, MetricsReporter, MetricsSink, TracingSink};
pub use model::{Model, load_model};
pub use offload::{ModelSnapshot, OffloadCoordinator, OffloadStats};
pub use trainer::{Phase, StopSignal, Trainer, TrainerBuilder, TrainingState, TrainingSummary};
