//! Accumulation scheduler: the training loop's state machine.
//!
//! One control thread owns [`TrainingState`] and drives
//! `Idle -> Accumulating -> Clipping -> Updating -> (Checkpointing | Logging) -> Idle`.
//! Micro-batches come from the data feed's loader workers, compute is staged
//! through the offload coordinator, and checkpoints/metrics run synchronously at
//! step boundaries. Accumulation windows carry across epoch boundaries; a window
//! still open when the last epoch ends is discarded.

pub mod accumulator;
pub mod signal;
pub mod state;

use serde::Serialize;
use std::sync::Arc;

use crate::checkpoint::{CheckpointId, CheckpointManager, CheckpointRef, ResumeOutcome};
use crate::config::TrainingConfig;
use crate::data::{ByteTokenizer, DataFeed, MicroBatch, Tokenizer};
use crate::error::{CheckpointError, Component, TrainingAborted, TuneloopError};
use crate::metrics::{MetricsReporter, MetricsSink};
use crate::model::{Model, load_model};
use crate::offload::{ModelSnapshot, OffloadCoordinator, OffloadStats, resolve_offload_plan};
use crate::optim::{LrSchedule, build_optimizer};
pub use accumulator::{AccumulatedGradients, GradientAccumulator};
pub use signal::StopSignal;
pub use state::{Phase, TrainingState};

/// What a finished (or stopped) run accomplished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingSummary {
    pub run_name: String,
    pub global_step: u64,
    pub epochs_completed: usize,
    pub total_micro_steps: u64,
    /// Micro-steps of the trailing partial window, dropped at the end of training.
    pub discarded_micro_steps: usize,
    pub stopped_early: bool,
    pub restored_from: Option<CheckpointId>,
    /// Set when a requested checkpoint was missing and training started fresh.
    pub resume_warning: Option<String>,
    /// Checkpoints written by this process, in order.
    pub saved_checkpoints: Vec<CheckpointId>,
    /// Checkpoints on disk after retention.
    pub retained_checkpoints: Vec<CheckpointId>,
    pub checkpoint_failures: usize,
    pub metrics_failures: u64,
    pub last_loss: Option<f64>,
    pub last_eval_loss: Option<f64>,
    pub offload: OffloadStats,
    pub final_state: TrainingState,
}

/// Assembles a [`Trainer`] from a validated configuration.
pub struct TrainerBuilder {
    config: TrainingConfig,
    model: Option<Arc<dyn Model>>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    sinks: Vec<Box<dyn MetricsSink>>,
    stop: StopSignal,
}

impl TrainerBuilder {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            model: None,
            tokenizer: None,
            sinks: Vec::new(),
            stop: StopSignal::new(),
        }
    }

    /// Use `model` instead of resolving `model_name_or_path`.
    pub fn model(mut self, model: Arc<dyn Model>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Deliver metrics to `sink` as well as the run's JSONL and tracing sinks.
    pub fn sink(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Validate, load data, resume if requested and place model state.
    ///
    /// Every failure here is fatal and happens before any step runs.
    pub fn build(self) -> Result<Trainer, TrainingAborted> {
        let Self {
            config,
            model,
            tokenizer,
            sinks,
            stop,
        } = self;
        config.validate().map_err(TrainingAborted::at_startup)?;

        let model = match model {
            Some(model) => model,
            None => load_model(&config.model_name_or_path).map_err(TrainingAborted::at_startup)?,
        };
        let tokenizer = tokenizer.unwrap_or_else(|| Arc::new(ByteTokenizer));
        let plan = resolve_offload_plan(&config).map_err(TrainingAborted::at_startup)?;
        let optimizer = build_optimizer(&config);

        let checkpoints = CheckpointManager::new(config.run_dir(), config.save_total_limit);
        if let Err(e) = checkpoints.sweep_stale() {
            tracing::warn!(error = %e, "Could not sweep stale checkpoint directories");
        }

        let mut restored_from = None;
        let mut resume_warning = None;
        let (state, snapshot) = match &config.resume_from_checkpoint {
            Some(reference) => {
                let reference: CheckpointRef = match reference.parse() {
                    Ok(reference) => reference,
                    Err(never) => match never {},
                };
                match checkpoints
                    .resume(&reference)
                    .map_err(TrainingAborted::at_startup)?
                {
                    ResumeOutcome::Restored(restored) => {
                        restored_from = Some(restored.id);
                        (restored.state, restored.snapshot)
                    }
                    ResumeOutcome::Fresh { warning } => {
                        resume_warning = Some(warning.to_string());
                        (
                            TrainingState::fresh(config.seed),
                            ModelSnapshot::fresh(model.as_ref(), optimizer.as_ref(), config.seed),
                        )
                    }
                }
            }
            None => (
                TrainingState::fresh(config.seed),
                ModelSnapshot::fresh(model.as_ref(), optimizer.as_ref(), config.seed),
            ),
        };

        if !snapshot.matches(&model.layout(), optimizer.slots()) {
            let id = restored_from.map_or_else(|| "fresh".to_string(), |id| id.to_string());
            return Err(TrainingAborted::new(
                Component::CheckpointManager,
                state.global_step,
                state.epoch,
                CheckpointError::Incompatible {
                    id,
                    message: format!(
                        "snapshot does not fit model '{}' with optimizer '{}'",
                        model.name(),
                        optimizer.name()
                    ),
                },
            ));
        }
        if state.data_seed != config.seed {
            tracing::info!(
                checkpoint_seed = state.data_seed,
                configured_seed = config.seed,
                "Using the data seed recorded in the checkpoint"
            );
        }

        let feed = DataFeed::for_training(&config, tokenizer.as_ref())
            .map_err(TrainingAborted::at_startup)?
            .with_seed(state.data_seed);
        let eval_feed = config
            .eval_dataset
            .as_deref()
            .map(|reference| DataFeed::for_evaluation(&config, reference, tokenizer.as_ref()))
            .transpose()
            .map_err(TrainingAborted::at_startup)?;

        let tier = plan.build_tier().map_err(TrainingAborted::at_startup)?;
        let coordinator = OffloadCoordinator::new(model, optimizer, plan.policy, tier, snapshot)
            .map_err(|e| {
                TrainingAborted::new(
                    Component::OffloadCoordinator,
                    state.global_step,
                    state.epoch,
                    e,
                )
            })?;

        let total_steps = (feed.batches_per_epoch() * config.max_epochs
            / config.gradient_accumulation_steps) as u64;
        let schedule = LrSchedule::new(&config, total_steps);

        let mut metrics = MetricsReporter::for_run(&config);
        for sink in sinks {
            metrics.add_sink(sink);
        }

        Ok(Trainer {
            accumulator: GradientAccumulator::new(config.gradient_accumulation_steps),
            feed,
            eval_feed,
            coordinator,
            checkpoints,
            metrics,
            schedule,
            stop,
            last_saved_step: restored_from.map(|id| id.global_step()),
            state,
            phase: Phase::Idle,
            restored_from,
            resume_warning,
            saved: Vec::new(),
            consecutive_save_failures: 0,
            save_failures: 0,
            last_loss: None,
            last_eval_loss: None,
            pending_eval: None,
            config,
        })
    }
}

/// A configured training run.
pub struct Trainer {
    config: TrainingConfig,
    feed: DataFeed,
    eval_feed: Option<DataFeed>,
    coordinator: OffloadCoordinator,
    accumulator: GradientAccumulator,
    checkpoints: CheckpointManager,
    metrics: MetricsReporter,
    schedule: LrSchedule,
    stop: StopSignal,
    state: TrainingState,
    phase: Phase,
    restored_from: Option<CheckpointId>,
    resume_warning: Option<String>,
    saved: Vec<CheckpointId>,
    last_saved_step: Option<u64>,
    consecutive_save_failures: usize,
    save_failures: usize,
    last_loss: Option<f64>,
    last_eval_loss: Option<f64>,
    /// Epoch-end evaluation not yet reported; emitted at the next logging step.
    pending_eval: Option<f64>,
}

impl Trainer {
    pub fn builder(config: TrainingConfig) -> TrainerBuilder {
        TrainerBuilder::new(config)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn restored_from(&self) -> Option<CheckpointId> {
        self.restored_from
    }

    pub fn resume_warning(&self) -> Option<&str> {
        self.resume_warning.as_deref()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run until `max_epochs` is reached or a stop is requested.
    ///
    /// A stop is honored only between accumulation windows; the state at that
    /// boundary is checkpointed before returning.
    pub fn run(&mut self) -> Result<TrainingSummary, TrainingAborted> {
        tracing::info!(
            run = %self.config.run_name,
            model = self.coordinator.model().name(),
            policy = %self.coordinator.policy(),
            samples = self.feed.len(),
            batches_per_epoch = self.feed.batches_per_epoch(),
            gradient_accumulation_steps = self.accumulator.window(),
            total_steps = self.schedule.total_steps,
            global_step = self.state.global_step,
            epoch = self.state.epoch,
            "Starting training"
        );

        let mut stopped = false;
        'epochs: while self.state.epoch < self.config.max_epochs {
            let batches = self
                .feed
                .epoch(self.state.epoch, self.state.epoch_cursor)
                .map_err(|e| self.abort(Component::DataFeed, e))?;
            tracing::debug!(
                epoch = self.state.epoch,
                seed = batches.seed(),
                skip = self.state.epoch_cursor,
                batches = batches.total(),
                "Starting epoch"
            );
            for batch in batches {
                if self.state.at_step_boundary() && self.stop.is_requested() {
                    stopped = true;
                    break 'epochs;
                }
                let batch = batch.map_err(|e| self.abort(Component::DataFeed, e))?;
                self.micro_step(&batch)?;
            }
            self.finish_epoch()?;
        }

        let discarded = self.accumulator.discard();
        self.state.accumulated_micro_steps = 0;
        if discarded > 0 {
            tracing::warn!(
                discarded,
                window = self.accumulator.window(),
                "Discarding partial accumulation window at end of training"
            );
        }

        if stopped {
            tracing::info!(global_step = self.state.global_step, epoch = self.state.epoch, "Stop requested; halting at step boundary");
            self.checkpoint_on_stop()?;
        }
        if let Some(eval_loss) = self.pending_eval.take() {
            self.phase = Phase::Logging;
            self.metrics
                .emit(self.state.global_step, &[("eval_loss", eval_loss)]);
        }
        self.metrics.flush();
        self.phase = Phase::Idle;

        let summary = self.summary(discarded, stopped);
        tracing::info!(
            global_step = summary.global_step,
            epochs = summary.epochs_completed,
            total_micro_steps = summary.total_micro_steps,
            retained = summary.retained_checkpoints.len(),
            gathered_bytes = summary.offload.gathered_bytes,
            scattered_bytes = summary.offload.scattered_bytes,
            peak_fast_bytes = summary.offload.peak_fast_bytes,
            stopped_early = summary.stopped_early,
            "Training finished"
        );
        Ok(summary)
    }

    fn micro_step(&mut self, batch: &MicroBatch) -> Result<(), TrainingAborted> {
        self.phase = Phase::Accumulating;
        let out = self
            .coordinator
            .stage_forward_backward(batch)
            .map_err(|e| self.abort_from(e))?;
        self.accumulator
            .add(out)
            .map_err(|e| self.abort(Component::AccumulationScheduler, e))?;
        self.state.accumulated_micro_steps += 1;
        self.state.epoch_cursor += 1;

        if let Some(window) = self.accumulator.take() {
            self.optimizer_step(window)?;
        }
        Ok(())
    }

    fn optimizer_step(&mut self, mut window: AccumulatedGradients) -> Result<(), TrainingAborted> {
        self.phase = Phase::Clipping;
        let clip = window.clip(self.config.grad_norm_clip);
        if !clip.norm.is_finite() {
            tracing::warn!(global_step = self.state.global_step, norm = clip.norm, "Non-finite gradient norm");
        }

        self.phase = Phase::Updating;
        let lr = self.schedule.lr_at(self.state.global_step);
        self.coordinator
            .apply_optimizer_step(&window, lr, self.state.global_step)
            .map_err(|e| self.abort(Component::OffloadCoordinator, e))?;
        self.state.global_step += 1;
        self.state.total_micro_steps += window.micro_steps() as u64;
        self.state.accumulated_micro_steps = 0;
        self.last_loss = Some(window.mean_loss());

        let step = self.state.global_step;
        tracing::trace!(global_step = step, loss = window.mean_loss(), grad_norm = clip.norm, clipped = clip.clipped, lr, "Optimizer step");

        if step % self.config.save_steps == 0 {
            self.phase = Phase::Checkpointing;
            self.save_checkpoint()?;
        }
        if step % self.config.logging_steps == 0 {
            self.phase = Phase::Logging;
            let epoch = self.fractional_epoch();
            self.metrics.emit(
                step,
                &[
                    ("loss", window.mean_loss()),
                    ("grad_norm", clip.norm),
                    ("learning_rate", lr),
                    ("epoch", epoch),
                ],
            );
            if let Some(eval_loss) = self.pending_eval.take() {
                self.metrics.emit(step, &[("eval_loss", eval_loss)]);
            }
        }
        self.phase = Phase::Idle;
        Ok(())
    }

    fn fractional_epoch(&self) -> f64 {
        let per_epoch = self.feed.batches_per_epoch().max(1) as f64;
        self.state.epoch as f64 + self.state.epoch_cursor as f64 / per_epoch
    }

    fn finish_epoch(&mut self) -> Result<(), TrainingAborted> {
        let finished = self.state.epoch;
        self.state.epoch += 1;
        self.state.epoch_cursor = 0;
        tracing::info!(epoch = finished, global_step = self.state.global_step, "Epoch complete");

        if let Some(eval_loss) = self.evaluate()? {
            self.last_eval_loss = Some(eval_loss);
            tracing::info!(epoch = finished, eval_loss, "Evaluation complete");
            let on_cadence = self.state.at_step_boundary()
                && self.state.global_step > 0
                && self.state.global_step % self.config.logging_steps == 0;
            if on_cadence {
                self.phase = Phase::Logging;
                self.metrics
                    .emit(self.state.global_step, &[("eval_loss", eval_loss)]);
                self.phase = Phase::Idle;
            } else {
                self.pending_eval = Some(eval_loss);
            }
        }
        Ok(())
    }

    /// Forward-only pass over the evaluation feed; mean loss per micro-batch.
    fn evaluate(&mut self) -> Result<Option<f64>, TrainingAborted> {
        let Some(feed) = self.eval_feed.clone() else {
            return Ok(None);
        };
        let batches = feed
            .epoch(0, 0)
            .map_err(|e| self.abort(Component::DataFeed, e))?;
        let mut total = 0.0;
        let mut count = 0usize;
        for batch in batches {
            let batch = batch.map_err(|e| self.abort(Component::DataFeed, e))?;
            let loss = self
                .coordinator
                .stage_forward(&batch)
                .map_err(|e| self.abort_from(e))?;
            total += f64::from(loss);
            count += 1;
        }
        Ok((count > 0).then(|| total / count as f64))
    }

    fn save_checkpoint(&mut self) -> Result<(), TrainingAborted> {
        let snapshot = self
            .coordinator
            .snapshot()
            .map_err(|e| self.abort(Component::OffloadCoordinator, e))?;
        match self.checkpoints.save(&self.state, &snapshot) {
            Ok(id) => {
                self.consecutive_save_failures = 0;
                self.last_saved_step = Some(self.state.global_step);
                self.saved.push(id);
                Ok(())
            }
            Err(e) => {
                self.consecutive_save_failures += 1;
                self.save_failures += 1;
                tracing::warn!(
                    global_step = self.state.global_step,
                    consecutive = self.consecutive_save_failures,
                    limit = self.config.max_consecutive_checkpoint_failures,
                    error = %e,
                    "Checkpoint save failed"
                );
                if self.consecutive_save_failures >= self.config.max_consecutive_checkpoint_failures {
                    return Err(self.abort(Component::CheckpointManager, e));
                }
                Ok(())
            }
        }
    }

    fn checkpoint_on_stop(&mut self) -> Result<(), TrainingAborted> {
        if self.last_saved_step == Some(self.state.global_step) {
            tracing::info!(global_step = self.state.global_step, "Current step already checkpointed");
            return Ok(());
        }
        if self.state.global_step == 0 {
            tracing::info!("No completed steps to checkpoint");
            return Ok(());
        }
        self.phase = Phase::Checkpointing;
        self.save_checkpoint()
    }

    fn summary(&self, discarded: usize, stopped: bool) -> TrainingSummary {
        let retained_checkpoints = match self.checkpoints.list() {
            Ok(list) => list.into_iter().map(|info| info.id).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list retained checkpoints");
                Vec::new()
            }
        };
        TrainingSummary {
            run_name: self.config.run_name.clone(),
            global_step: self.state.global_step,
            epochs_completed: self.state.epoch,
            total_micro_steps: self.state.total_micro_steps,
            discarded_micro_steps: discarded,
            stopped_early: stopped,
            restored_from: self.restored_from,
            resume_warning: self.resume_warning.clone(),
            saved_checkpoints: self.saved.clone(),
            retained_checkpoints,
            checkpoint_failures: self.save_failures,
            metrics_failures: self.metrics.failures(),
            last_loss: self.last_loss,
            last_eval_loss: self.last_eval_loss,
            offload: self.coordinator.stats(),
            final_state: self.state,
        }
    }

    fn abort(&self, component: Component, err: impl Into<TuneloopError>) -> TrainingAborted {
        let aborted = TrainingAborted::new(component, self.state.global_step, self.state.epoch, err);
        tracing::error!(phase = %self.phase, error = %aborted, "Training aborted");
        aborted
    }

    /// Abort, attributing the error to the component that owns its kind.
    fn abort_from(&self, err: TuneloopError) -> TrainingAborted {
        self.abort(Component::of(&err), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;
    use pretty_assertions::assert_eq;

    fn config(dir: &tempfile::TempDir) -> TrainingConfig {
        TrainingConfig {
            model_name_or_path: "builtin:unigram".into(),
            dataset: "synthetic:12".into(),
            max_length: 16,
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 2,
            max_epochs: 2,
            save_steps: 100,
            logging_steps: 1,
            data_loader_workers: 0,
            num_proc: 1,
            output_dir: dir.path().join("out"),
            logging_dir: dir.path().join("logs"),
            learning_rate: 1e-2,
            ..Default::default()
        }
    }

    #[test]
    fn test_counts_and_metrics_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemorySink::new();
        let mut trainer = TrainerBuilder::new(config(&dir))
            .sink(memory.clone())
            .build()
            .unwrap();
        let summary = trainer.run().unwrap();

        // 6 micro-batches per epoch, windows of 2, 2 epochs.
        assert_eq!(summary.global_step, 6);
        assert_eq!(summary.total_micro_steps, 12);
        assert_eq!(summary.discarded_micro_steps, 0);
        assert_eq!(summary.epochs_completed, 2);
        assert_eq!(trainer.phase(), Phase::Idle);

        let steps: Vec<u64> = memory.series("loss").iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![1, 2, 3, 4, 5, 6]);
        assert!(memory.series("grad_norm").iter().all(|(_, v)| v.is_finite()));
        assert_eq!(memory.series("epoch").last().unwrap().1, 2.0);
        assert!(dir.path().join("logs/tuneloop/default.jsonl").exists());
    }

    #[test]
    fn test_window_spans_epochs_and_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            gradient_accumulation_steps: 4,
            max_epochs: 3,
            ..config(&dir)
        };
        let summary = TrainerBuilder::new(config).build().unwrap().run().unwrap();
        // 18 micro-batches: 4 windows of 4, 2 left over.
        assert_eq!(summary.global_step, 4);
        assert_eq!(summary.total_micro_steps, 16);
        assert_eq!(summary.discarded_micro_steps, 2);
    }

    #[test]
    fn test_stop_before_first_step_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let stop = StopSignal::new();
        stop.request();
        let summary = TrainerBuilder::new(config(&dir))
            .stop_signal(stop)
            .build()
            .unwrap()
            .run()
            .unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.global_step, 0);
        assert!(summary.saved_checkpoints.is_empty());
    }

    #[test]
    fn test_unknown_model_aborts_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            model_name_or_path: "gpt2".into(),
            ..config(&dir)
        };
        let err = TrainerBuilder::new(config).build().err().unwrap();
        assert_eq!(err.component, Component::ConfigModel);
        assert_eq!(err.global_step, 0);
    }

    #[test]
    fn test_evaluation_emits_eval_loss_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemorySink::new();
        let config = TrainingConfig {
            eval_dataset: Some("synthetic:5".into()),
            per_device_eval_batch_size: 2,
            ..config(&dir)
        };
        let summary = TrainerBuilder::new(config)
            .sink(memory.clone())
            .build()
            .unwrap()
            .run()
            .unwrap();
        let evals = memory.series("eval_loss");
        assert_eq!(evals.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![3, 6]);
        assert!(evals.iter().all(|(_, v)| *v > 0.0));
        assert_eq!(summary.last_eval_loss, Some(evals[1].1));
    }

    #[test]
    fn test_eval_loss_waits_for_logging_step() {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemorySink::new();
        let config = TrainingConfig {
            eval_dataset: Some("synthetic:5".into()),
            per_device_eval_batch_size: 2,
            gradient_accumulation_steps: 4,
            logging_steps: 2,
            ..config(&dir)
        };
        let summary = TrainerBuilder::new(config)
            .sink(memory.clone())
            .build()
            .unwrap()
            .run()
            .unwrap();
        // Epoch 0 ends inside window 2 and is reported at step 2. Epoch 1 ends
        // after off-cadence step 3 and is reported when training finishes.
        assert_eq!(summary.global_step, 3);
        let steps: Vec<u64> = memory.series("eval_loss").iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![2, 3]);
        let logged: Vec<u64> = memory.series("loss").iter().map(|(s, _)| *s).collect();
        assert_eq!(logged, vec![2]);
    }
}
