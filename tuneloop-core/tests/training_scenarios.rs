//! Integration tests for the training loop.
//!
//! Each test drives a full `Trainer` run over synthetic data with the built-in
//! models and checks counters, checkpoint retention, resume behavior and fatal
//! error attribution.

use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tuneloop_core::checkpoint::{CheckpointId, CheckpointManager, CheckpointRef};
use tuneloop_core::config::{OffloadPolicy, TrainingConfig};
use tuneloop_core::data::{ByteTokenizer, DataFeed, MicroBatch};
use tuneloop_core::error::{Component, MetricsError, ModelError};
use tuneloop_core::metrics::{MemorySink, Metric, MetricsSink};
use tuneloop_core::model::{ForwardBackward, Model, ShardSpec, UnigramModel};
use tuneloop_core::trainer::{StopSignal, TrainerBuilder, TrainingSummary};

/// Helper to create a small config rooted in a temp directory.
fn base_config(dir: &Path) -> TrainingConfig {
    TrainingConfig {
        model_name_or_path: "builtin:unigram".into(),
        dataset: "synthetic:24".into(),
        max_length: 32,
        per_device_train_batch_size: 2,
        gradient_accumulation_steps: 1,
        max_epochs: 1,
        save_steps: 1000,
        logging_steps: 1,
        learning_rate: 1e-2,
        output_dir: dir.join("output"),
        logging_dir: dir.join("runs"),
        run_name: "test-run".into(),
        ..Default::default()
    }
}

fn run(config: TrainingConfig) -> TrainingSummary {
    TrainerBuilder::new(config).build().unwrap().run().unwrap()
}

/// Requests a stop once a metric for `step` has been delivered.
struct StopAtStep {
    step: u64,
    signal: StopSignal,
}

impl MetricsSink for StopAtStep {
    fn name(&self) -> &str {
        "stop-at-step"
    }

    fn deliver(&mut self, metrics: &[Metric]) -> Result<(), MetricsError> {
        if metrics.iter().any(|m| m.step >= self.step) {
            self.signal.request();
        }
        Ok(())
    }
}

#[test]
fn test_partial_final_micro_batch_and_single_update() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        dataset: "synthetic:9".into(),
        per_device_train_batch_size: 2,
        gradient_accumulation_steps: 4,
        drop_last: false,
        ..base_config(dir.path())
    };

    let feed = DataFeed::for_training(&config, &ByteTokenizer).unwrap();
    let sizes: Vec<usize> = feed.epoch(0, 0).unwrap().map(|b| b.unwrap().len()).collect();
    assert_eq!(sizes, vec![2, 2, 2, 2, 1]);

    let memory = MemorySink::new();
    let summary = TrainerBuilder::new(config)
        .sink(memory.clone())
        .build()
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.global_step, 1);
    assert_eq!(summary.total_micro_steps, 4);
    assert_eq!(summary.discarded_micro_steps, 1);
    assert_eq!(memory.series("loss").len(), 1);
}

#[test]
fn test_retention_keeps_two_newest_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        dataset: "synthetic:650".into(),
        max_length: 16,
        per_device_train_batch_size: 1,
        gradient_accumulation_steps: 1,
        save_steps: 200,
        save_total_limit: 2,
        logging_steps: 50,
        shuffle: true,
        ..base_config(dir.path())
    };
    let run_dir = config.run_dir();
    let summary = run(config);

    assert_eq!(summary.global_step, 650);
    assert_eq!(
        summary.saved_checkpoints,
        vec![CheckpointId(200), CheckpointId(400), CheckpointId(600)]
    );
    assert_eq!(
        summary.retained_checkpoints,
        vec![CheckpointId(400), CheckpointId(600)]
    );

    let on_disk: BTreeSet<String> = std::fs::read_dir(&run_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        on_disk,
        BTreeSet::from(["checkpoint-400".to_string(), "checkpoint-600".to_string()])
    );
}

#[test]
fn test_max_samples_caps_before_shuffling() {
    let dir = tempfile::tempdir().unwrap();
    let capped = TrainingConfig {
        dataset: "synthetic:1000".into(),
        max_samples: Some(50),
        per_device_train_batch_size: 5,
        shuffle: true,
        ..base_config(dir.path())
    };
    let reference = TrainingConfig {
        dataset: "synthetic:50".into(),
        shuffle: false,
        ..capped.clone()
    };
    let feed = DataFeed::for_training(&capped, &ByteTokenizer).unwrap();
    let first_fifty: Vec<_> = DataFeed::for_training(&reference, &ByteTokenizer)
        .unwrap()
        .epoch(0, 0)
        .unwrap()
        .flat_map(|b| b.unwrap().samples)
        .collect();
    assert_eq!(feed.len(), 50);

    let mut orders = Vec::new();
    for epoch in 0..3 {
        let mut seen = BTreeMap::new();
        let mut order = Vec::new();
        for batch in feed.epoch(epoch, 0).unwrap() {
            let batch = batch.unwrap();
            for (id, sample) in batch.sample_ids.iter().zip(batch.samples) {
                order.push(*id);
                seen.insert(*id, sample);
            }
        }
        assert_eq!(seen.keys().copied().collect::<Vec<_>>(), (0..50).collect::<Vec<_>>());
        for (id, sample) in &seen {
            assert_eq!(sample, &first_fifty[*id]);
        }
        orders.push(order);
    }
    assert_ne!(orders[0], orders[1]);

    let summary = run(TrainingConfig {
        max_epochs: 3,
        ..capped
    });
    assert_eq!(summary.global_step, 30);
}

#[test]
fn test_missing_checkpoint_trains_fresh_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    let summary = run(TrainingConfig {
        resume_from_checkpoint: Some("missing-id".into()),
        ..base_config(dir.path())
    });
    assert_eq!(summary.restored_from, None);
    let warning = summary.resume_warning.unwrap();
    assert!(warning.contains("missing-id"), "warning was: {warning}");
    assert_eq!(summary.global_step, 12);
}

#[test]
fn test_stop_and_resume_matches_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = |root: &str| TrainingConfig {
        model_name_or_path: "builtin:bigram".into(),
        per_device_train_batch_size: 2,
        gradient_accumulation_steps: 3,
        max_epochs: 2,
        data_loader_workers: 2,
        shuffle: true,
        save_steps: 8,
        ..base_config(&dir.path().join(root))
    };

    let straight = run(config("straight"));
    assert_eq!(straight.global_step, 8);
    assert_eq!(straight.saved_checkpoints, vec![CheckpointId(8)]);

    let signal = StopSignal::new();
    let stopped = TrainerBuilder::new(config("interrupted"))
        .stop_signal(signal.clone())
        .sink(StopAtStep { step: 5, signal })
        .build()
        .unwrap()
        .run()
        .unwrap();
    assert!(stopped.stopped_early);
    assert_eq!(stopped.global_step, 5);
    assert_eq!(stopped.saved_checkpoints, vec![CheckpointId(5)]);
    assert_eq!(stopped.final_state.epoch, 1);
    assert_eq!(stopped.final_state.epoch_cursor, 3);

    let resumed = run(TrainingConfig {
        resume_from_checkpoint: Some("latest".into()),
        ..config("interrupted")
    });
    assert_eq!(resumed.restored_from, Some(CheckpointId(5)));
    assert_eq!(resumed.global_step, 8);
    assert_eq!(resumed.total_micro_steps, 24);

    let load = |root: &str| {
        CheckpointManager::new(config(root).run_dir(), 0)
            .restore(&CheckpointRef::Named("checkpoint-8".into()))
            .unwrap()
    };
    let a = load("straight");
    let b = load("interrupted");
    assert_eq!(a.state, b.state);
    assert_eq!(a.snapshot, b.snapshot);
}

/// Unigram model that requests a stop during its `at`-th forward/backward call.
struct StopDuringWindow {
    inner: UnigramModel,
    calls: Arc<AtomicUsize>,
    at: usize,
    signal: StopSignal,
}

impl Model for StopDuringWindow {
    fn name(&self) -> &str {
        "stop-during-window"
    }

    fn layout(&self) -> Vec<ShardSpec> {
        self.inner.layout()
    }

    fn init_parameters(&self, seed: u64) -> Vec<Vec<f32>> {
        self.inner.init_parameters(seed)
    }

    fn forward_backward(
        &self,
        params: &[&[f32]],
        batch: &MicroBatch,
    ) -> Result<ForwardBackward, ModelError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.at {
            self.signal.request();
        }
        self.inner.forward_backward(params, batch)
    }

    fn forward(&self, params: &[&[f32]], batch: &MicroBatch) -> Result<f32, ModelError> {
        self.inner.forward(params, batch)
    }
}

#[test]
fn test_stop_inside_window_waits_for_step_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        gradient_accumulation_steps: 4,
        ..base_config(dir.path())
    };
    let signal = StopSignal::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let model = StopDuringWindow {
        inner: UnigramModel::new(),
        calls: calls.clone(),
        at: 6,
        signal: signal.clone(),
    };

    let summary = TrainerBuilder::new(config.clone())
        .model(Arc::new(model))
        .stop_signal(signal)
        .build()
        .unwrap()
        .run()
        .unwrap();

    // Requested during micro-step 6; the second window (5..=8) still completes.
    assert!(summary.stopped_early);
    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert_eq!(summary.global_step, 2);
    assert_eq!(summary.total_micro_steps, 8);
    assert_eq!(summary.discarded_micro_steps, 0);
    assert_eq!(summary.final_state.accumulated_micro_steps, 0);
    assert_eq!(summary.final_state.epoch_cursor, 8);
    assert_eq!(summary.saved_checkpoints, vec![CheckpointId(2)]);

    let restored = CheckpointManager::new(config.run_dir(), 0)
        .restore(&CheckpointRef::Latest)
        .unwrap();
    assert_eq!(restored.state.global_step, 2);
    assert_eq!(restored.state.total_micro_steps, 8);
    assert_eq!(restored.state.epoch_cursor, 8);
}

#[test]
fn test_offload_policies_train_identically() {
    let dir = tempfile::tempdir().unwrap();
    let swap = dir.path().join("swap");
    std::fs::create_dir_all(&swap).unwrap();
    let descriptor = dir.path().join("ds_config.json");
    std::fs::write(
        &descriptor,
        format!(
            r#"{{"zero_optimization": {{"stage": 3,
                "offload_param": {{"device": "nvme", "nvme_path": "{}"}}}}}}"#,
            swap.display()
        ),
    )
    .unwrap();

    let config = |root: &str| TrainingConfig {
        model_name_or_path: "builtin:bigram".into(),
        gradient_accumulation_steps: 2,
        save_steps: 6,
        ..base_config(&dir.path().join(root))
    };
    let resident = run(config("resident"));
    let optimizer = run(TrainingConfig {
        offload_policy: OffloadPolicy::OptimizerOffload,
        ..config("optimizer")
    });
    let full = run(TrainingConfig {
        deepspeed: Some(descriptor),
        ..config("full")
    });

    assert_eq!(resident.offload.gathered_bytes, 0);
    assert!(optimizer.offload.gathered_bytes > 0);
    assert!(full.offload.gathered_bytes > optimizer.offload.gathered_bytes);

    let load = |root: &str| {
        CheckpointManager::new(config(root).run_dir(), 0)
            .restore(&CheckpointRef::Latest)
            .unwrap()
            .snapshot
    };
    assert_eq!(load("resident"), load("optimizer"));
    assert_eq!(load("resident"), load("full"));
}

#[test]
fn test_micro_step_total_equals_window_times_steps() {
    let dir = tempfile::tempdir().unwrap();
    for (i, gas) in [1usize, 2, 5, 7].into_iter().enumerate() {
        let summary = run(TrainingConfig {
            gradient_accumulation_steps: gas,
            max_epochs: 3,
            ..base_config(&dir.path().join(format!("gas-{i}")))
        });
        assert_eq!(summary.total_micro_steps, gas as u64 * summary.global_step);
        assert_eq!(summary.global_step, (36 / gas) as u64);
        assert_eq!(summary.discarded_micro_steps, 36 % gas);
    }
}

#[test]
fn test_offload_capacity_aborts_naming_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = dir.path().join("ds_config.json");
    std::fs::write(
        &descriptor,
        r#"{"zero_optimization": {"offload_optimizer": {"device": "cpu", "max_in_cpu": 10}}}"#,
    )
    .unwrap();
    let err = TrainerBuilder::new(TrainingConfig {
        deepspeed: Some(descriptor),
        ..base_config(dir.path())
    })
    .build()
    .err()
    .unwrap();
    assert_eq!(err.component, Component::OffloadCoordinator);
    assert_eq!(err.global_step, 0);
    assert!(err.to_string().contains("offload coordinator"));
}

#[test]
fn test_no_full_batch_aborts_in_data_feed() {
    let dir = tempfile::tempdir().unwrap();
    let err = TrainerBuilder::new(TrainingConfig {
        dataset: "synthetic:3".into(),
        per_device_train_batch_size: 4,
        drop_last: true,
        ..base_config(dir.path())
    })
    .build()
    .err()
    .unwrap();
    assert_eq!(err.component, Component::DataFeed);
}

#[test]
fn test_repeated_checkpoint_failures_abort() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();
    let config = TrainingConfig {
        output_dir: blocker,
        save_steps: 1,
        max_consecutive_checkpoint_failures: 2,
        ..base_config(dir.path())
    };
    let err = TrainerBuilder::new(config).build().unwrap().run().unwrap_err();
    assert_eq!(err.component, Component::CheckpointManager);
    assert_eq!(err.global_step, 2);
}

#[test]
fn test_isolated_checkpoint_failures_are_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();
    let summary = run(TrainingConfig {
        output_dir: blocker,
        save_steps: 5,
        max_consecutive_checkpoint_failures: 3,
        ..base_config(dir.path())
    });
    assert_eq!(summary.global_step, 12);
    assert_eq!(summary.checkpoint_failures, 2);
    assert!(summary.saved_checkpoints.is_empty());
}

#[test]
fn test_metrics_failures_do_not_stop_training() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("runs-file");
    std::fs::write(&blocker, "x").unwrap();
    let memory = MemorySink::new();
    let summary = TrainerBuilder::new(TrainingConfig {
        logging_dir: blocker,
        ..base_config(dir.path())
    })
    .sink(memory.clone())
    .build()
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(summary.global_step, 12);
    assert!(summary.metrics_failures >= 12);
    assert_eq!(memory.series("loss").len(), 12);
}

#[test]
fn test_corrupt_checkpoint_is_fatal_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        save_steps: 4,
        ..base_config(dir.path())
    };
    run(config.clone());
    let model = config.run_dir().join("checkpoint-12").join("model.bin");
    let mut bytes = std::fs::read(&model).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&model, bytes).unwrap();

    let err = TrainerBuilder::new(TrainingConfig {
        resume_from_checkpoint: Some("checkpoint-12".into()),
        ..config
    })
    .build()
    .err()
    .unwrap();
    assert_eq!(err.component, Component::CheckpointManager);
}

#[test]
fn test_loss_decreases_on_repeated_data() {
    let dir = tempfile::tempdir().unwrap();
    let memory = MemorySink::new();
    TrainerBuilder::new(TrainingConfig {
        learning_rate: 5e-2,
        max_epochs: 5,
        lr_scheduler_type: tuneloop_core::config::LrSchedulerType::Constant,
        ..base_config(dir.path())
    })
    .sink(memory.clone())
    .build()
    .unwrap()
    .run()
    .unwrap();
    let losses = memory.series("loss");
    let head: f64 = losses[..6].iter().map(|(_, l)| l).sum();
    let tail: f64 = losses[losses.len() - 6..].iter().map(|(_, l)| l).sum();
    assert!(tail < head, "head={head} tail={tail}");
}
