//! CLI subcommand handlers.

use std::future::Future;
use tokio::task::{JoinError, JoinHandle};
use tuneloop_core::{CheckpointManager, StopSignal, TrainerBuilder, TrainingConfig};

/// Exit status after a forced interrupt (128 + SIGINT).
const FORCED_EXIT_CODE: i32 = 130;

/// How a supervised training task ended.
enum Supervised<T> {
    Joined(T),
    /// A second interrupt arrived before the task reached a step boundary.
    Forced,
}

/// Wait for `task`; the first interrupt requests a stop, the second gives up on the task.
async fn supervise<T, F, Fut>(
    mut task: JoinHandle<T>,
    stop: &StopSignal,
    mut interrupt: F,
) -> Result<Supervised<T>, JoinError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        joined = &mut task => return joined.map(Supervised::Joined),
        Ok(()) = interrupt() => {
            tracing::warn!("Interrupt received; stopping at the next step boundary (Ctrl-C again to force)");
            stop.request();
        }
    }
    tokio::select! {
        joined = &mut task => joined.map(Supervised::Joined),
        Ok(()) = interrupt() => Ok(Supervised::Forced),
    }
}

/// Run training on a blocking thread; Ctrl-C requests a stop at the next step boundary.
pub async fn handle_train(config: TrainingConfig) -> anyhow::Result<()> {
    let stop = StopSignal::new();
    let builder = TrainerBuilder::new(config).stop_signal(stop.clone());
    let task = tokio::task::spawn_blocking(move || builder.build()?.run());

    let summary = match supervise(task, &stop, tokio::signal::ctrl_c).await? {
        Supervised::Joined(outcome) => outcome?,
        Supervised::Forced => {
            // Returning would drop the runtime, which waits for the blocking task.
            tracing::error!("Second interrupt; exiting without reaching a step boundary");
            eprintln!("Training interrupted before reaching a step boundary");
            std::process::exit(FORCED_EXIT_CODE);
        }
    };

    if let Some(warning) = &summary.resume_warning {
        println!("Resume skipped: {warning}");
    }
    if let Some(id) = summary.restored_from {
        println!("Resumed from {id}");
    }
    println!(
        "{} run '{}': global_step={} epochs={} micro_steps={} (discarded {})",
        if summary.stopped_early { "Stopped" } else { "Finished" },
        summary.run_name,
        summary.global_step,
        summary.epochs_completed,
        summary.total_micro_steps,
        summary.discarded_micro_steps,
    );
    if let Some(loss) = summary.last_loss {
        println!("  last loss: {loss:.4}");
    }
    if let Some(loss) = summary.last_eval_loss {
        println!("  last eval loss: {loss:.4}");
    }
    if !summary.retained_checkpoints.is_empty() {
        let ids: Vec<String> = summary
            .retained_checkpoints
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("  checkpoints: {}", ids.join(", "));
    }
    if summary.checkpoint_failures > 0 || summary.metrics_failures > 0 {
        println!(
            "  failures: {} checkpoint, {} metrics",
            summary.checkpoint_failures, summary.metrics_failures
        );
    }
    Ok(())
}

pub fn handle_checkpoints(config: &TrainingConfig, json: bool) -> anyhow::Result<()> {
    let manager = CheckpointManager::new(config.run_dir(), config.save_total_limit);
    let checkpoints = manager.list()?;

    if json {
        let manifests: Vec<_> = checkpoints.iter().map(|info| &info.manifest).collect();
        println!("{}", serde_json::to_string_pretty(&manifests)?);
        return Ok(());
    }
    if checkpoints.is_empty() {
        println!("No checkpoints in {}", manager.run_dir().display());
        return Ok(());
    }
    println!("Checkpoints in {}:", manager.run_dir().display());
    for info in &checkpoints {
        let m = &info.manifest;
        println!(
            "  {:<20} epoch={:<4} micro_steps={:<8} saved={}",
            info.id.to_string(),
            m.epoch,
            m.total_micro_steps,
            m.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn handle_config(config: &TrainingConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> TrainingConfig {
        TrainingConfig {
            model_name_or_path: "builtin:unigram".into(),
            dataset: "synthetic:16".into(),
            max_length: 32,
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 2,
            max_epochs: 1,
            save_steps: 2,
            save_total_limit: 1,
            logging_steps: 1,
            output_dir: dir.path().join("output"),
            logging_dir: dir.path().join("runs"),
            run_name: "cli-run".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_checkpoints_on_empty_run() {
        let dir = TempDir::new().unwrap();
        assert!(handle_checkpoints(&config(&dir), false).is_ok());
        assert!(handle_checkpoints(&config(&dir), true).is_ok());
    }

    #[tokio::test]
    async fn test_train_then_list_checkpoints() {
        let dir = TempDir::new().unwrap();
        handle_train(config(&dir)).await.unwrap();

        let manager = CheckpointManager::new(config(&dir).run_dir(), 1);
        let ids: Vec<String> = manager
            .list()
            .unwrap()
            .iter()
            .map(|info| info.id.to_string())
            .collect();
        assert_eq!(ids, vec!["checkpoint-4".to_string()]);
        assert!(handle_checkpoints(&config(&dir), true).is_ok());
    }

    #[test]
    fn test_config_prints() {
        let dir = TempDir::new().unwrap();
        assert!(handle_config(&config(&dir)).is_ok());
    }

    #[tokio::test]
    async fn test_second_interrupt_does_not_wait_for_training() {
        let stop = StopSignal::new();
        let task = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(1500)));
        let started = Instant::now();

        let outcome = supervise(task, &stop, || async { Ok::<(), std::io::Error>(()) }).await.unwrap();
        assert!(matches!(outcome, Supervised::Forced));
        assert!(stop.is_requested());
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_first_interrupt_lets_training_reach_boundary() {
        let stop = StopSignal::new();
        let worker = stop.clone();
        let task = tokio::task::spawn_blocking(move || {
            while !worker.is_requested() {
                std::thread::sleep(Duration::from_millis(5));
            }
            7
        });

        let mut interrupts = 0;
        let outcome = supervise(task, &stop, move || {
            interrupts += 1;
            let first = interrupts == 1;
            async move {
                if first {
                    Ok::<(), std::io::Error>(())
                } else {
                    std::future::pending().await
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(outcome, Supervised::Joined(7)));
    }
}
