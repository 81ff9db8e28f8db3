//! Tuneloop CLI: runs and inspects fine-tuning jobs.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use tuneloop_core::ConfigOverrides;

/// Tuneloop: memory-aware fine-tuning loop orchestrator
#[derive(Parser, Debug)]
#[command(name = "tuneloop", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (.toml, .json, .yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override output_dir
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Override run_name
    #[arg(long, global = true)]
    run_name: Option<String>,

    /// Override logging_dir
    #[arg(long, global = true)]
    logging_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run (or resume) training
    Train {
        /// Checkpoint to resume from: `latest` or a checkpoint id
        #[arg(short, long)]
        resume: Option<String>,

        /// Override max_epochs
        #[arg(long)]
        max_epochs: Option<usize>,
    },
    /// List retained checkpoints of the configured run
    Checkpoints {
        /// Print manifests as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate and print the resolved configuration
    Config,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let (resume, max_epochs) = match &self.command {
            Commands::Train { resume, max_epochs } => (resume.clone(), *max_epochs),
            _ => (None, None),
        };
        ConfigOverrides {
            output_dir: self.output_dir.clone(),
            run_name: self.run_name.clone(),
            logging_dir: self.logging_dir.clone(),
            max_epochs,
            resume_from_checkpoint: resume,
        }
    }
}

/// Human-readable stderr layer plus a daily JSON log under `log_dir`.
fn init_tracing(verbose: u8, quiet: bool, log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = if std::fs::create_dir_all(log_dir).is_ok() {
        log_dir.to_path_buf()
    } else {
        directories::ProjectDirs::from("dev", "tuneloop", "tuneloop")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("."))
    };
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tuneloop.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let overrides = cli.overrides();
    let config = tuneloop_core::load_config(cli.config.as_deref(), Some(&overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let _guard = init_tracing(cli.verbose, cli.quiet, &config.logging_dir);
    tracing::debug!(config = ?cli.config, run = %config.run_name, "Loaded configuration");

    match cli.command {
        Commands::Train { .. } => commands::handle_train(config).await,
        Commands::Checkpoints { json } => commands::handle_checkpoints(&config, json),
        Commands::Config => commands::handle_config(&config),
    }
}
