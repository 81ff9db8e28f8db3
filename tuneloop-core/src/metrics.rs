//! Step-level metric emission.
//!
//! Metrics are best-effort: a sink that fails is logged and skipped, and the
//! failure never reaches the training loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::TrainingConfig;
use crate::error::MetricsError;

/// One scalar observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub timestamp: DateTime<Utc>,
    pub step: u64,
    pub name: String,
    pub value: f64,
}

/// Destination for emitted metrics.
pub trait MetricsSink: Send {
    fn name(&self) -> &str;

    fn deliver(&mut self, metrics: &[Metric]) -> Result<(), MetricsError>;

    fn flush(&mut self) -> Result<(), MetricsError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    project: &'a str,
    run: &'a str,
    #[serde(flatten)]
    metric: &'a Metric,
}

/// Appends one JSON object per metric to `<logging_dir>/<project>/<run>.jsonl`.
///
/// The file is opened on first delivery; a failed open is retried on the next one.
pub struct JsonlSink {
    path: PathBuf,
    project: String,
    run: String,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(path: PathBuf, project: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            path,
            project: project.into(),
            run: run.into(),
            writer: None,
        }
    }

    /// Sink at the run's configured metrics path.
    pub fn for_run(config: &TrainingConfig) -> Self {
        Self::new(
            config.metrics_path(),
            config.wandb_project.clone(),
            config.run_name.clone(),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, message: impl ToString) -> MetricsError {
        MetricsError::Delivery {
            sink: "jsonl".into(),
            message: format!("{}: {}", self.path.display(), message.to_string()),
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, MetricsError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| self.error(e))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .map_err(|e| self.error(e))?;
                BufWriter::new(file)
            }
        };
        Ok(self.writer.insert(writer))
    }
}

impl MetricsSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn deliver(&mut self, metrics: &[Metric]) -> Result<(), MetricsError> {
        let mut lines = String::new();
        for metric in metrics {
            let record = JsonlRecord {
                project: &self.project,
                run: &self.run,
                metric,
            };
            lines.push_str(&serde_json::to_string(&record).map_err(|e| self.error(e))?);
            lines.push('\n');
        }
        let path = self.path.display().to_string();
        let writer = self.writer()?;
        writer
            .write_all(lines.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|e| MetricsError::Delivery {
                sink: "jsonl".into(),
                message: format!("{path}: {e}"),
            })
    }

    fn flush(&mut self) -> Result<(), MetricsError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer.flush().map_err(|e| MetricsError::Delivery {
            sink: "jsonl".into(),
            message: e.to_string(),
        })
    }
}

/// Logs each metric as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn deliver(&mut self, metrics: &[Metric]) -> Result<(), MetricsError> {
        for m in metrics {
            tracing::info!(target: "tuneloop::metrics", step = m.step, name = %m.name, value = m.value, "metric");
        }
        Ok(())
    }
}

/// Keeps every delivered metric in memory; clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Metric>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Metric> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Values recorded under `name`, as `(step, value)` pairs in delivery order.
    pub fn series(&self, name: &str) -> Vec<(u64, f64)> {
        self.records()
            .into_iter()
            .filter(|m| m.name == name)
            .map(|m| (m.step, m.value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn deliver(&mut self, metrics: &[Metric]) -> Result<(), MetricsError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(metrics);
        Ok(())
    }
}

/// Fans metrics out to every sink, swallowing delivery failures.
pub struct MetricsReporter {
    sinks: Vec<Box<dyn MetricsSink>>,
    failures: u64,
}

impl MetricsReporter {
    pub fn new(sinks: Vec<Box<dyn MetricsSink>>) -> Self {
        Self { sinks, failures: 0 }
    }

    /// JSONL file sink plus tracing sink for `config`'s run.
    pub fn for_run(config: &TrainingConfig) -> Self {
        Self::new(vec![
            Box::new(JsonlSink::for_run(config)),
            Box::new(TracingSink),
        ])
    }

    pub fn add_sink(&mut self, sink: Box<dyn MetricsSink>) {
        self.sinks.push(sink);
    }

    /// Failed deliveries so far, counted per sink per call.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn emit(&mut self, step: u64, values: &[(&str, f64)]) {
        if values.is_empty() {
            return;
        }
        let timestamp = Utc::now();
        let metrics: Vec<Metric> = values
            .iter()
            .map(|(name, value)| Metric {
                timestamp,
                step,
                name: (*name).to_string(),
                value: *value,
            })
            .collect();
        for sink in &mut self.sinks {
            if let Err(e) = sink.deliver(&metrics) {
                self.failures += 1;
                tracing::warn!(sink = sink.name(), step, error = %e, "Metrics delivery failed");
            }
        }
    }

    pub fn flush(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                self.failures += 1;
                tracing::warn!(sink = sink.name(), error = %e, "Metrics flush failed");
            }
        }
    }
}
