//! Checkpoint management for training runs.
//!
//! Layout under the run directory:
//!
//! ```text
//! <output_dir>/<run_name>/
//!   checkpoint-200/
//!     model.bin        bincode parameters
//!     optimizer.bin    bincode optimizer state
//!     manifest.json    counters, seeds, payload digests (written last)
//! ```
//!
//! A checkpoint is assembled in a hidden staging directory and published with
//! a single rename, so `list`/`restore`/`prune` never observe a partial one.
//! Pruned or replaced checkpoints are renamed to hidden trash directories
//! before deletion for the same reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::data::epoch_seed;
use crate::error::CheckpointError;
use crate::offload::ModelSnapshot;
use crate::optim::OptimizerState;
use crate::persistence;
use crate::trainer::TrainingState;

/// Manifest format version.
pub const CHECKPOINT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const MODEL_FILE: &str = "model.bin";
const OPTIMIZER_FILE: &str = "optimizer.bin";
const DIR_PREFIX: &str = "checkpoint-";
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// A checkpoint is identified by the global step it captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    pub fn global_step(&self) -> u64 {
        self.0
    }

    /// Parse a directory name (`checkpoint-400`) or a bare step (`400`).
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        let digits = name.strip_prefix(DIR_PREFIX).unwrap_or(name);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(Self)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DIR_PREFIX}{}", self.0)
    }
}

/// Which checkpoint to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointRef {
    Latest,
    Named(String),
}

impl FromStr for CheckpointRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("latest") {
            Self::Latest
        } else {
            Self::Named(s.trim().to_string())
        })
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointRef::Latest => f.write_str("latest"),
            CheckpointRef::Named(name) => f.write_str(name),
        }
    }
}

/// A payload file and its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub id: CheckpointId,
    pub global_step: u64,
    pub epoch: usize,
    pub epoch_cursor: usize,
    pub total_micro_steps: u64,
    /// Run seed of the data feed.
    pub data_seed: u64,
    /// Permutation seed of `epoch`, derived from `data_seed`.
    pub epoch_seed: u64,
    pub created_at: DateTime<Utc>,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub shard_lengths: Vec<usize>,
    pub optimizer_slots: usize,
}

impl CheckpointManifest {
    pub fn state(&self) -> TrainingState {
        TrainingState {
            global_step: self.global_step,
            epoch: self.epoch,
            accumulated_micro_steps: 0,
            total_micro_steps: self.total_micro_steps,
            epoch_cursor: self.epoch_cursor,
            data_seed: self.data_seed,
        }
    }
}

/// A published checkpoint, as found by [`CheckpointManager::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub id: CheckpointId,
    pub path: PathBuf,
    pub manifest: CheckpointManifest,
}

/// State and tensors read back from a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredCheckpoint {
    pub id: CheckpointId,
    pub state: TrainingState,
    pub snapshot: ModelSnapshot,
}

/// Result of a resume attempt at process start.
#[derive(Debug)]
pub enum ResumeOutcome {
    Restored(Box<RestoredCheckpoint>),
    /// Nothing to restore; training starts fresh.
    Fresh { warning: CheckpointError },
}

/// Checkpoint manager for one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    run_dir: PathBuf,
    /// 0 retains every checkpoint.
    save_total_limit: usize,
}

impl CheckpointManager {
    pub fn new(run_dir: PathBuf, save_total_limit: usize) -> Self {
        Self {
            run_dir,
            save_total_limit,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn save_total_limit(&self) -> usize {
        self.save_total_limit
    }

    /// Persist `state` and `snapshot` as `checkpoint-<global_step>`, then prune.
    ///
    /// Refuses a state with an open accumulation window.
    pub fn save(
        &self,
        state: &TrainingState,
        snapshot: &ModelSnapshot,
    ) -> Result<CheckpointId, CheckpointError> {
        if !state.at_step_boundary() {
            return Err(CheckpointError::InconsistentState {
                accumulated: state.accumulated_micro_steps,
            });
        }
        let id = CheckpointId(state.global_step);
        let staging = self.run_dir.join(format!(
            "{STAGING_PREFIX}{id}-{}",
            uuid::Uuid::new_v4().simple()
        ));

        let published = self
            .write_staging(&staging, id, state, snapshot)
            .and_then(|()| self.publish(&staging, id));
        let replaced = match published {
            Ok(replaced) => replaced,
            Err(e) => {
                if staging.exists() {
                    if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                        tracing::warn!(dir = %staging.display(), error = %cleanup, "Failed to remove checkpoint staging directory");
                    }
                }
                return Err(CheckpointError::Write {
                    id: id.to_string(),
                    message: e.to_string(),
                });
            }
        };
        // The new checkpoint is in place; a leftover trash dir is swept on the next startup.
        if let Some(trash) = replaced {
            remove_replaced(&trash);
        }

        tracing::info!(checkpoint = %id, epoch = state.epoch, dir = %self.run_dir.display(), "Saved checkpoint");
        // The new checkpoint is already published; a failed prune only delays eviction.
        if let Err(e) = self.prune() {
            tracing::warn!(checkpoint = %id, error = %e, "Failed to prune old checkpoints");
        }
        Ok(id)
    }

    fn write_staging(
        &self,
        staging: &Path,
        id: CheckpointId,
        state: &TrainingState,
        snapshot: &ModelSnapshot,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(staging)?;
        let model = write_payload(staging, MODEL_FILE, &snapshot.params)?;
        let optimizer = write_payload(staging, OPTIMIZER_FILE, &snapshot.optimizer)?;
        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            id,
            global_step: state.global_step,
            epoch: state.epoch,
            epoch_cursor: state.epoch_cursor,
            total_micro_steps: state.total_micro_steps,
            data_seed: state.data_seed,
            epoch_seed: epoch_seed(state.data_seed, state.epoch),
            created_at: Utc::now(),
            model,
            optimizer,
            shard_lengths: snapshot.params.iter().map(Vec::len).collect(),
            optimizer_slots: snapshot.optimizer.slots(),
        };
        persistence::atomic_write_json(&staging.join(MANIFEST_FILE), &manifest)
    }

    /// Move `staging` into place as `id`. Returns where a replaced checkpoint was moved.
    fn publish(&self, staging: &Path, id: CheckpointId) -> std::io::Result<Option<PathBuf>> {
        let target = self.run_dir.join(id.to_string());
        let replaced = if target.exists() {
            let trash = self.trash_path(id);
            std::fs::rename(&target, &trash)?;
            Some(trash)
        } else {
            None
        };
        if let Err(e) = std::fs::rename(staging, &target) {
            if let Some(trash) = &replaced {
                if let Err(restore) = std::fs::rename(trash, &target) {
                    tracing::warn!(checkpoint = %id, error = %restore, "Failed to put back the replaced checkpoint");
                }
            }
            return Err(e);
        }
        Ok(replaced)
    }

    fn trash_path(&self, id: CheckpointId) -> PathBuf {
        self.run_dir.join(format!(
            "{TRASH_PREFIX}{id}-{}",
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Published checkpoints, oldest (lowest step) first.
    ///
    /// Hidden directories and directories without a readable manifest are skipped.
    pub fn list(&self) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        if !self.run_dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.run_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(DIR_PREFIX) || !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = CheckpointId::parse(name) else {
                continue;
            };
            let path = entry.path();
            match persistence::load_json::<CheckpointManifest>(&path.join(MANIFEST_FILE)) {
                Ok(Some(manifest)) if manifest.id == id => found.push(CheckpointInfo {
                    id,
                    path,
                    manifest,
                }),
                Ok(_) => tracing::debug!(dir = %path.display(), "Skipping directory without a matching manifest"),
                Err(e) => tracing::warn!(dir = %path.display(), error = %e, "Skipping unreadable checkpoint manifest"),
            }
        }
        found.sort_by_key(|info| info.id);
        Ok(found)
    }

    pub fn latest(&self) -> Result<Option<CheckpointInfo>, CheckpointError> {
        Ok(self.list()?.pop())
    }

    /// Delete the oldest checkpoints beyond `save_total_limit`. Returns what was removed.
    pub fn prune(&self) -> Result<Vec<CheckpointId>, CheckpointError> {
        if self.save_total_limit == 0 {
            return Ok(Vec::new());
        }
        let checkpoints = self.list()?;
        let excess = checkpoints.len().saturating_sub(self.save_total_limit);
        let mut removed = Vec::with_capacity(excess);
        for info in checkpoints.into_iter().take(excess) {
            let trash = self.trash_path(info.id);
            std::fs::rename(&info.path, &trash)?;
            std::fs::remove_dir_all(&trash)?;
            tracing::info!(checkpoint = %info.id, limit = self.save_total_limit, "Pruned checkpoint");
            removed.push(info.id);
        }
        Ok(removed)
    }

    /// Remove staging and trash directories left behind by an interrupted process.
    pub fn sweep_stale(&self) -> Result<usize, CheckpointError> {
        if !self.run_dir.exists() {
            return Ok(0);
        }
        let mut swept = 0;
        for entry in std::fs::read_dir(&self.run_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let stale = name
                .to_str()
                .is_some_and(|n| n.starts_with(STAGING_PREFIX) || n.starts_with(TRASH_PREFIX));
            if stale && entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!(swept, dir = %self.run_dir.display(), "Removed stale checkpoint directories");
        }
        Ok(swept)
    }

    fn resolve(&self, reference: &CheckpointRef) -> Result<CheckpointInfo, CheckpointError> {
        match reference {
            CheckpointRef::Latest => self.latest()?.ok_or_else(|| CheckpointError::NotFound {
                id: format!("latest (no checkpoints in {})", self.run_dir.display()),
            }),
            CheckpointRef::Named(name) => {
                let not_found = || CheckpointError::NotFound { id: name.clone() };
                let id = CheckpointId::parse(name).ok_or_else(not_found)?;
                self.list()?
                    .into_iter()
                    .find(|info| info.id == id)
                    .ok_or_else(not_found)
            }
        }
    }

    /// Read a checkpoint back, verifying payload digests.
    pub fn restore(&self, reference: &CheckpointRef) -> Result<RestoredCheckpoint, CheckpointError> {
        let info = self.resolve(reference)?;
        let id = info.id;
        let manifest = &info.manifest;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Incompatible {
                id: id.to_string(),
                message: format!(
                    "manifest version {} (expected {CHECKPOINT_VERSION})",
                    manifest.version
                ),
            });
        }

        let params: Vec<Vec<f32>> = read_payload(&info.path, id, &manifest.model)?;
        let optimizer: OptimizerState = read_payload(&info.path, id, &manifest.optimizer)?;
        let lengths: Vec<usize> = params.iter().map(Vec::len).collect();
        if lengths != manifest.shard_lengths || optimizer.shards.len() != params.len() {
            return Err(CheckpointError::Corrupt {
                id: id.to_string(),
                message: "payload shapes disagree with the manifest".into(),
            });
        }

        tracing::info!(checkpoint = %id, global_step = manifest.global_step, epoch = manifest.epoch, "Restored checkpoint");
        Ok(RestoredCheckpoint {
            id,
            state: manifest.state(),
            snapshot: ModelSnapshot { params, optimizer },
        })
    }

    /// Restore for a resume at process start.
    ///
    /// A missing checkpoint is not fatal: it yields [`ResumeOutcome::Fresh`]
    /// carrying the `NotFound` error as a warning. Any other failure is returned.
    pub fn resume(&self, reference: &CheckpointRef) -> Result<ResumeOutcome, CheckpointError> {
        match self.restore(reference) {
            Ok(restored) => Ok(ResumeOutcome::Restored(Box::new(restored))),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(checkpoint = %reference, error = %e, "Checkpoint not found, training from scratch");
                Ok(ResumeOutcome::Fresh { warning: e })
            }
            Err(e) => Err(e),
        }
    }
}

fn write_payload<T: Serialize>(dir: &Path, filename: &str, value: &T) -> std::io::Result<FileRecord> {
    let path = dir.join(filename);
    let bytes = persistence::write_bincode(&path, value)?;
    Ok(FileRecord {
        filename: filename.to_string(),
        sha256: persistence::file_sha256(&path)?,
        bytes,
    })
}

fn read_payload<T: serde::de::DeserializeOwned>(
    dir: &Path,
    id: CheckpointId,
    record: &FileRecord,
) -> Result<T, CheckpointError> {
    let corrupt = |message: String| CheckpointError::Corrupt {
        id: id.to_string(),
        message,
    };
    let path = dir.join(&record.filename);
    let digest = persistence::file_sha256(&path)
        .map_err(|e| corrupt(format!("{}: {e}", record.filename)))?;
    if digest != record.sha256 {
        return Err(corrupt(format!("{} digest mismatch", record.filename)));
    }
    persistence::read_bincode(&path).map_err(|e| corrupt(format!("{}: {e}", record.filename)))
}

/// Delete a replaced checkpoint's directory. Returns whether it is gone.
fn remove_replaced(trash: &Path) -> bool {
    match std::fs::remove_dir_all(trash) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(dir = %trash.display(), error = %e, "Failed to remove replaced checkpoint; leaving it for the next sweep");
            false
        }
    }
}
