//! Slow memory tiers: host memory and a disk-backed swap directory.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::OffloadError;
use crate::persistence;

/// What a staged buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKind {
    Param,
    /// Optimizer state slot `n` (e.g. Adam's first or second moment).
    Optimizer(usize),
}

/// Address of one buffer on a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub kind: SlotKind,
    pub shard: usize,
}

impl SlotKey {
    pub fn param(shard: usize) -> Self {
        Self {
            kind: SlotKind::Param,
            shard,
        }
    }

    pub fn optimizer(slot: usize, shard: usize) -> Self {
        Self {
            kind: SlotKind::Optimizer(slot),
            shard,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SlotKind::Param => write!(f, "param/{}", self.shard),
            SlotKind::Optimizer(slot) => write!(f, "optim.{slot}/{}", self.shard),
        }
    }
}

fn buffer_bytes(data: &[f32]) -> u64 {
    (data.len() * std::mem::size_of::<f32>()) as u64
}

/// Storage that staged shards are evicted to between uses.
///
/// `store` overwrites any previous buffer under the same key; `load` returns a
/// copy and leaves the stored buffer in place.
pub trait SlowTier: Send {
    fn name(&self) -> &str;

    fn store(&mut self, key: SlotKey, data: &[f32]) -> Result<(), OffloadError>;

    fn load(&self, key: SlotKey) -> Result<Vec<f32>, OffloadError>;

    fn used_bytes(&self) -> u64;

    /// `None` when unbounded.
    fn capacity_bytes(&self) -> Option<u64>;
}

fn check_capacity(
    tier: &str,
    key: SlotKey,
    used: u64,
    replaced: u64,
    needed: u64,
    capacity: Option<u64>,
) -> Result<(), OffloadError> {
    if let Some(capacity) = capacity {
        let available = capacity.saturating_sub(used - replaced);
        if needed > available {
            return Err(OffloadError::Capacity {
                tier: tier.to_string(),
                key: key.to_string(),
                needed_bytes: needed,
                available_bytes: available,
            });
        }
    }
    Ok(())
}

/// Host (CPU) memory.
#[derive(Debug, Default)]
pub struct HostTier {
    capacity: Option<u64>,
    buffers: HashMap<SlotKey, Vec<f32>>,
    used: u64,
}

impl HostTier {
    pub fn new(capacity: Option<u64>) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }
}

impl SlowTier for HostTier {
    fn name(&self) -> &str {
        "host"
    }

    fn store(&mut self, key: SlotKey, data: &[f32]) -> Result<(), OffloadError> {
        let needed = buffer_bytes(data);
        let replaced = self.buffers.get(&key).map_or(0, |b| buffer_bytes(b));
        check_capacity(self.name(), key, self.used, replaced, needed, self.capacity)?;
        self.buffers.insert(key, data.to_vec());
        self.used = self.used - replaced + needed;
        Ok(())
    }

    fn load(&self, key: SlotKey) -> Result<Vec<f32>, OffloadError> {
        self.buffers
            .get(&key)
            .cloned()
            .ok_or_else(|| OffloadError::MissingShard {
                key: key.to_string(),
            })
    }

    fn used_bytes(&self) -> u64 {
        self.used
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

/// NVMe-style swap: one bincode file per buffer in a private directory.
///
/// The directory is created under the configured root and removed on drop.
#[derive(Debug)]
pub struct DiskTier {
    dir: PathBuf,
    capacity: Option<u64>,
    sizes: HashMap<SlotKey, u64>,
    used: u64,
}

impl DiskTier {
    pub fn new(root: &Path, capacity: Option<u64>) -> Result<Self, OffloadError> {
        let dir = root.join(format!("tuneloop-swap-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).map_err(|e| OffloadError::Transfer {
            tier: "disk".into(),
            key: dir.display().to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!(dir = %dir.display(), "Created disk offload tier");
        Ok(Self {
            dir,
            capacity,
            sizes: HashMap::new(),
            used: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: SlotKey) -> PathBuf {
        let stem = match key.kind {
            SlotKind::Param => format!("param-{}", key.shard),
            SlotKind::Optimizer(slot) => format!("optim{slot}-{}", key.shard),
        };
        self.dir.join(format!("{stem}.bin"))
    }

    fn transfer_error(&self, key: SlotKey, err: io::Error) -> OffloadError {
        OffloadError::Transfer {
            tier: self.name().to_string(),
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

impl SlowTier for DiskTier {
    fn name(&self) -> &str {
        "disk"
    }

    fn store(&mut self, key: SlotKey, data: &[f32]) -> Result<(), OffloadError> {
        let needed = buffer_bytes(data);
        let replaced = self.sizes.get(&key).copied().unwrap_or(0);
        check_capacity(self.name(), key, self.used, replaced, needed, self.capacity)?;
        match persistence::write_bincode(&self.path_for(key), &data) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::StorageFull => {
                return Err(OffloadError::Capacity {
                    tier: self.name().to_string(),
                    key: key.to_string(),
                    needed_bytes: needed,
                    available_bytes: 0,
                });
            }
            Err(e) => return Err(self.transfer_error(key, e)),
        }
        self.sizes.insert(key, needed);
        self.used = self.used - replaced + needed;
        Ok(())
    }

    fn load(&self, key: SlotKey) -> Result<Vec<f32>, OffloadError> {
        if !self.sizes.contains_key(&key) {
            return Err(OffloadError::MissingShard {
                key: key.to_string(),
            });
        }
        persistence::read_bincode(&self.path_for(key)).map_err(|e| self.transfer_error(key, e))
    }

    fn used_bytes(&self) -> u64 {
        self.used
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

impl Drop for DiskTier {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to remove disk offload tier");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_key_display() {
        assert_eq!(SlotKey::param(3).to_string(), "param/3");
        assert_eq!(SlotKey::optimizer(1, 0).to_string(), "optim.1/0");
    }

    #[test]
    fn test_host_tier_store_load_overwrite() {
        let mut tier = HostTier::new(None);
        tier.store(SlotKey::param(0), &[1.0, 2.0]).unwrap();
        assert_eq!(tier.used_bytes(), 8);
        tier.store(SlotKey::param(0), &[3.0, 4.0, 5.0]).unwrap();
        assert_eq!(tier.used_bytes(), 12);
        assert_eq!(tier.load(SlotKey::param(0)).unwrap(), vec![3.0, 4.0, 5.0]);
        assert!(matches!(
            tier.load(SlotKey::param(1)),
            Err(OffloadError::MissingShard { .. })
        ));
    }

    #[test]
    fn test_host_tier_capacity() {
        let mut tier = HostTier::new(Some(16));
        tier.store(SlotKey::param(0), &[0.0; 3]).unwrap();
        // Replacing a buffer only needs the difference.
        tier.store(SlotKey::param(0), &[0.0; 4]).unwrap();
        let err = tier.store(SlotKey::param(1), &[0.0; 1]).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::Capacity {
                needed_bytes: 4,
                available_bytes: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_disk_tier_round_trip_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let dir;
        {
            let mut tier = DiskTier::new(root.path(), None).unwrap();
            dir = tier.dir().to_path_buf();
            tier.store(SlotKey::optimizer(0, 2), &[0.25, -1.5]).unwrap();
            assert_eq!(
                tier.load(SlotKey::optimizer(0, 2)).unwrap(),
                vec![0.25, -1.5]
            );
            assert_eq!(tier.used_bytes(), 8);
            assert!(dir.exists());
        }
        assert!(!dir.exists());
    }

    #[test]
    fn test_disk_tier_capacity() {
        let root = tempfile::tempdir().unwrap();
        let mut tier = DiskTier::new(root.path(), Some(4)).unwrap();
        assert!(matches!(
            tier.store(SlotKey::param(0), &[1.0, 2.0]),
            Err(OffloadError::Capacity { .. })
        ));
    }
}
