//! Partition registry
//!
//! Maps partition names to directories under `partitions/` and hands out
//! per-partition reader/writer leases. Existence is always checked while the
//! partition lock is held so a lease can never outlive a concurrent delete.

use crate::named_lock::{NamedLockGuard, NamedLockRegistry};
use crate::safe_io::delete_all_safely;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tessera_common::{Error, PartitionName, Result, SyncMode};
use tracing::{info, warn};

/// Held partition lock plus the resolved partition directory
///
/// Dropping the lease unlocks the partition.
#[derive(Debug)]
pub struct PartitionLease {
    name: PartitionName,
    dir: PathBuf,
    guard: NamedLockGuard,
}

impl PartitionLease {
    pub fn name(&self) -> &PartitionName {
        &self.name
    }

    /// Partition directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// On-disk directory name, also the cache partition key
    pub fn dir_name(&self) -> String {
        self.name.dir_name()
    }

    /// Whether the partition is held exclusively
    pub fn is_exclusive(&self) -> bool {
        self.guard.is_write()
    }
}

pub struct PartitionRegistry {
    root: PathBuf,
    locks: NamedLockRegistry,
    sync: SyncMode,
}

impl PartitionRegistry {
    /// Registry over the `partitions/` directory at `root`
    pub fn new(root: impl Into<PathBuf>, sync: SyncMode) -> Self {
        Self {
            root: root.into(),
            locks: NamedLockRegistry::new(),
            sync,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &PartitionName) -> PathBuf {
        self.root.join(name.dir_name())
    }

    pub fn create(&self, name: &PartitionName) -> Result<()> {
        let _guard = self.locks.write(name.as_str());
        match fs::create_dir(self.path(name)) {
            Ok(()) => {
                info!("Created partition {}", name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::PartitionAlreadyExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a partition; `on_deleted` runs before the lock is released
    pub fn delete(&self, name: &PartitionName, on_deleted: impl FnOnce()) -> Result<()> {
        let _guard = self.locks.write(name.as_str());
        let path = self.path(name);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(Error::PartitionNotFound(name.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::PartitionNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        delete_all_safely(&path, self.sync)?;
        on_deleted();
        info!("Deleted partition {}", name);
        Ok(())
    }

    /// Lock a partition shared or exclusive and verify it exists
    pub fn use_partition(&self, name: &PartitionName, exclusive: bool) -> Result<PartitionLease> {
        let guard = if exclusive {
            self.locks.write(name.as_str())
        } else {
            self.locks.read(name.as_str())
        };

        let dir = self.path(name);
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => Ok(PartitionLease {
                name: name.clone(),
                dir,
                guard,
            }),
            Ok(_) => Err(Error::PartitionNotFound(name.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::PartitionNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All partitions, sorted by name
    pub fn partitions(&self) -> Result<Vec<PartitionName>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(dir_name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!("Skipping non UTF-8 partition directory {:?}", entry.path());
                continue;
            };
            match PartitionName::from_dir_name(&dir_name) {
                Ok(name) => names.push(name),
                Err(e) => warn!("Skipping partition directory {}: {}", dir_name, e),
            }
        }
        names.sort();
        Ok(names)
    }
}
