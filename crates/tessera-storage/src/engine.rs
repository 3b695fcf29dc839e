//! Engine
//!
//! Owns everything shared between sessions of one data directory: the
//! partition registry, the named lock table, the cache middleware and the
//! decoded record caches. Opening an engine locks the data directory and runs
//! recovery before any session can be created.

use crate::cache::{CacheMiddleware, CacheStats};
use crate::credentials::{CredentialStore, Credentials, Permissions};
use crate::middleware::{FileMiddleware, FileStore, NoCache};
use crate::named_lock::NamedLockRegistry;
use crate::partition::PartitionRegistry;
use crate::records::RecordCache;
use crate::recovery::{RecoveryReport, recover};
use crate::session::Session;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tessera_common::{EngineConfig, Error, PARTITIONS_DIR, PartitionName, Result};
use tracing::{error, info};

/// Advisory lock file at the data directory root
pub const LOCK_FILE: &str = "lock";

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) partitions: PartitionRegistry,
    pub(crate) named_locks: NamedLockRegistry,
    pub(crate) files: FileStore,
    pub(crate) records: RecordCache,
    pub(crate) credentials: CredentialStore,
    cache: Option<Arc<CacheMiddleware>>,
    recovery: RecoveryReport,
    // Held for the lifetime of the engine; closing it releases the lock
    _dir_lock: File,
}

impl EngineInner {
    /// Report a fatal error, aborting the process if configured to
    pub(crate) fn escalate(&self, err: Error) -> Error {
        if err.is_fatal() {
            error!("Fatal storage error: {}", err);
            if self.config.abort_on_fatal {
                std::process::abort();
            }
        }
        err
    }
}

/// Handle to an open data directory
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the data directory described by `config`
    ///
    /// Fails with [`Error::DataDirLocked`] if another engine has it open and
    /// with [`Error::RecoveryFailed`] if leftover transactions cannot be
    /// resolved.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let partitions_dir = config.data_dir.join(PARTITIONS_DIR);
        fs::create_dir_all(&partitions_dir)?;

        let dir_lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(config.data_dir.join(LOCK_FILE))?;
        FileExt::try_lock_exclusive(&dir_lock)
            .map_err(|_| Error::DataDirLocked(config.data_dir.display().to_string()))?;

        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(CacheMiddleware::new(config.cache.clone())));
        let middleware: Arc<dyn FileMiddleware> = match &cache {
            Some(cache) => Arc::clone(cache) as Arc<dyn FileMiddleware>,
            None => Arc::new(NoCache),
        };
        let files = FileStore::new(middleware, config.cache.ttl(), config.sync);

        let recovery = recover(&partitions_dir, &files).inspect_err(|e| {
            error!("Refusing to open {:?}: {}", config.data_dir, e);
        })?;

        info!(
            "Opened data directory {:?} (recovery: {} discarded, {} replayed, {} repaired)",
            config.data_dir, recovery.discarded, recovery.replayed, recovery.repaired
        );
        if config.cache.enabled {
            info!(
                "File cache enabled: {} bytes, ttl {}s",
                config.cache.max_bytes, config.cache.ttl_secs
            );
        }

        let record_ttl = config.record_cache_ttl();
        let inner = EngineInner {
            partitions: PartitionRegistry::new(partitions_dir, config.sync),
            named_locks: NamedLockRegistry::new(),
            records: RecordCache::new(record_ttl),
            credentials: CredentialStore::new(files.clone(), record_ttl),
            files,
            cache,
            recovery,
            config,
            _dir_lock: dir_lock,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.config.data_dir
    }

    /// What recovery did when this engine was opened
    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovery
    }

    /// File cache counters, if the cache is enabled
    pub fn cache_stats(&self) -> Option<&CacheStats> {
        self.inner.cache.as_deref().map(CacheMiddleware::stats)
    }

    /// The file cache, if enabled
    pub fn cache(&self) -> Option<&CacheMiddleware> {
        self.inner.cache.as_deref()
    }

    pub fn create_partition(&self, name: &str) -> Result<()> {
        self.inner.partitions.create(&PartitionName::new(name))
    }

    /// Remove a partition and everything cached for it
    pub fn delete_partition(&self, name: &str) -> Result<()> {
        let name = PartitionName::new(name);
        let key = name.dir_name();
        let inner = &self.inner;
        inner.partitions.delete(&name, || {
            inner.records.invalidate(&key);
            inner.credentials.invalidate(&key);
            inner.files.forget_partition(&key);
        })
    }

    /// Partition names, sorted
    pub fn partitions(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .partitions
            .partitions()?
            .into_iter()
            .map(|name| name.to_string())
            .collect())
    }

    /// Session sharing the partition with other data sessions
    pub fn create_session(&self, partition: &str) -> Result<Session> {
        let lease = self
            .inner
            .partitions
            .use_partition(&PartitionName::new(partition), false)?;
        Ok(Session::new(Arc::clone(&self.inner), lease, false))
    }

    /// Session holding the partition exclusively; may change records
    pub fn create_schema_write_session(&self, partition: &str) -> Result<Session> {
        let lease = self
            .inner
            .partitions
            .use_partition(&PartitionName::new(partition), true)?;
        Ok(Session::new(Arc::clone(&self.inner), lease, true))
    }

    // Credentials

    fn read_credentials<T>(
        &self,
        partition: &str,
        f: impl FnOnce(&Credentials) -> Result<T>,
    ) -> Result<T> {
        let lease = self
            .inner
            .partitions
            .use_partition(&PartitionName::new(partition), false)?;
        let credentials = self.inner.credentials.load(&lease)?;
        f(&credentials)
    }

    fn update_credentials(
        &self,
        partition: &str,
        f: impl FnOnce(&mut Credentials) -> Result<()>,
    ) -> Result<()> {
        let lease = self
            .inner
            .partitions
            .use_partition(&PartitionName::new(partition), true)?;
        let mut credentials = (*self.inner.credentials.load(&lease)?).clone();
        f(&mut credentials)?;
        self.inner.credentials.store(&lease, credentials)
    }

    /// Owner and permissions of an API key
    pub fn permissions_by_api_key(&self, partition: &str, api_key: &str) -> Result<(String, Permissions)> {
        self.read_credentials(partition, |c| c.permissions_by_api_key(api_key))
    }

    pub fn permissions_by_username(&self, partition: &str, username: &str) -> Result<Permissions> {
        self.read_credentials(partition, |c| c.permissions_by_username(username))
    }

    pub fn usernames(&self, partition: &str) -> Result<Vec<String>> {
        self.read_credentials(partition, |c| Ok(c.usernames()))
    }

    pub fn api_keys(&self, partition: &str, username: &str) -> Result<Vec<String>> {
        self.read_credentials(partition, |c| c.api_keys(username))
    }

    /// Set a user's permissions, creating the user if needed
    pub fn set_permissions(&self, partition: &str, username: &str, permissions: Permissions) -> Result<()> {
        self.update_credentials(partition, |c| {
            c.set_permissions(username, permissions);
            Ok(())
        })
    }

    pub fn create_api_key(&self, partition: &str, username: &str, api_key: &str) -> Result<()> {
        self.update_credentials(partition, |c| c.create_api_key(username, api_key))
    }

    pub fn delete_api_key(&self, partition: &str, api_key: &str) -> Result<()> {
        self.update_credentials(partition, |c| c.delete_api_key(api_key))
    }

    pub fn delete_username(&self, partition: &str, username: &str) -> Result<()> {
        self.update_credentials(partition, |c| c.delete_username(username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tessera_common::SyncMode;

    fn config(dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::with_data_dir(dir);
        config.sync = SyncMode::Never;
        config.abort_on_fatal = false;
        config
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        assert!(dir.path().join(PARTITIONS_DIR).is_dir());
        assert!(dir.path().join(LOCK_FILE).is_file());
        assert!(engine.recovery_report().is_clean());
        assert!(engine.cache_stats().is_some());
    }

    #[test]
    fn test_data_dir_is_exclusive() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        assert!(matches!(
            Engine::open(config(dir.path())),
            Err(Error::DataDirLocked(_))
        ));

        drop(engine);
        Engine::open(config(dir.path())).unwrap();
    }

    #[test]
    fn test_cache_disabled() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.cache.enabled = false;
        let engine = Engine::open(config).unwrap();
        assert!(engine.cache_stats().is_none());
        assert!(engine.cache().is_none());
    }

    #[test]
    fn test_escalate_passes_through_without_abort() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        let err = engine
            .inner
            .escalate(Error::replay("t", "disk went away"));
        assert!(matches!(err, Error::JournalReplay { .. }));
        let err = engine.inner.escalate(Error::ReadOnlySession);
        assert!(matches!(err, Error::ReadOnlySession));
    }

    #[test]
    fn test_credentials_roundtrip_through_partition() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_partition("p").unwrap();

        let perms: Permissions = ["read".to_string()].into_iter().collect();
        engine.set_permissions("p", "alice", perms.clone()).unwrap();
        engine.create_api_key("p", "alice", "key-1").unwrap();

        assert_eq!(engine.usernames("p").unwrap(), vec!["alice"]);
        assert_eq!(
            engine.permissions_by_api_key("p", "key-1").unwrap(),
            ("alice".to_string(), perms.clone())
        );
        assert!(matches!(
            engine.create_api_key("p", "bob", "key-2").unwrap_err(),
            Error::RecordNotFound { kind: "user", .. }
        ));
        assert!(matches!(
            engine.usernames("missing").unwrap_err(),
            Error::PartitionNotFound(_)
        ));

        drop(engine);
        let engine = Engine::open(config(dir.path())).unwrap();
        assert_eq!(engine.permissions_by_username("p", "alice").unwrap(), perms);

        engine.delete_partition("p").unwrap();
        engine.create_partition("p").unwrap();
        assert!(engine.usernames("p").unwrap().is_empty());
    }
}
