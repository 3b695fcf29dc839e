//! File middleware seam
//!
//! Every keyed blob read or write against a partition directory goes through a
//! [`FileMiddleware`]. The physical I/O is supplied by the caller as a closure,
//! so a middleware decides only whether the disk is touched at all.

use bytes::Bytes;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{Error, Result, SyncMode};

/// Loader invoked on a cache miss
pub type Fallback<'a> = &'a mut dyn FnMut() -> Result<Bytes>;

/// Writer invoked before a write is cached
pub type Persist<'a> = &'a mut dyn FnMut(&[u8]) -> Result<()>;

/// Read-through, write-through layer in front of partition files
///
/// Keys are `(partition, rel)` where `partition` is the on-disk partition
/// directory name and `rel` a partition-relative path.
pub trait FileMiddleware: Send + Sync {
    /// Serve `rel` from the middleware or load it with `fallback`
    ///
    /// Fallback errors are returned unchanged and never cached.
    fn read_file(
        &self,
        rel: &str,
        partition: &str,
        ttl: Duration,
        fallback: Fallback<'_>,
    ) -> Result<Bytes>;

    /// Persist `data` with `persist`, then remember it
    fn write_file(
        &self,
        rel: &str,
        partition: &str,
        ttl: Duration,
        data: Bytes,
        persist: Persist<'_>,
    ) -> Result<()>;

    /// Forget `rel`
    fn delete_file(&self, rel: &str, partition: &str);

    /// Forget every file of `partition`
    fn delete_partition(&self, partition: &str);

    /// Forget both names involved in a rename
    fn rename_file(&self, old_rel: &str, new_rel: &str, partition: &str);
}

/// Middleware that always goes to disk
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl FileMiddleware for NoCache {
    fn read_file(&self, _: &str, _: &str, _: Duration, fallback: Fallback<'_>) -> Result<Bytes> {
        fallback()
    }

    fn write_file(
        &self,
        _: &str,
        _: &str,
        _: Duration,
        data: Bytes,
        persist: Persist<'_>,
    ) -> Result<()> {
        persist(&data)
    }

    fn delete_file(&self, _: &str, _: &str) {}

    fn delete_partition(&self, _: &str) {}

    fn rename_file(&self, _: &str, _: &str, _: &str) {}
}

/// Shared I/O context handed to transactions and record stores
#[derive(Clone)]
pub struct FileStore {
    middleware: Arc<dyn FileMiddleware>,
    ttl: Duration,
    sync: SyncMode,
}

impl FileStore {
    pub fn new(middleware: Arc<dyn FileMiddleware>, ttl: Duration, sync: SyncMode) -> Self {
        Self {
            middleware,
            ttl,
            sync,
        }
    }

    /// Store without any caching
    pub fn uncached(sync: SyncMode) -> Self {
        Self::new(Arc::new(NoCache), Duration::ZERO, sync)
    }

    pub fn sync(&self) -> SyncMode {
        self.sync
    }

    pub fn middleware(&self) -> &dyn FileMiddleware {
        self.middleware.as_ref()
    }

    /// Read `rel` of `partition`, located on disk at `path`
    ///
    /// A missing file maps to [`Error::NotFound`].
    pub fn read(&self, partition: &str, rel: &str, path: &Path) -> Result<Bytes> {
        self.middleware
            .read_file(rel, partition, self.ttl, &mut || match fs::read(path) {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(Error::NotFound(rel.to_string()))
                }
                Err(e) => Err(e.into()),
            })
    }

    /// Write `data` to `rel` with `persist` and cache it
    pub fn write(
        &self,
        partition: &str,
        rel: &str,
        data: Bytes,
        persist: Persist<'_>,
    ) -> Result<()> {
        self.middleware
            .write_file(rel, partition, self.ttl, data, persist)
    }

    pub fn forget(&self, partition: &str, rel: &str) {
        self.middleware.delete_file(rel, partition);
    }

    pub fn forget_renamed(&self, partition: &str, old_rel: &str, new_rel: &str) {
        self.middleware.rename_file(old_rel, new_rel, partition);
    }

    pub fn forget_partition(&self, partition: &str) {
        self.middleware.delete_partition(partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_uncached_read_maps_not_found() {
        let dir = tempdir().unwrap();
        let store = FileStore::uncached(SyncMode::Never);

        let err = store
            .read("p", "missing", &dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(ref rel) if rel == "missing"));

        fs::write(dir.path().join("f"), b"data").unwrap();
        let data = store.read("p", "f", &dir.path().join("f")).unwrap();
        assert_eq!(&data[..], b"data");
    }

    #[test]
    fn test_uncached_write_persists() {
        let store = FileStore::uncached(SyncMode::Never);
        let mut written = Vec::new();
        store
            .write("p", "f", Bytes::from_static(b"abc"), &mut |d| {
                written.extend_from_slice(d);
                Ok(())
            })
            .unwrap();
        assert_eq!(written, b"abc");
    }
}
