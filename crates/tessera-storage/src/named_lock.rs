//! Self-cleaning registry of string-keyed reader/writer locks
//!
//! Each key maps to an entry holding the shared lock object and the number of
//! callers currently holding or waiting on it. The entry is created on first
//! use and dropped as soon as the last holder lets go, so the registry only
//! ever contains keys that are contended right now.
//!
//! The registry map is guarded by a short mutex; the per-key lock is always
//! acquired outside of it, so callers working on distinct keys never block
//! each other beyond the lookup.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct Entry {
    lock: Arc<RwLock<()>>,
    holders: usize,
}

/// Registry of named locks
///
/// Cloning is cheap and yields a handle onto the same registry.
#[derive(Clone, Default)]
pub struct NamedLockRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl NamedLockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `key` exclusively, blocking until available
    pub fn write(&self, key: &str) -> NamedLockGuard {
        let lock = self.retain(key);
        let guard = lock.write_arc();
        NamedLockGuard {
            registry: self.clone(),
            key: key.to_string(),
            held: Some(Held::Write(guard)),
        }
    }

    /// Acquire `key` shared, blocking while a writer holds it
    pub fn read(&self, key: &str) -> NamedLockGuard {
        let lock = self.retain(key);
        let guard = lock.read_arc();
        NamedLockGuard {
            registry: self.clone(),
            key: key.to_string(),
            held: Some(Held::Read(guard)),
        }
    }

    /// Number of holders (including waiters) for `key`
    pub fn holders(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.holders)
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Find or create the entry and count the caller as a holder
    fn retain(&self, key: &str) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            lock: Arc::new(RwLock::new(())),
            holders: 0,
        });
        entry.holders += 1;
        Arc::clone(&entry.lock)
    }

    /// Drop one holder of `key`, releasing `held` while the registry is locked
    ///
    /// Releasing under the registry mutex means a newcomer can never create a
    /// fresh entry for `key` while the old lock is still held.
    fn release(&self, key: &str, held: Held) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                entries.remove(key);
            }
        }
        drop(held);
    }
}

impl fmt::Debug for NamedLockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLockRegistry")
            .field("keys", &self.len())
            .finish()
    }
}

enum Held {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// RAII handle on a named lock; dropping it unlocks
pub struct NamedLockGuard {
    registry: NamedLockRegistry,
    key: String,
    held: Option<Held>,
}

impl NamedLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this guard holds the lock exclusively
    pub fn is_write(&self) -> bool {
        matches!(self.held, Some(Held::Write(_)))
    }
}

impl fmt::Debug for NamedLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("key", &self.key)
            .field("write", &self.is_write())
            .finish()
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            self.registry.release(&self.key, held);
        }
    }
}
