//! Time-aware cache for decoded per-partition records
//!
//! Entries expire a fixed TTL after their last access. Expiry is checked
//! lazily; there is no capacity bound because keys are partition names.

use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct TlruCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Hash + Eq, V: Clone> TlruCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get a live value and push its expiry out by the TTL
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if entry.expires_at > now {
            entry.expires_at = now + self.ttl;
            return Some(entry.value.clone());
        }
        entries.remove(key);
        None
    }

    pub fn set(&self, key: K, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.lock().insert(key, Entry { value, expires_at });
    }

    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_set_delete() {
        let cache: TlruCache<String, u32> = TlruCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("a"), None);
        cache.set("a".into(), 1);
        assert_eq!(cache.get("a"), Some(1));
        cache.delete("a");
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expiry() {
        let cache: TlruCache<String, u32> = TlruCache::new(Duration::from_millis(30));
        cache.set("a".into(), 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 0);
    }
}
