//! Bounded read/write-through cache for partition files
//!
//! Items are keyed by partition and relative path and kept in a single FIFO
//! queue across all partitions. Admission order, not access order, decides
//! eviction. Each item carries an absolute deadline that is checked on access
//! and by a periodic sweeper.
//!
//! Eviction before inserting an item of `s` bytes into a cache of `max` bytes:
//!
//! 1. `resident + s <= max`: nothing to do
//! 2. `s > max`: the item is not cached
//! 3. a single resident item: it is evicted
//! 4. otherwise count the oldest items that must go; if that is at least 70%
//!    of the cache the item is not cached, else those items are evicted
//!
//! Hits push the deadline out by the item's TTL unless the cache is serving
//! more than `busy_rps_threshold` reads per second.

use crate::middleware::{Fallback, FileMiddleware, Persist};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tessera_common::{CacheConfig, Result};
use tracing::{debug, info};

/// Share of resident items one insert may evict, in percent
const MAX_EVICT_PERCENT: usize = 70;

/// Period of the request counter reset
const LOAD_WINDOW: Duration = Duration::from_secs(1);

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Reads served from memory
    pub hits: AtomicU64,
    /// Reads that went to the fallback
    pub misses: AtomicU64,
    /// Items evicted to make room
    pub evictions: AtomicU64,
    /// Inserts refused by the admission rules
    pub refused: AtomicU64,
    /// Items dropped after their deadline
    pub expirations: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.refused.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
    }
}

struct Slot {
    partition: String,
    rel: String,
    data: Bytes,
    ttl: Duration,
    /// Nanoseconds since the cache epoch; atomic so hits can refresh it under
    /// the read lock
    deadline: AtomicU64,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Slot {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn expired(&self, now: u64) -> bool {
        self.deadline.load(Ordering::Relaxed) <= now
    }

    fn refresh(&self, now: u64) {
        self.deadline
            .store(now.saturating_add(nanos(self.ttl)), Ordering::Relaxed);
    }
}

/// FIFO queue over an arena of slots; an index stays valid until unlinked
#[derive(Default)]
struct Queue {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    /// Oldest item
    head: Option<usize>,
    /// Newest item
    tail: Option<usize>,
    len: usize,
}

impl Queue {
    fn get(&self, idx: usize) -> Option<&Slot> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut Slot> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn push_back(&mut self, mut slot: Slot) -> usize {
        slot.prev = self.tail;
        slot.next = None;

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        match self.tail.and_then(|t| self.get_mut(t)) {
            Some(tail) => tail.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
        idx
    }

    fn unlink(&mut self, idx: usize) -> Option<Slot> {
        let slot = self.slots.get_mut(idx)?.take()?;

        match slot.prev.and_then(|p| self.get_mut(p)) {
            Some(prev) => prev.next = slot.next,
            None => self.head = slot.next,
        }
        match slot.next.and_then(|n| self.get_mut(n)) {
            Some(next) => next.prev = slot.prev,
            None => self.tail = slot.prev,
        }

        self.free.push(idx);
        self.len -= 1;
        Some(slot)
    }

    /// Iterate from oldest to newest
    fn iter(&self) -> impl Iterator<Item = (usize, &Slot)> {
        let first = self.head.and_then(|h| self.get(h).map(|s| (h, s)));
        std::iter::successors(first, move |(_, slot)| {
            slot.next.and_then(|n| self.get(n).map(|s| (n, s)))
        })
    }
}

#[derive(Default)]
struct State {
    queue: Queue,
    index: HashMap<String, HashMap<String, usize>>,
    bytes: u64,
}

impl State {
    fn lookup(&self, partition: &str, rel: &str) -> Option<usize> {
        self.index.get(partition)?.get(rel).copied()
    }

    fn insert(&mut self, slot: Slot) {
        let partition = slot.partition.clone();
        let rel = slot.rel.clone();
        self.bytes += slot.size();
        let idx = self.queue.push_back(slot);
        self.index.entry(partition).or_default().insert(rel, idx);
    }

    fn remove(&mut self, idx: usize) -> Option<Slot> {
        let slot = self.queue.unlink(idx)?;
        if let Some(files) = self.index.get_mut(&slot.partition) {
            files.remove(&slot.rel);
            if files.is_empty() {
                self.index.remove(&slot.partition);
            }
        }
        self.bytes -= slot.size();
        Some(slot)
    }

    fn remove_key(&mut self, partition: &str, rel: &str) -> bool {
        match self.lookup(partition, rel) {
            Some(idx) => self.remove(idx).is_some(),
            None => false,
        }
    }

    /// Evict for an insert of `size` bytes; `None` if the insert is refused,
    /// otherwise the number of evicted items
    fn make_room(&mut self, size: u64, max: u64) -> Option<usize> {
        if self.bytes + size <= max {
            return Some(0);
        }
        if size > max {
            return None;
        }
        if self.queue.len == 1 {
            let head = self.queue.head?;
            self.remove(head);
            return Some(1);
        }

        let mut excess = self.bytes + size - max;
        let mut victims = Vec::new();
        for (idx, slot) in self.queue.iter() {
            if excess == 0 {
                break;
            }
            victims.push(idx);
            excess = excess.saturating_sub(slot.size());
        }

        if victims.len() * 100 >= self.queue.len * MAX_EVICT_PERCENT {
            return None;
        }
        for idx in &victims {
            self.remove(*idx);
        }
        Some(victims.len())
    }
}

#[derive(Default)]
struct LoadMonitor {
    requests: AtomicU64,
    started: AtomicBool,
}

struct Shared {
    state: RwLock<State>,
    config: CacheConfig,
    epoch: Instant,
    stats: CacheStats,
    load: LoadMonitor,
    /// Disconnected when the owning cache is dropped
    shutdown: Receiver<()>,
}

impl Shared {
    fn now(&self) -> u64 {
        nanos(self.epoch.elapsed())
    }

    /// Insert under the write lock; a live item is kept unless `replace`
    fn insert(&self, partition: &str, rel: &str, data: Bytes, ttl: Duration, replace: bool) {
        let now = self.now();
        let size = data.len() as u64;
        let mut state = self.state.write();

        if let Some(idx) = state.lookup(partition, rel) {
            let live = state.queue.get(idx).is_some_and(|s| !s.expired(now));
            if live && !replace {
                // A concurrent miss already loaded it
                return;
            }
            if !live {
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            }
            state.remove(idx);
        }

        match state.make_room(size, self.config.max_bytes) {
            Some(evicted) => {
                self.stats
                    .evictions
                    .fetch_add(evicted as u64, Ordering::Relaxed);
            }
            None => {
                self.stats.refused.fetch_add(1, Ordering::Relaxed);
                debug!("Cache refused {}/{} ({} bytes)", partition, rel, size);
                return;
            }
        }

        state.insert(Slot {
            partition: partition.to_string(),
            rel: rel.to_string(),
            data,
            ttl,
            deadline: AtomicU64::new(now.saturating_add(nanos(ttl))),
            prev: None,
            next: None,
        });
    }

    fn sweep(&self) -> usize {
        let now = self.now();
        let mut state = self.state.write();
        let expired: Vec<usize> = state
            .queue
            .iter()
            .filter(|(_, slot)| slot.expired(now))
            .map(|(idx, _)| idx)
            .collect();
        for idx in &expired {
            state.remove(*idx);
        }
        self.stats
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    fn is_busy(&self) -> bool {
        self.load.requests.load(Ordering::Relaxed) > self.config.busy_rps_threshold
    }
}

/// Run `work` on every tick until the cache is gone
fn spawn_ticker<F>(shared: &Arc<Shared>, period: Duration, work: F) -> JoinHandle<()>
where
    F: Fn(&Shared) + Send + 'static,
{
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let shutdown = shared.shutdown.clone();
    let ticker = tick(period);

    thread::spawn(move || {
        loop {
            select! {
                recv(ticker) -> _ => match weak.upgrade() {
                    Some(shared) => work(&*shared),
                    None => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
    })
}

/// Bounded FIFO cache in front of partition files
pub struct CacheMiddleware {
    shared: Arc<Shared>,
    shutdown: Option<Sender<()>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    load_reset: Mutex<Option<JoinHandle<()>>>,
}

impl CacheMiddleware {
    /// Create a cache and start its sweeper
    pub fn new(config: CacheConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let sweep_interval = config.sweep_interval();

        info!(
            "Cache enabled: max {} bytes, ttl {}s, sweep every {}s",
            config.max_bytes,
            config.ttl_secs,
            sweep_interval.as_secs()
        );

        let shared = Arc::new(Shared {
            state: RwLock::new(State::default()),
            config,
            epoch: Instant::now(),
            stats: CacheStats::default(),
            load: LoadMonitor::default(),
            shutdown: shutdown_rx,
        });

        let sweeper = spawn_ticker(&shared, sweep_interval, |shared| {
            let removed = shared.sweep();
            if removed > 0 {
                debug!("Cache sweeper dropped {} expired item(s)", removed);
            }
        });

        Self {
            shared,
            shutdown: Some(shutdown_tx),
            sweeper: Mutex::new(Some(sweeper)),
            load_reset: Mutex::new(None),
        }
    }

    /// Count a read; the first read ever starts the per-second reset
    fn record_request(&self) {
        self.shared.load.requests.fetch_add(1, Ordering::Relaxed);
        if self
            .shared
            .load
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let handle = spawn_ticker(&self.shared, LOAD_WINDOW, |shared| {
                shared.load.requests.store(0, Ordering::Relaxed);
            });
            *self.load_reset.lock() = Some(handle);
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.shared.stats
    }

    /// Number of resident items
    pub fn len(&self) -> usize {
        self.shared.state.read().queue.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total resident bytes
    pub fn resident_bytes(&self) -> u64 {
        self.shared.state.read().bytes
    }

    /// Reads counted in the current one-second window
    pub fn requests_per_second(&self) -> u64 {
        self.shared.load.requests.load(Ordering::Relaxed)
    }

    /// Whether a live item exists for the key
    pub fn contains(&self, partition: &str, rel: &str) -> bool {
        let now = self.shared.now();
        let state = self.shared.state.read();
        state
            .lookup(partition, rel)
            .and_then(|idx| state.queue.get(idx))
            .is_some_and(|slot| !slot.expired(now))
    }

    /// Drop every expired item now
    pub fn purge_expired(&self) -> usize {
        self.shared.sweep()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let state = self.shared.state.read();
        let queued: Vec<_> = state.queue.iter().collect();
        assert_eq!(queued.len(), state.queue.len);
        assert_eq!(
            queued.iter().map(|(_, s)| s.size()).sum::<u64>(),
            state.bytes
        );
        let indexed: usize = state.index.values().map(HashMap::len).sum();
        assert_eq!(indexed, state.queue.len);
        for (idx, slot) in queued {
            assert_eq!(state.lookup(&slot.partition, &slot.rel), Some(idx));
        }
        assert!(state.bytes <= self.shared.config.max_bytes);
    }
}

impl FileMiddleware for CacheMiddleware {
    fn read_file(
        &self,
        rel: &str,
        partition: &str,
        ttl: Duration,
        fallback: Fallback<'_>,
    ) -> Result<Bytes> {
        self.record_request();
        let busy = self.shared.is_busy();
        let now = self.shared.now();

        {
            let state = self.shared.state.read();
            let hit = state
                .lookup(partition, rel)
                .and_then(|idx| state.queue.get(idx))
                .filter(|slot| !slot.expired(now));
            if let Some(slot) = hit {
                if !busy {
                    slot.refresh(now);
                }
                self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(slot.data.clone());
            }
        }

        self.shared.stats.misses.fetch_add(1, Ordering::Relaxed);
        let data = fallback()?;
        self.shared
            .insert(partition, rel, data.clone(), ttl, false);
        Ok(data)
    }

    fn write_file(
        &self,
        rel: &str,
        partition: &str,
        ttl: Duration,
        data: Bytes,
        persist: Persist<'_>,
    ) -> Result<()> {
        if let Err(e) = persist(&data) {
            self.delete_file(rel, partition);
            return Err(e);
        }
        self.shared.insert(partition, rel, data, ttl, true);
        Ok(())
    }

    fn delete_file(&self, rel: &str, partition: &str) {
        self.shared.state.write().remove_key(partition, rel);
    }

    fn delete_partition(&self, partition: &str) {
        let mut state = self.shared.state.write();
        if let Some(files) = state.index.remove(partition) {
            for idx in files.into_values() {
                if let Some(slot) = state.queue.unlink(idx) {
                    state.bytes -= slot.size();
                }
            }
        }
    }

    fn rename_file(&self, old_rel: &str, new_rel: &str, partition: &str) {
        let mut state = self.shared.state.write();
        state.remove_key(partition, old_rel);
        state.remove_key(partition, new_rel);
    }
}

impl Drop for CacheMiddleware {
    fn drop(&mut self) {
        // Disconnecting the channel stops both background threads
        self.shutdown.take();
        let handles = [self.sweeper.lock().take(), self.load_reset.lock().take()];
        for handle in handles.into_iter().flatten() {
            let _ = handle.join();
        }
    }
}
