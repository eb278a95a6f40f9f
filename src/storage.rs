//! The storage engine the front end consumes.
//!
//! The bitcask-style store is treated as an external collaborator reachable
//! only through the `hs_*` interface (open/close/set/append/incr/delete/get/
//! count/stat/flush/optimize/optimize_stat). This module implements that
//! interface directly rather than over an FFI boundary: a sharded,
//! independently-locked key-value map that provides its own concurrency so
//! the front end never takes a process-wide storage lock.

use crate::item::{Item, VersionClock};
use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Number of independent shards. Sized for reasonable parallelism without
/// wasting memory on mostly-empty maps for small datasets.
const SHARD_COUNT: usize = 16;

/// Result of a mutating store call, mirroring the tri-state `hs_set` return
/// (`STORED`/`EXISTS`/`NOT_FOUND`/`NOT_STORED`) plus the boolean `hs_delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Stored,
    Exists,
    NotFound,
    NotStored,
}

/// Outcome of `Store::optimize`, matching `hs_optimize`'s four return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeResult {
    Started,
    ReadOnly,
    AlreadyRunning,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeState {
    Idle,
    Running,
    Done,
    Failed,
}

struct Shard {
    data: RwLock<HashMap<Bytes, Arc<Item>>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

/// Cumulative byte/item counters exposed via `Store::stat`.
#[derive(Debug, Default)]
pub struct StoreStat {
    pub total_items: u64,
    pub total_space: u64,
}

/// The sharded, internally-synchronized key-value store.
///
/// Owns no knowledge of the wire protocol; every method here corresponds
/// 1:1 to an `hs_*` call.
pub struct Store {
    shards: Vec<Shard>,
    version: VersionClock,
    total_items: AtomicU64,
    total_space: AtomicU64,
    optimize_state: AtomicU8,
    optimize_bucket: AtomicU32,
    home: String,
}

impl Store {
    /// `hs_open(home, height, before_time, threads)`.
    ///
    /// `height` and `before_time` govern on-disk bucket layout and merge
    /// policy in the real bitcask engine; they are accepted here for
    /// interface fidelity but unused by the in-memory shards.
    pub fn open(home: &str, _height: u8, _before_time: i64, _threads: usize) -> Arc<Self> {
        info!(home, shards = SHARD_COUNT, "opening storage");
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Shard::new());
        }
        Arc::new(Self {
            shards,
            version: VersionClock::new(),
            total_items: AtomicU64::new(0),
            total_space: AtomicU64::new(0),
            optimize_state: AtomicU8::new(OptimizeState::Idle as u8),
            optimize_bucket: AtomicU32::new(0),
            home: home.to_string(),
        })
    }

    /// `hs_close(store)`.
    pub fn close(&self) {
        info!(home = %self.home, "closing storage");
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// `hs_get(key, nkey)`.
    pub fn get(&self, key: &[u8]) -> Option<Arc<Item>> {
        let shard = self.shard_for(key);
        let data = shard.data.read().unwrap();
        data.get(key).cloned()
    }

    /// `hs_set(store, key, bytes, flag, ver)`.
    ///
    /// `ver` doubles as an optimistic write token: a `ver` of `0` means the
    /// client isn't versioning this write, so it always stores unconditionally
    /// (this keeps plain repeated `set`s working with no ver bookkeeping on
    /// the client's part). A nonzero `ver` is a precondition: the write is
    /// rejected with `Exists` and the stored value is left untouched if the
    /// existing item's version is already `>= ver` (the client is replaying a
    /// stale write). `NotStored`/`NotFound` remain part of the interface for
    /// fidelity with the documented `hs_set` return domain; this store has no
    /// allocation-failure or missing-bucket path that would produce them from
    /// `set` (oversized values are rejected before `set` is ever called, see
    /// `net::connection::begin_data_command`).
    pub fn set(&self, key: Bytes, value: Bytes, flag: u32, ver: u32) -> StoreResult {
        let shard = self.shard_for(&key);
        let mut data = shard.data.write().unwrap();
        if ver != 0 {
            if let Some(existing) = data.get(&key) {
                if existing.ver >= ver {
                    return StoreResult::Exists;
                }
            }
        }
        let existed = data.contains_key(&key);
        let item = Item::new(key.clone(), value, flag, ver);
        if !existed {
            self.total_items.fetch_add(1, Ordering::Relaxed);
        }
        self.total_space
            .fetch_add((item.nkey() + item.nsuffix() + item.nbytes()) as u64, Ordering::Relaxed);
        data.insert(key, item);
        StoreResult::Stored
    }

    /// `hs_append(store, key, bytes)`.
    ///
    /// Reports the same `Stored`/`NotStored` pair `set` does rather than a
    /// separate append-specific status.
    pub fn append(&self, key: &[u8], data_to_append: &[u8]) -> StoreResult {
        let shard = self.shard_for(key);
        let mut data = shard.data.write().unwrap();
        match data.get(key) {
            None => StoreResult::NotStored,
            Some(existing) => {
                let mut joined = Vec::with_capacity(existing.value.len() + data_to_append.len());
                joined.extend_from_slice(&existing.value);
                joined.extend_from_slice(data_to_append);
                let item = Item::new(
                    existing.key.clone(),
                    Bytes::from(joined),
                    existing.flag,
                    self.version.next(),
                );
                self.total_space
                    .fetch_add((item.nsuffix() + data_to_append.len()) as u64, Ordering::Relaxed);
                data.insert(Bytes::copy_from_slice(key), item);
                StoreResult::Stored
            }
        }
    }

    /// `hs_incr(store, key, delta)`. Returns the new value. A missing key
    /// reports `None` (mapped to `NOT_FOUND` by the command layer).
    pub fn incr(&self, key: &[u8], delta: i64) -> Option<u64> {
        let shard = self.shard_for(key);
        let mut data = shard.data.write().unwrap();
        let existing = data.get(key)?;
        let current: u64 = std::str::from_utf8(&existing.value)
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let updated = if delta >= 0 {
            current.wrapping_add(delta as u64)
        } else {
            current.saturating_sub((-delta) as u64)
        };
        let item = Item::new(
            existing.key.clone(),
            Bytes::from(updated.to_string()),
            existing.flag,
            self.version.next(),
        );
        data.insert(Bytes::copy_from_slice(key), item);
        Some(updated)
    }

    /// `hs_delete(store, key)`.
    pub fn delete(&self, key: &[u8]) -> bool {
        let shard = self.shard_for(key);
        let mut data = shard.data.write().unwrap();
        if let Some(item) = data.remove(key) {
            self.total_items.fetch_sub(1, Ordering::Relaxed);
            self.total_space.fetch_sub(
                (item.nkey() + item.nsuffix() + item.nbytes()) as u64,
                Ordering::Relaxed,
            );
            true
        } else {
            false
        }
    }

    /// `hs_count(store, &curr) -> total`.
    pub fn count(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.data.read().unwrap().len() as u64)
            .sum()
    }

    /// `hs_stat(store, &total_space, &avail_space)`.
    pub fn stat(&self, max_memory: u64) -> StoreStat {
        StoreStat {
            total_items: self.total_items.load(Ordering::Relaxed),
            total_space: self.total_space.load(Ordering::Relaxed).min(max_memory),
        }
    }

    /// `hs_flush(store, limit_kb, period_secs)`, invoked by the background
    /// flush thread. The in-memory store has nothing to fsync; this is the
    /// hook a durable engine would use, kept so the flush loop has a real
    /// call to make on its configured period.
    pub fn flush(&self, _limit_kb: usize, _period_secs: u64) {
        debug!(home = %self.home, "flush tick");
    }

    /// `hs_optimize(store, limit, tree)`. `tree` picks the bucket to merge;
    /// `limit` bounds how much work a real engine's merge pass would do per
    /// call. The in-memory store has nothing to compact, so there's nothing
    /// for `limit` to bound — it's accepted for interface fidelity and
    /// logged, same as `flush`'s `_limit_kb`.
    pub fn optimize(&self, bucket: u32, limit: Option<u64>) -> OptimizeResult {
        match self.optimize_state.compare_exchange(
            OptimizeState::Idle as u8,
            OptimizeState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                debug!(bucket, ?limit, "optimize starting");
                self.optimize_bucket.store(bucket, Ordering::SeqCst);
                // The real engine merges data files here; the in-memory
                // store has nothing to compact, so optimization completes
                // immediately.
                self.optimize_state
                    .store(OptimizeState::Done as u8, Ordering::SeqCst);
                OptimizeResult::Started
            }
            Err(_) => OptimizeResult::AlreadyRunning,
        }
    }

    /// `hs_optimize_stat(store)`.
    pub fn optimize_stat(&self) -> OptimizeState {
        match self.optimize_state.load(Ordering::SeqCst) {
            x if x == OptimizeState::Running as u8 => OptimizeState::Running,
            x if x == OptimizeState::Done as u8 => OptimizeState::Done,
            x if x == OptimizeState::Failed as u8 => OptimizeState::Failed,
            _ => OptimizeState::Idle,
        }
    }

    pub fn optimizing_bucket(&self) -> u32 {
        self.optimize_bucket.load(Ordering::SeqCst)
    }
}

/// Background thread driving `Store::flush` on a fixed period.
pub fn spawn_flush_thread(
    store: Arc<Store>,
    limit_kb: usize,
    period_secs: u64,
    quit: Arc<std::sync::atomic::AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("flush".to_string())
        .spawn(move || {
            while !quit.load(Ordering::Relaxed) {
                store.flush(limit_kb, period_secs);
                std::thread::sleep(Duration::from_secs(1));
            }
            debug!("flush thread exiting");
        })
        .expect("failed to spawn flush thread")
}
