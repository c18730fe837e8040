//! Size-bounded on-disk LRU store for one namespace
//!
//! Records live at `<dir>/<key[..2]>/<key>.entry`. An in-memory index keeps
//! recency order and sizes so eviction never has to touch the disk to decide
//! what goes.
//!
//! # Concurrency
//!
//! Every mutating sequence (evict, write, remove, clear) runs under one
//! async write gate per namespace. The index sits behind a short-lived
//! `parking_lot::Mutex` that is never held across I/O, so reads proceed
//! alongside each other and alongside a writer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::entry::{
    decode_prefix, decode_record, encode_record, CacheEntry, EntryMeta, Namespace, RecordHeader,
    RECORD_PREFIX_LEN,
};
use super::error::{CacheError, Result};
use super::key::CacheKey;

const RECORD_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";

/// Occupancy of one namespace
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceBudget {
    pub namespace: Namespace,
    /// Bytes of live records on disk, headers included
    pub current_size_bytes: u64,
    pub max_size_bytes: u64,
    pub entry_count: usize,
}

/// Counters for one namespace
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub write_failures: u64,
    pub corrupt_records: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    write_failures: AtomicU64,
    corrupt_records: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            corrupt_records: self.corrupt_records.load(Ordering::Relaxed),
        }
    }
}

/// Index record for one key
#[derive(Debug, Clone, Copy)]
struct Indexed {
    /// Record length on disk
    size_bytes: u64,
    created_at: DateTime<Utc>,
    /// Distinguishes successive records written under the same key
    generation: u64,
}

struct Index {
    /// Recency order; the LRU end is the eviction candidate
    entries: LruCache<CacheKey, Indexed>,
    current_size_bytes: u64,
    next_generation: u64,
}

impl Index {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            current_size_bytes: 0,
            next_generation: 0,
        }
    }

    fn insert(&mut self, key: CacheKey, size_bytes: u64, created_at: DateTime<Utc>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        if let Some(old) = self.entries.put(
            key,
            Indexed {
                size_bytes,
                created_at,
                generation,
            },
        ) {
            self.current_size_bytes -= old.size_bytes;
        }
        self.current_size_bytes += size_bytes;
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Indexed> {
        let removed = self.entries.pop(key)?;
        self.current_size_bytes -= removed.size_bytes;
        Some(removed)
    }

    fn pop_lru(&mut self) -> Option<(CacheKey, Indexed)> {
        let (key, removed) = self.entries.pop_lru()?;
        self.current_size_bytes -= removed.size_bytes;
        Some((key, removed))
    }
}

/// Bounded store for one namespace
#[derive(Clone)]
pub struct BoundedCache {
    inner: Arc<BoundedCacheInner>,
}

struct BoundedCacheInner {
    dir: PathBuf,
    namespace: Namespace,
    max_size_bytes: u64,
    index: Mutex<Index>,
    write_gate: tokio::sync::Mutex<()>,
    counters: Counters,
}

impl BoundedCache {
    /// Open (or create) the namespace directory and rebuild the index
    ///
    /// Unreadable records are deleted. If the budget shrank since the last
    /// run, least recently used entries are evicted until it fits.
    pub async fn open(
        dir: impl Into<PathBuf>,
        namespace: Namespace,
        max_size_bytes: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let scan_dir = dir.clone();
        let mut found = tokio::task::spawn_blocking(move || scan_records(&scan_dir, namespace))
            .await
            .map_err(|e| CacheError::Unavailable(namespace, e.to_string()))??;

        // Oldest first, so the last inserted ends up most recent
        found.sort_by(|a, b| {
            (a.last_accessed_at, a.created_at).cmp(&(b.last_accessed_at, b.created_at))
        });

        let mut index = Index::new();
        for record in found {
            index.insert(record.key, record.size_bytes, record.created_at);
        }

        let cache = Self {
            inner: Arc::new(BoundedCacheInner {
                dir,
                namespace,
                max_size_bytes,
                index: Mutex::new(index),
                write_gate: tokio::sync::Mutex::new(()),
                counters: Counters::default(),
            }),
        };

        {
            let _gate = cache.inner.write_gate.lock().await;
            let evicted = cache.evict_until_fits(0).await;
            if evicted > 0 {
                info!(namespace = %namespace, evicted, "Evicted entries to fit a reduced budget");
            }
        }

        let budget = cache.budget();
        info!(
            namespace = %namespace,
            entries = budget.entry_count,
            size_bytes = budget.current_size_bytes,
            max_size_bytes,
            "Opened cache namespace"
        );

        Ok(cache)
    }

    pub fn namespace(&self) -> Namespace {
        self.inner.namespace
    }

    /// Look up an entry. Any failure reads as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let indexed = self.inner.index.lock().entries.peek(key).copied();
        let Some(indexed) = indexed else {
            Counters::bump(&self.inner.counters.misses);
            return None;
        };

        let path = self.record_path(key);
        let decoded = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let now = Utc::now();
                decode_record(&bytes, now).and_then(|entry| {
                    if entry.meta.key == key.as_str() && entry.meta.namespace == self.inner.namespace {
                        Ok(entry)
                    } else {
                        Err(CacheError::Corrupted("record key mismatch".to_string()))
                    }
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::Corrupted("record file missing".to_string()))
            }
            Err(e) => {
                warn!(namespace = %self.inner.namespace, key = %key, error = %e, "Cache read failed");
                Counters::bump(&self.inner.counters.misses);
                return None;
            }
        };

        match decoded {
            Ok(entry) => {
                self.inner.index.lock().entries.promote(key);
                Counters::bump(&self.inner.counters.hits);
                touch(path).await;
                debug!(namespace = %self.inner.namespace, key = %key, "Cache hit");
                Some(entry)
            }
            Err(e) => {
                warn!(namespace = %self.inner.namespace, key = %key, error = %e, "Dropping unreadable cache record");
                Counters::bump(&self.inner.counters.corrupt_records);
                Counters::bump(&self.inner.counters.misses);
                self.remove_if_generation(key, indexed.generation).await;
                None
            }
        }
    }

    /// Store an entry, evicting least recently used entries to make room.
    ///
    /// The budget is charged the whole record as written to disk, header
    /// included. Records larger than the whole budget are rejected without
    /// evicting anything. Disk failures are logged and the write is skipped.
    pub async fn put(&self, key: &CacheKey, payload: &[u8]) -> Result<()> {
        let meta = EntryMeta::for_payload(key.as_str(), self.inner.namespace, payload);
        let record = encode_record(&meta, payload)?;
        let size = record.len() as u64;
        if size > self.inner.max_size_bytes {
            return Err(CacheError::CapacityExceeded {
                namespace: self.inner.namespace,
                size,
                max: self.inner.max_size_bytes,
            });
        }

        let _gate = self.inner.write_gate.lock().await;

        // Replace, never duplicate
        if self.inner.index.lock().remove(key).is_some() {
            remove_file_quiet(&self.record_path(key)).await;
        }

        let evicted = self.evict_until_fits(size).await;
        if evicted > 0 {
            debug!(namespace = %self.inner.namespace, evicted, "Evicted entries for new write");
        }

        if let Err(e) = self.write_record(key, &record).await {
            warn!(namespace = %self.inner.namespace, key = %key, error = %e, "Cache write failed");
            Counters::bump(&self.inner.counters.write_failures);
            return Ok(());
        }

        self.inner
            .index
            .lock()
            .insert(key.clone(), size, meta.created_at);
        debug!(namespace = %self.inner.namespace, key = %key, size, "Cache write");
        Ok(())
    }

    /// Remove one entry; returns whether it was present
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let _gate = self.inner.write_gate.lock().await;
        let removed = self.inner.index.lock().remove(key).is_some();
        if removed {
            remove_file_quiet(&self.record_path(key)).await;
        }
        removed
    }

    /// Drop every entry created more than `max_age` ago
    pub async fn evict_expired(&self, max_age: Duration) -> usize {
        let _gate = self.inner.write_gate.lock().await;
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };

        let expired: Vec<CacheKey> = {
            let mut index = self.inner.index.lock();
            let keys: Vec<CacheKey> = index
                .entries
                .iter()
                .filter(|(_, indexed)| indexed.created_at < cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                index.remove(key);
            }
            keys
        };

        for key in &expired {
            remove_file_quiet(&self.record_path(key)).await;
            Counters::bump(&self.inner.counters.expirations);
        }

        if !expired.is_empty() {
            info!(namespace = %self.inner.namespace, expired = expired.len(), "Expired cache entries");
        }
        expired.len()
    }

    /// Remove every entry in the namespace
    pub async fn clear(&self) -> usize {
        let _gate = self.inner.write_gate.lock().await;
        let removed = {
            let mut index = self.inner.index.lock();
            let count = index.entries.len();
            index.entries.clear();
            index.current_size_bytes = 0;
            count
        };

        if let Err(e) = tokio::fs::remove_dir_all(&self.inner.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(namespace = %self.inner.namespace, error = %e, "Failed to remove cache directory");
            }
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.inner.dir).await {
            warn!(namespace = %self.inner.namespace, error = %e, "Failed to recreate cache directory");
        }

        info!(namespace = %self.inner.namespace, removed, "Cleared cache namespace");
        removed
    }

    pub fn budget(&self) -> NamespaceBudget {
        let index = self.inner.index.lock();
        NamespaceBudget {
            namespace: self.inner.namespace,
            current_size_bytes: index.current_size_bytes,
            max_size_bytes: self.inner.max_size_bytes,
            entry_count: index.entries.len(),
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.counters.snapshot()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.index.lock().entries.contains(key)
    }

    // =========================================================================
    // Internals (callers hold the write gate)
    // =========================================================================

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.inner
            .dir
            .join(key.shard())
            .join(format!("{}.{}", key.as_str(), RECORD_EXTENSION))
    }

    async fn evict_until_fits(&self, incoming: u64) -> usize {
        let mut evicted = 0;
        loop {
            let victim = {
                let mut index = self.inner.index.lock();
                if index.current_size_bytes + incoming <= self.inner.max_size_bytes {
                    break;
                }
                index.pop_lru()
            };
            let Some((key, _)) = victim else {
                break;
            };
            remove_file_quiet(&self.record_path(&key)).await;
            Counters::bump(&self.inner.counters.evictions);
            evicted += 1;
        }
        evicted
    }

    async fn write_record(&self, key: &CacheKey, record: &[u8]) -> Result<()> {
        let path = self.record_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("{}.{}", uuid::Uuid::new_v4().simple(), TEMP_EXTENSION));
        if let Err(e) = tokio::fs::write(&tmp, record).await {
            remove_file_quiet(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            remove_file_quiet(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_if_generation(&self, key: &CacheKey, generation: u64) {
        let _gate = self.inner.write_gate.lock().await;
        let still_same = {
            let mut index = self.inner.index.lock();
            match index.entries.peek(key) {
                Some(indexed) if indexed.generation == generation => {
                    index.remove(key);
                    true
                }
                _ => false,
            }
        };
        if still_same {
            remove_file_quiet(&self.record_path(key)).await;
        }
    }

    #[cfg(test)]
    fn keys_lru_first(&self) -> Vec<CacheKey> {
        let index = self.inner.index.lock();
        index.entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }
}

// =============================================================================
// Disk helpers
// =============================================================================

struct ScannedRecord {
    key: CacheKey,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
}

/// Walk `<dir>/<shard>/<key>.entry` and read each record header
fn scan_records(dir: &Path, namespace: Namespace) -> Result<Vec<ScannedRecord>> {
    let mut found = Vec::new();

    for shard in std::fs::read_dir(dir)? {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for file in std::fs::read_dir(shard.path())? {
            let path = file?.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if ext != RECORD_EXTENSION {
                // Leftover temp files from an interrupted write
                let _ = std::fs::remove_file(&path);
                continue;
            }
            match read_header(&path, namespace) {
                Ok(record) => found.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Removing unreadable cache record");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    Ok(found)
}

fn read_header(path: &Path, namespace: Namespace) -> Result<ScannedRecord> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let metadata = file.metadata()?;

    let mut prefix = [0u8; RECORD_PREFIX_LEN];
    file.read_exact(&mut prefix)?;
    let header_len = decode_prefix(&prefix)?;
    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)?;
    let header: RecordHeader = serde_json::from_slice(&header)?;

    let expected_len = (RECORD_PREFIX_LEN + header_len) as u64 + header.size_bytes;
    if metadata.len() != expected_len {
        return Err(CacheError::Corrupted("record length mismatch".to_string()));
    }
    if header.namespace != namespace {
        return Err(CacheError::Corrupted("record in wrong namespace".to_string()));
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let key = CacheKey::from_hex(stem)
        .filter(|k| k.as_str() == header.key)
        .ok_or_else(|| CacheError::Corrupted("record key mismatch".to_string()))?;

    let last_accessed_at = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(header.created_at);

    Ok(ScannedRecord {
        key,
        size_bytes: metadata.len(),
        created_at: header.created_at,
        last_accessed_at,
    })
}

/// Persist recency as the record's mtime; best effort
async fn touch(path: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(SystemTime::now())
    })
    .await;
    if let Ok(Err(e)) = result {
        debug!(error = %e, "Failed to refresh record mtime");
    }
}

async fn remove_file_quiet(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove cache file");
        }
    }
}
