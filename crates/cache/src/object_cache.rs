use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tierstore_common::{ByteRange, TierError};
use tracing::{debug, warn};

use crate::CacheConfig;

const ENTRY_EXT: &str = "bin";

/// Key for a cache entry: one object on one disk, optionally narrowed to a
/// byte range.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub disk: String,
    pub key: String,
    /// `None` for the whole object.
    pub range: Option<ByteRange>,
}

impl CacheKey {
    pub fn whole(disk: &str, key: &str) -> Self {
        Self {
            disk: disk.to_string(),
            key: key.to_string(),
            range: None,
        }
    }

    /// A full range collapses to the whole-object key.
    pub fn ranged(disk: &str, key: &str, range: ByteRange) -> Self {
        Self {
            disk: disk.to_string(),
            key: key.to_string(),
            range: (!range.is_full()).then_some(range),
        }
    }

    fn is_object(&self, disk: &str, key: &str) -> bool {
        self.disk == disk && self.key == key
    }
}

/// Counters since the cache was opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    /// Entries larger than the whole cache, served but never admitted.
    pub rejected: u64,
    /// Hits that turned into misses because the cached file was bad.
    pub fallbacks: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    rejected: AtomicU64,
    fallbacks: AtomicU64,
}

#[derive(Clone)]
enum Payload {
    Memory(Arc<[u8]>),
    File { path: PathBuf, checksum: u32 },
}

struct Entry {
    payload: Payload,
    size: u64,
    tick: u64,
}

/// Index and recency order. Only touched under the cache mutex.
#[derive(Default)]
struct LruState {
    entries: HashMap<CacheKey, Entry>,
    /// Access tick -> key; the first entry is least recently used.
    order: BTreeMap<u64, CacheKey>,
    occupancy: u64,
    next_tick: u64,
    /// Bumped by every invalidation. Fetches that started under an older
    /// epoch may carry stale bytes and are not admitted.
    epoch: u64,
}

impl LruState {
    fn touch(&mut self, key: &CacheKey) -> Option<Payload> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        self.next_tick += 1;
        Some(entry.payload.clone())
    }

    fn push(&mut self, key: CacheKey, payload: Payload, size: u64) {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, key.clone());
        self.entries.insert(key, Entry { payload, size, tick });
        self.occupancy += size;
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.occupancy -= entry.size;
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<Entry> {
        let (_, key) = self.order.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.occupancy -= entry.size;
        Some(entry)
    }
}

/// Bounded LRU store of remote object bytes.
///
/// Admission and eviction happen under one mutex; reading and writing entry
/// files happens outside it. Any failure of the cache itself degrades to a
/// miss.
pub struct ObjectCache {
    max_bytes: u64,
    root: Option<PathBuf>,
    state: Mutex<LruState>,
    next_file: AtomicU64,
    counters: Counters,
}

impl ObjectCache {
    /// Open a cache. A file-backed cache starts empty: leftover entry files
    /// under the root are removed.
    pub fn open(config: &CacheConfig) -> Result<Self, TierError> {
        if let Some(root) = &config.cache_root_path {
            fs::create_dir_all(root)?;
            for entry in fs::read_dir(root)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == ENTRY_EXT) {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(Self {
            max_bytes: config.max_cache_bytes,
            root: config.cache_root_path.clone(),
            state: Mutex::new(LruState::default()),
            next_file: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn is_file_backed(&self) -> bool {
        self.root.is_some()
    }

    pub fn occupancy(&self) -> u64 {
        self.state.lock().unwrap().occupancy
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }

    /// Resident keys, least recently used first.
    pub fn resident_keys(&self) -> Vec<CacheKey> {
        self.state.lock().unwrap().order.values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            insertions: c.insertions.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Take before fetching from the backend; pass to `insert` afterwards.
    pub fn ticket(&self) -> u64 {
        self.state.lock().unwrap().epoch
    }

    /// Look up an entry and mark it most recently used.
    pub async fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let payload = self.state.lock().unwrap().touch(key);
        let data = match payload {
            None => None,
            Some(Payload::Memory(bytes)) => Some(bytes.to_vec()),
            Some(Payload::File { path, checksum }) => match tokio::fs::read(&path).await {
                Ok(data) if crc32fast::hash(&data) == checksum => Some(data),
                Ok(_) => {
                    warn!(key = %key.key, path = %path.display(), "cache entry checksum mismatch, dropping");
                    self.drop_file_entry(key, path).await;
                    None
                }
                Err(e) => {
                    warn!(key = %key.key, path = %path.display(), error = %e, "cache entry unreadable, dropping");
                    self.drop_file_entry(key, path).await;
                    None
                }
            },
        };
        match &data {
            Some(_) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(disk = %key.disk, key = %key.key, range = ?key.range, "cache hit");
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(disk = %key.disk, key = %key.key, range = ?key.range, "cache miss");
            }
        }
        data
    }

    /// Admit `data`, evicting least recently used entries until it fits.
    ///
    /// Returns false when the entry is not admitted: larger than the cache,
    /// invalidated since `ticket` was taken, or the entry file could not be
    /// written.
    pub async fn insert(&self, key: CacheKey, data: &[u8], ticket: u64) -> bool {
        let size = data.len() as u64;
        if size > self.max_bytes {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key.key, size, max = self.max_bytes, "object larger than cache, not admitted");
            return false;
        }

        let payload = match &self.root {
            None => Payload::Memory(Arc::from(data)),
            Some(root) => {
                let id = self.next_file.fetch_add(1, Ordering::Relaxed);
                let path = root.join(format!("{id:016x}.{ENTRY_EXT}"));
                if let Err(e) = tokio::fs::write(&path, data).await {
                    warn!(key = %key.key, path = %path.display(), error = %e, "cache file write failed");
                    let _ = tokio::fs::remove_file(&path).await;
                    return false;
                }
                Payload::File {
                    path,
                    checksum: crc32fast::hash(data),
                }
            }
        };

        let mut garbage = Vec::new();
        let admitted = {
            let mut state = self.state.lock().unwrap();
            if state.epoch != ticket {
                garbage.push(payload);
                false
            } else {
                if let Some(old) = state.remove(&key) {
                    garbage.push(old.payload);
                }
                while state.occupancy + size > self.max_bytes {
                    let Some(victim) = state.evict_lru() else {
                        break;
                    };
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(size = victim.size, "cache eviction");
                    garbage.push(victim.payload);
                }
                state.push(key.clone(), payload, size);
                true
            }
        };

        if admitted {
            self.counters.insertions.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(key = %key.key, "object changed during fetch, not admitted");
        }
        discard(garbage).await;
        admitted
    }

    /// Drop every entry of one object, whole or ranged. Returns how many.
    pub async fn invalidate(&self, disk: &str, key: &str) -> usize {
        let removed: Vec<Payload> = {
            let mut state = self.state.lock().unwrap();
            state.epoch += 1;
            let keys: Vec<CacheKey> = state
                .entries
                .keys()
                .filter(|k| k.is_object(disk, key))
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|k| state.remove(k))
                .map(|e| e.payload)
                .collect()
        };
        let count = removed.len();
        if count > 0 {
            debug!(disk, key, entries = count, "cache invalidated");
        }
        discard(removed).await;
        count
    }

    async fn drop_file_entry(&self, key: &CacheKey, path: PathBuf) {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock().unwrap();
            let same_file = matches!(
                state.entries.get(key).map(|e| &e.payload),
                Some(Payload::File { path: p, .. }) if *p == path
            );
            if same_file {
                state.remove(key);
            }
        }
        discard(vec![Payload::File { path, checksum: 0 }]).await;
    }
}

async fn discard(payloads: Vec<Payload>) {
    for payload in payloads {
        if let Payload::File { path, .. } = payload {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove cache file"),
            }
        }
    }
}
