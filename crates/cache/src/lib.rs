pub mod caching_disk;
pub mod object_cache;

use std::path::PathBuf;

use tierstore_common::settings::{CacheGranularity, RemoteDiskSettings};

pub use caching_disk::CachingDisk;
pub use object_cache::{CacheKey, CacheStats, ObjectCache};

/// Read-through cache settings for one remote disk.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Directory for file-backed entries. `None` keeps entries in memory.
    pub cache_root_path: Option<PathBuf>,
    pub max_cache_bytes: u64,
    pub granularity: CacheGranularity,
    /// Admit freshly written objects instead of waiting for the first read.
    pub populate_on_write: bool,
}

impl CacheConfig {
    /// Memory-resident whole-object cache of `max_cache_bytes`.
    pub fn in_memory(max_cache_bytes: u64) -> Self {
        Self {
            enabled: true,
            cache_root_path: None,
            max_cache_bytes,
            granularity: CacheGranularity::WholeObject,
            populate_on_write: false,
        }
    }

    pub fn from_settings(settings: &RemoteDiskSettings) -> Self {
        Self {
            enabled: settings.cache_enabled,
            cache_root_path: settings.cache_path.clone(),
            max_cache_bytes: settings.cache_max_bytes,
            granularity: settings.cache_granularity,
            populate_on_write: settings.cache_populate_on_write,
        }
    }
}
