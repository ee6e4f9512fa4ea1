use std::sync::Arc;

use async_trait::async_trait;
use tierstore_common::settings::CacheGranularity;
use tierstore_common::{
    ByteRange, Disk, DiskCapabilities, DiskKind, DiskSpace, Reservation, TierError,
};
use tracing::{debug, info};

use crate::object_cache::{CacheKey, ObjectCache};
use crate::CacheConfig;

/// Read-through cache in front of another disk.
///
/// Shares the inner disk's name, capabilities and space accounting; only
/// reads are served differently.
pub struct CachingDisk {
    inner: Arc<dyn Disk>,
    cache: ObjectCache,
    granularity: CacheGranularity,
    populate_on_write: bool,
}

impl CachingDisk {
    pub fn new(inner: Arc<dyn Disk>, config: &CacheConfig) -> Result<Self, TierError> {
        let cache = ObjectCache::open(config)?;
        info!(
            disk = inner.name(),
            max_bytes = config.max_cache_bytes,
            file_backed = cache.is_file_backed(),
            granularity = ?config.granularity,
            "cache attached"
        );
        Ok(Self {
            inner,
            cache,
            granularity: config.granularity,
            populate_on_write: config.populate_on_write,
        })
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn inner(&self) -> &Arc<dyn Disk> {
        &self.inner
    }

    fn cache_key(&self, key: &str, range: ByteRange) -> CacheKey {
        match self.granularity {
            CacheGranularity::WholeObject => CacheKey::whole(self.inner.name(), key),
            CacheGranularity::ByteRange => CacheKey::ranged(self.inner.name(), key, range),
        }
    }
}

/// Cut a cached or fetched entry down to what the caller asked for.
fn project(entry: &CacheKey, range: ByteRange, data: Vec<u8>) -> Vec<u8> {
    if entry.range.is_some() || range.is_full() {
        data
    } else {
        range.slice(&data).to_vec()
    }
}

#[async_trait]
impl Disk for CachingDisk {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> DiskKind {
        self.inner.kind()
    }

    fn capabilities(&self) -> DiskCapabilities {
        self.inner.capabilities()
    }

    fn space(&self) -> DiskSpace {
        self.inner.space()
    }

    fn reserve(&self, bytes: u64) -> Result<Reservation, TierError> {
        self.inner.reserve(bytes)
    }

    fn release(&self, reservation: Reservation) {
        self.inner.release(reservation)
    }

    async fn write(
        &self,
        key: &str,
        data: &[u8],
        reservation: &Reservation,
    ) -> Result<(), TierError> {
        let disk = self.inner.name();
        self.cache.invalidate(disk, key).await;
        self.inner.write(key, data, reservation).await?;
        // Drop anything a concurrent reader admitted while the write was in flight.
        self.cache.invalidate(disk, key).await;
        if self.populate_on_write {
            let ticket = self.cache.ticket();
            self.cache
                .insert(CacheKey::whole(disk, key), data, ticket)
                .await;
        }
        Ok(())
    }

    async fn read(&self, key: &str, range: ByteRange) -> Result<Vec<u8>, TierError> {
        let entry = self.cache_key(key, range);
        if let Some(data) = self.cache.get(&entry).await {
            return Ok(project(&entry, range, data));
        }

        let ticket = self.cache.ticket();
        let fetch = match entry.range {
            Some(exact) => exact,
            None if range.is_full() => ByteRange::FULL,
            None => {
                // A whole-object entry is only worth fetching if it can be admitted.
                let size = self.inner.object_size(key).await?;
                if size > self.cache.max_bytes() {
                    debug!(disk = self.inner.name(), key, size, %range, "object too large to cache, reading range");
                    return self.inner.read(key, range).await;
                }
                ByteRange::FULL
            }
        };
        let data = self.inner.read(key, fetch).await?;
        self.cache.insert(entry.clone(), &data, ticket).await;
        Ok(project(&entry, range, data))
    }

    async fn read_durable(&self, key: &str) -> Result<Vec<u8>, TierError> {
        self.inner.read_durable(key).await
    }

    async fn object_size(&self, key: &str) -> Result<u64, TierError> {
        self.inner.object_size(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, TierError> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        if !self.inner.capabilities().supports_delete {
            return Err(TierError::UnsupportedOperation {
                disk: self.inner.name().to_string(),
                op: "delete",
            });
        }
        let disk = self.inner.name();
        self.cache.invalidate(disk, key).await;
        self.inner.delete(key).await?;
        self.cache.invalidate(disk, key).await;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        self.inner.list(prefix).await
    }
}
