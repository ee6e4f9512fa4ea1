use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tierstore_common::{ByteRange, Disk, OpContext, PartFormat, PartId, Reservation, TierError};
use tracing::{debug, info, warn};

use crate::policy::PlacementResult;
use crate::registry::StorageRegistry;
use crate::volume::Volume;

const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A part as the storage layer sees it: where its bytes live and how to
/// check them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Part {
    pub id: PartId,
    pub size: u64,
    pub format: PartFormat,
    /// Object key on `disk`.
    pub key: String,
    pub disk: String,
    /// crc32 of the part's bytes.
    pub checksum: u32,
}

impl Part {
    pub fn new(id: &str, key: &str, disk: &str, format: PartFormat, data: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            size: data.len() as u64,
            format,
            key: key.to_string(),
            disk: disk.to_string(),
            checksum: crc32fast::hash(data),
        }
    }

    fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.size && crc32fast::hash(data) == self.checksum
    }
}

/// Engine-facing entry point: space, I/O and moves for parts.
///
/// Every I/O method takes an `OpContext`; when it expires or is cancelled
/// the in-flight operation is dropped and any reservation it held is
/// released.
pub struct PlacementEngine {
    registry: Arc<StorageRegistry>,
    /// Upper bound on deletes that clean up after a move.
    cleanup_timeout: Duration,
}

impl PlacementEngine {
    pub fn new(registry: Arc<StorageRegistry>) -> Self {
        Self {
            registry,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    pub fn disk(&self, name: &str) -> Result<&Arc<dyn Disk>, TierError> {
        self.registry
            .disk(name)
            .ok_or_else(|| TierError::Config(format!("unknown disk {name}")))
    }

    /// Reserve space for a new part of `size` bytes under `policy`.
    pub fn reserve_part_space(&self, policy: &str, size: u64) -> Result<PlacementResult, TierError> {
        self.registry.policy(policy)?.place_new_part(size)
    }

    /// Write a part's bytes. The reservation is consumed: released on
    /// success, on failure and when `ctx` aborts the write.
    pub async fn write_part(
        &self,
        disk: &Arc<dyn Disk>,
        key: &str,
        data: &[u8],
        reservation: Reservation,
        ctx: &OpContext,
    ) -> Result<(), TierError> {
        let result = ctx.run(disk.write(key, data, &reservation)).await;
        debug!(
            disk = disk.name(),
            key,
            reservation = %reservation.id(),
            ok = result.is_ok(),
            "part write finished"
        );
        disk.release(reservation);
        result
    }

    pub async fn read_part(
        &self,
        disk: &Arc<dyn Disk>,
        key: &str,
        range: ByteRange,
        ctx: &OpContext,
    ) -> Result<Vec<u8>, TierError> {
        ctx.run(disk.read(key, range)).await
    }

    pub async fn delete_part(&self, disk: &Arc<dyn Disk>, key: &str, ctx: &OpContext) -> Result<(), TierError> {
        ctx.run(disk.delete(key)).await
    }

    /// Volumes of `policy` whose free fraction is below its move factor.
    pub fn volumes_over_move_factor(&self, policy: &str) -> Result<Vec<(usize, Arc<Volume>)>, TierError> {
        Ok(self.registry.policy(policy)?.volumes_over_move_factor())
    }

    /// Copy `part` to `target_volume` of `policy` and return the part as it
    /// will stand once its disk reference is swapped.
    ///
    /// The copy is verified by reading it back from durable storage. On any
    /// failure the target copy is discarded, the reservation released and
    /// `MoveFailed` returned; the source is untouched. The source copy is
    /// left in place: the caller swaps its reference to the returned part
    /// and then calls `retire_source`.
    pub async fn move_to_volume(
        &self,
        part: &Part,
        policy: &str,
        target_volume: &str,
        ctx: &OpContext,
    ) -> Result<Part, TierError> {
        let failed = |reason: String| TierError::MoveFailed {
            part: part.id.clone(),
            reason,
        };

        let policy = self.registry.policy(policy)?;
        let (_, volume) = policy
            .volume(target_volume)
            .ok_or_else(|| TierError::UnknownVolume {
                policy: policy.name().to_string(),
                volume: target_volume.to_string(),
            })?;
        let source = self.disk(&part.disk).map_err(|e| failed(e.to_string()))?.clone();
        if volume.contains_disk(&part.disk) {
            debug!(part = %part.id, volume = target_volume, "part already on target volume");
            return Ok(part.clone());
        }

        let (target, reservation) = volume.reserve(part.size).map_err(|e| failed(e.to_string()))?;
        let copied = ctx.run(self.copy(part, &source, &target, &reservation)).await;
        target.release(reservation);

        if let Err(e) = copied {
            if target.capabilities().supports_delete {
                self.discard(&target, &part.key, "partial copy").await;
            }
            warn!(part = %part.id, from = %part.disk, to = target.name(), error = %e, "move failed");
            return Err(failed(e.to_string()));
        }

        info!(
            part = %part.id,
            size = part.size,
            from = %part.disk,
            to = target.name(),
            volume = target_volume,
            "part copied"
        );
        Ok(Part {
            disk: target.name().to_string(),
            ..part.clone()
        })
    }

    /// Delete the copy of a part that has moved away from `old.disk`. A
    /// disk without delete support keeps the old object, with a warning.
    pub async fn retire_source(&self, old: &Part) {
        let Some(source) = self.registry.disk(&old.disk) else {
            warn!(part = %old.id, disk = %old.disk, "source disk vanished, old copy not deleted");
            return;
        };
        if !source.capabilities().supports_delete {
            warn!(
                part = %old.id,
                disk = source.name(),
                key = %old.key,
                "source disk does not support delete, old copy left in place"
            );
            return;
        }
        if self.discard(source, &old.key, "source copy").await {
            debug!(part = %old.id, disk = source.name(), "source copy deleted");
        }
    }

    /// Best-effort delete bounded by the cleanup timeout; failures only log.
    async fn discard(&self, disk: &Arc<dyn Disk>, key: &str, what: &str) -> bool {
        match tokio::time::timeout(self.cleanup_timeout, disk.delete(key)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(disk = disk.name(), key, what, error = %e, "delete failed, object orphaned");
                false
            }
            Err(_) => {
                warn!(
                    disk = disk.name(),
                    key,
                    what,
                    timeout_ms = self.cleanup_timeout.as_millis() as u64,
                    "delete timed out, object orphaned"
                );
                false
            }
        }
    }

    async fn copy(
        &self,
        part: &Part,
        source: &Arc<dyn Disk>,
        target: &Arc<dyn Disk>,
        reservation: &Reservation,
    ) -> Result<(), TierError> {
        let data = source.read(&part.key, ByteRange::FULL).await?;
        if !part.matches(&data) {
            return Err(TierError::Backend(format!(
                "source copy on {} does not match recorded size/checksum",
                source.name()
            )));
        }
        target.write(&part.key, &data, reservation).await?;
        let written = target.read_durable(&part.key).await?;
        if !part.matches(&written) {
            return Err(TierError::Backend(format!(
                "read-back from {} does not match source",
                target.name()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tierstore_common::settings::{RemoteDiskSettings, StorageConfig};
    use tierstore_common::{ObjectStore, ObjectStoreError, UploadId};
    use tierstore_disk::{MemoryObjectStore, StoreOp};
    use tokio_util::sync::CancellationToken;

    use crate::registry::{MemoryTransport, ObjectStoreFactory};

    struct Fixture {
        _dir: TempDir,
        transport: Arc<MemoryTransport>,
        engine: PlacementEngine,
    }

    fn fixture(s3_quota: u64, supports_delete: bool, latency: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let toml = format!(
            r#"
            [disks.s3]
            type = "remote-object"
            endpoint = "mem://bucket"
            access_key = "k"
            secret_key = "s"
            quota_bytes = {s3_quota}
            supports_delete = {supports_delete}
            retry_backoff = {{ kind = "fixed", delay_ms = 0 }}

            [disks.local]
            type = "local"
            path = "{}"
            capacity_bytes = 1000

            [volumes.main]
            disks = ["s3"]

            [volumes.external]
            disks = ["local"]

            [policies.s3_main]
            volumes = ["main", "external"]
            "#,
            dir.path().join("local").display()
        );
        let config = StorageConfig::from_toml_str(&toml).unwrap();
        let transport = Arc::new(MemoryTransport::with_latency(latency));
        let registry = StorageRegistry::from_config(&config, transport.as_ref()).unwrap();
        Fixture {
            _dir: dir,
            transport,
            engine: PlacementEngine::new(Arc::new(registry)),
        }
    }

    async fn insert(engine: &PlacementEngine, id: &str, data: &[u8]) -> Part {
        let placed = engine.reserve_part_space("s3_main", data.len() as u64).unwrap();
        let key = format!("t/{id}");
        engine
            .write_part(&placed.disk, &key, data, placed.reservation, &OpContext::unbounded())
            .await
            .unwrap();
        Part::new(id, &key, placed.disk.name(), PartFormat::Compact, data)
    }

    fn reserved(engine: &PlacementEngine, disk: &str) -> u64 {
        engine.disk(disk).unwrap().space().reserved
    }

    #[tokio::test]
    async fn test_placement_falls_back_then_no_space() {
        let f = fixture(100, true, Duration::ZERO);
        let first = f.engine.reserve_part_space("s3_main", 80).unwrap();
        assert_eq!(first.volume, "main");
        let second = f.engine.reserve_part_space("s3_main", 80).unwrap();
        assert_eq!(second.volume, "external");
        assert_eq!(second.volume_index, 1);

        assert!(matches!(
            f.engine.reserve_part_space("s3_main", 5_000),
            Err(TierError::NoSpace { .. })
        ));
        assert!(matches!(
            f.engine.reserve_part_space("missing", 1),
            Err(TierError::UnknownPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_write_releases_reservation() {
        let f = fixture(100, true, Duration::ZERO);
        let part = insert(&f.engine, "p1", b"0123456789").await;
        assert_eq!(part.disk, "s3");

        let space = f.engine.disk("s3").unwrap().space();
        assert_eq!(space.used, 10);
        assert_eq!(space.reserved, 0);
        let disk = f.engine.disk("s3").unwrap().clone();
        assert_eq!(
            f.engine
                .read_part(&disk, &part.key, ByteRange::new(2, 3), &OpContext::unbounded())
                .await
                .unwrap(),
            b"234"
        );
    }

    #[tokio::test]
    async fn test_deadline_releases_reservation() {
        let f = fixture(100, true, Duration::from_millis(200));
        let placed = f.engine.reserve_part_space("s3_main", 10).unwrap();
        assert_eq!(reserved(&f.engine, "s3"), 10);

        let ctx = OpContext::with_timeout(Duration::from_millis(20));
        let res = f
            .engine
            .write_part(&placed.disk, "t/slow", &[0; 10], placed.reservation, &ctx)
            .await;
        assert!(matches!(res, Err(TierError::DeadlineExceeded)));
        assert_eq!(reserved(&f.engine, "s3"), 0);
        assert_eq!(f.engine.disk("s3").unwrap().space().used, 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_reservation() {
        let f = fixture(100, true, Duration::from_millis(200));
        let placed = f.engine.reserve_part_space("s3_main", 10).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = OpContext::unbounded().with_cancel(token);

        let res = f
            .engine
            .write_part(&placed.disk, "t/x", &[0; 10], placed.reservation, &ctx)
            .await;
        assert!(matches!(res, Err(TierError::Cancelled)));
        assert_eq!(reserved(&f.engine, "s3"), 0);
    }

    #[tokio::test]
    async fn test_move_to_next_volume() {
        let f = fixture(100, true, Duration::ZERO);
        let part = insert(&f.engine, "p1", b"move me").await;

        let moved = f
            .engine
            .move_to_volume(&part, "s3_main", "external", &OpContext::unbounded())
            .await
            .unwrap();
        assert_eq!(moved.disk, "local");
        assert_eq!(moved.checksum, part.checksum);

        let local = f.engine.disk("local").unwrap().clone();
        assert_eq!(local.read(&part.key, ByteRange::FULL).await.unwrap(), b"move me");
        assert_eq!(local.space().used, 7);
        assert_eq!(local.space().reserved, 0);

        // The source stays readable until it is retired.
        let store = f.transport.store("mem://bucket");
        assert_eq!(store.raw(&part.key).unwrap(), b"move me");
        f.engine.retire_source(&part).await;
        assert!(store.raw(&part.key).is_none());
        assert_eq!(f.engine.disk("s3").unwrap().space().used, 0);
    }

    #[tokio::test]
    async fn test_move_from_no_delete_disk_leaves_orphan() {
        let f = fixture(100, false, Duration::ZERO);
        let part = insert(&f.engine, "p1", b"sticky").await;

        let moved = f
            .engine
            .move_to_volume(&part, "s3_main", "external", &OpContext::unbounded())
            .await
            .unwrap();
        assert_eq!(moved.disk, "local");
        f.engine.retire_source(&part).await;
        assert_eq!(f.transport.store("mem://bucket").raw(&part.key).unwrap(), b"sticky");
        assert_eq!(f.transport.store("mem://bucket").calls(StoreOp::Delete), 0);
    }

    #[tokio::test]
    async fn test_failed_move_leaves_part_unchanged() {
        let f = fixture(1000, true, Duration::ZERO);
        let part = insert(&f.engine, "p1", b"payload").await;
        let moved_back = f
            .engine
            .move_to_volume(&part, "s3_main", "external", &OpContext::unbounded())
            .await
            .unwrap();
        f.engine.retire_source(&part).await;

        // Moving back to s3 fails at upload; the local copy must survive.
        let store = f.transport.store("mem://bucket");
        store.fail_next(StoreOp::Put, 10, ObjectStoreError::AccessDenied);
        let res = f
            .engine
            .move_to_volume(&moved_back, "s3_main", "main", &OpContext::unbounded())
            .await;

        assert!(matches!(res, Err(TierError::MoveFailed { .. })));
        let local = f.engine.disk("local").unwrap().clone();
        assert_eq!(local.read(&part.key, ByteRange::FULL).await.unwrap(), b"payload");
        assert!(store.raw(&part.key).is_none());
        assert_eq!(reserved(&f.engine, "s3"), 0);
        assert_eq!(f.engine.disk("s3").unwrap().space().used, 0);
    }

    #[tokio::test]
    async fn test_move_rejects_corrupt_source() {
        let f = fixture(100, true, Duration::ZERO);
        let mut part = insert(&f.engine, "p1", b"payload").await;
        part.checksum ^= 1;

        let res = f
            .engine
            .move_to_volume(&part, "s3_main", "external", &OpContext::unbounded())
            .await;
        assert!(matches!(res, Err(TierError::MoveFailed { .. })));
        assert!(f.transport.store("mem://bucket").raw(&part.key).is_some());
        assert!(!f.engine.disk("local").unwrap().exists(&part.key).await.unwrap());
        assert_eq!(reserved(&f.engine, "local"), 0);
    }

    #[tokio::test]
    async fn test_move_to_unknown_volume() {
        let f = fixture(100, true, Duration::ZERO);
        let part = insert(&f.engine, "p1", b"x").await;
        assert!(matches!(
            f.engine
                .move_to_volume(&part, "s3_main", "cold", &OpContext::unbounded())
                .await,
            Err(TierError::UnknownVolume { .. })
        ));
    }

    /// Object store that flips the first byte of everything it stores.
    struct CorruptingStore(Arc<MemoryObjectStore>);

    #[async_trait]
    impl ObjectStore for CorruptingStore {
        async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
            self.0.get(key).await
        }

        async fn get_range(&self, key: &str, range: ByteRange) -> Result<Vec<u8>, ObjectStoreError> {
            self.0.get_range(key, range).await
        }

        async fn head(&self, key: &str) -> Result<u64, ObjectStoreError> {
            self.0.head(key).await
        }

        async fn put(&self, key: &str, data: &[u8]) -> Result<(), ObjectStoreError> {
            let mut stored = data.to_vec();
            if let Some(first) = stored.first_mut() {
                *first ^= 0xff;
            }
            self.0.put(key, &stored).await
        }

        async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
            self.0.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
            self.0.list(prefix).await
        }

        async fn create_multipart(&self, key: &str) -> Result<UploadId, ObjectStoreError> {
            self.0.create_multipart(key).await
        }

        async fn upload_part(&self, upload: &UploadId, part_number: u32, data: &[u8]) -> Result<(), ObjectStoreError> {
            self.0.upload_part(upload, part_number, data).await
        }

        async fn complete_multipart(&self, upload: &UploadId) -> Result<(), ObjectStoreError> {
            self.0.complete_multipart(upload).await
        }

        async fn abort_multipart(&self, upload: &UploadId) -> Result<(), ObjectStoreError> {
            self.0.abort_multipart(upload).await
        }
    }

    struct CorruptingTransport(Arc<MemoryObjectStore>);

    impl ObjectStoreFactory for CorruptingTransport {
        fn connect(&self, _disk: &str, _settings: &RemoteDiskSettings) -> Result<Arc<dyn ObjectStore>, TierError> {
            Ok(Arc::new(CorruptingStore(self.0.clone())))
        }
    }

    #[tokio::test]
    async fn test_move_verifies_durable_copy_behind_populating_cache() {
        let dir = TempDir::new().unwrap();
        let toml = format!(
            r#"
            [disks.s3]
            type = "remote-object"
            endpoint = "mem://bucket"
            access_key = "k"
            secret_key = "s"
            cache_enabled = true
            cache_max_bytes = 4096
            cache_populate_on_write = true

            [disks.local]
            type = "local"
            path = "{}"
            capacity_bytes = 1000

            [volumes.main]
            disks = ["s3"]

            [volumes.external]
            disks = ["local"]

            [policies.local_first]
            volumes = ["external", "main"]
            "#,
            dir.path().join("local").display()
        );
        let config = StorageConfig::from_toml_str(&toml).unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let registry = StorageRegistry::from_config(&config, &CorruptingTransport(store.clone())).unwrap();
        let engine = PlacementEngine::new(Arc::new(registry));

        let placed = engine.reserve_part_space("local_first", 8).unwrap();
        assert_eq!(placed.disk.name(), "local");
        engine
            .write_part(&placed.disk, "t/p1", b"verified", placed.reservation, &OpContext::unbounded())
            .await
            .unwrap();
        let part = Part::new("p1", "t/p1", "local", PartFormat::Compact, b"verified");

        let res = engine
            .move_to_volume(&part, "local_first", "main", &OpContext::unbounded())
            .await;
        assert!(matches!(res, Err(TierError::MoveFailed { .. })));
        assert!(store.raw("t/p1").is_none());
        assert_eq!(engine.disk("s3").unwrap().space().reserved, 0);
        assert!(engine.disk("local").unwrap().exists("t/p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_after_aborted_move_is_bounded() {
        let f = fixture(100, true, Duration::from_millis(100));
        let engine = PlacementEngine::new(f.engine.registry().clone())
            .with_cleanup_timeout(Duration::from_millis(20));

        let local = engine.disk("local").unwrap().clone();
        let r = local.reserve(4).unwrap();
        local.write("t/p1", b"slow", &r).await.unwrap();
        local.release(r);
        let part = Part::new("p1", "t/p1", "local", PartFormat::Compact, b"slow");

        // Put, head and delete on s3 each take 100ms; the deadline fires first.
        let started = std::time::Instant::now();
        let res = engine
            .move_to_volume(&part, "s3_main", "main", &OpContext::with_timeout(Duration::from_millis(30)))
            .await;
        assert!(matches!(res, Err(TierError::MoveFailed { .. })));
        assert!(started.elapsed() < Duration::from_millis(150), "{:?}", started.elapsed());
        assert_eq!(reserved(&engine, "s3"), 0);
        assert!(local.exists("t/p1").await.unwrap());
    }
}
