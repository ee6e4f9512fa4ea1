use std::sync::Arc;

use async_trait::async_trait;
use tierstore_common::settings::RemoteDiskSettings;
use tierstore_common::{
    ByteRange, Disk, DiskCapabilities, DiskKind, DiskSlot, DiskSpace, ObjectStore,
    ObjectStoreError, Reservation, TierError, UploadId,
};
use tracing::{debug, info, warn};

use crate::ledger::ReservationLedger;
use crate::retry::RetryPolicy;

/// Behaviour knobs for a remote-object disk, fixed at construction.
#[derive(Clone, Debug)]
pub struct RemoteDiskOptions {
    pub supports_delete: bool,
    /// Objects larger than this go through a multipart upload.
    pub max_single_part_upload_size: u64,
    /// Applies to get, head and list.
    pub read_retry: RetryPolicy,
    /// Applies to put, delete and every multipart step.
    pub write_retry: RetryPolicy,
    /// Hard logical quota; `None` keeps reservations optimistic.
    pub quota_bytes: Option<u64>,
}

impl RemoteDiskOptions {
    pub fn from_settings(settings: &RemoteDiskSettings) -> Self {
        Self {
            supports_delete: settings.supports_delete,
            max_single_part_upload_size: settings.max_single_part_upload_size.max(1),
            read_retry: RetryPolicy::new(settings.max_single_read_retries, settings.retry_backoff),
            write_retry: RetryPolicy::new(
                settings.max_unexpected_write_error_retries,
                settings.retry_backoff,
            ),
            quota_bytes: settings.quota_bytes,
        }
    }
}

impl Default for RemoteDiskOptions {
    fn default() -> Self {
        Self {
            supports_delete: true,
            max_single_part_upload_size: tierstore_common::settings::DEFAULT_MAX_SINGLE_PART_UPLOAD_SIZE,
            read_retry: RetryPolicy::no_retry(),
            write_retry: RetryPolicy::no_retry(),
            quota_bytes: None,
        }
    }
}

/// Remote-object disk: every transport call goes through a bounded retry
/// policy, large writes are split into multipart uploads, and deletes can be
/// disabled outright.
pub struct RetryingObjectStoreDisk {
    name: String,
    store: Arc<dyn ObjectStore>,
    options: RemoteDiskOptions,
    ledger: Arc<ReservationLedger>,
    slot: DiskSlot,
}

impl RetryingObjectStoreDisk {
    pub fn new(
        name: &str,
        store: Arc<dyn ObjectStore>,
        options: RemoteDiskOptions,
        ledger: Arc<ReservationLedger>,
    ) -> Self {
        let slot = ledger.register(name, options.quota_bytes);
        info!(
            disk = name,
            supports_delete = options.supports_delete,
            max_single_part_upload_size = options.max_single_part_upload_size,
            read_attempts = options.read_retry.max_attempts,
            write_attempts = options.write_retry.max_attempts,
            quota = ?options.quota_bytes,
            "opened remote-object disk"
        );
        Self {
            name: name.to_string(),
            store,
            options,
            ledger,
            slot,
        }
    }

    pub fn options(&self) -> &RemoteDiskOptions {
        &self.options
    }

    fn classify(&self, key: &str, err: ObjectStoreError) -> TierError {
        match err {
            ObjectStoreError::NotFound(_) => TierError::NotFound {
                disk: self.name.clone(),
                key: key.to_string(),
            },
            ObjectStoreError::QuotaExceeded => TierError::NotEnoughSpace {
                disk: self.name.clone(),
                requested: 0,
                available: self.space().unreserved().unwrap_or(0),
            },
            other => other.into(),
        }
    }

    /// Size of `key`, or `None` when absent.
    async fn head(&self, key: &str) -> Result<Option<u64>, TierError> {
        let res = self
            .options
            .read_retry
            .run("head", move || async move {
                self.store.head(key).await.map_err(|e| self.classify(key, e))
            })
            .await;
        match res {
            Ok(size) => Ok(Some(size)),
            Err(TierError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_single(&self, key: &str, data: &[u8]) -> Result<(), TierError> {
        self.options
            .write_retry
            .run("put", move || async move {
                self.store.put(key, data).await.map_err(|e| self.classify(key, e))
            })
            .await
    }

    /// Upload `data` in sequential parts; nothing is visible until the final
    /// `complete`. Any failure aborts the upload.
    async fn put_multipart(&self, key: &str, data: &[u8]) -> Result<(), TierError> {
        let part_size = self.options.max_single_part_upload_size as usize;
        let retry = self.options.write_retry;

        let upload = retry
            .run("create_multipart", move || async move {
                self.store
                    .create_multipart(key)
                    .await
                    .map_err(|e| self.classify(key, e))
            })
            .await
            .map_err(|e| upload_failed(key, 0, e))?;
        let mut guard = AbortOnDrop::new(self.store.clone(), upload.clone());

        let parts = data.chunks(part_size).count() as u32;
        debug!(disk = %self.name, key, parts, upload = %upload.0, "multipart upload started");

        for (idx, chunk) in data.chunks(part_size).enumerate() {
            let part = idx as u32 + 1;
            let upload = &upload;
            let res = retry
                .run("upload_part", move || async move {
                    self.store
                        .upload_part(upload, part, chunk)
                        .await
                        .map_err(|e| self.classify(key, e))
                })
                .await;
            if let Err(e) = res {
                guard.disarm();
                self.abort(upload, key).await;
                return Err(upload_failed(key, part, e));
            }
        }

        let upload_ref = &upload;
        let completed = retry
            .run("complete_multipart", move || async move {
                self.store
                    .complete_multipart(upload_ref)
                    .await
                    .map_err(|e| self.classify(key, e))
            })
            .await;
        guard.disarm();
        if let Err(e) = completed {
            self.abort(&upload, key).await;
            return Err(upload_failed(key, parts, e));
        }
        Ok(())
    }

    async fn abort(&self, upload: &UploadId, key: &str) {
        if let Err(e) = self.store.abort_multipart(upload).await {
            warn!(disk = %self.name, key, upload = %upload.0, error = %e, "failed to abort multipart upload");
        } else {
            warn!(disk = %self.name, key, upload = %upload.0, "aborted multipart upload");
        }
    }
}

fn upload_failed(key: &str, part: u32, err: TierError) -> TierError {
    match err {
        e @ TierError::NotEnoughSpace { .. } => e,
        e => TierError::UploadFailed {
            key: key.to_string(),
            part,
            reason: e.to_string(),
        },
    }
}

/// Aborts a multipart upload whose write future was dropped mid-flight
/// (deadline or cancellation), so no orphaned parts linger on the backend.
struct AbortOnDrop {
    store: Arc<dyn ObjectStore>,
    upload: Option<UploadId>,
}

impl AbortOnDrop {
    fn new(store: Arc<dyn ObjectStore>, upload: UploadId) -> Self {
        Self {
            store,
            upload: Some(upload),
        }
    }

    fn disarm(&mut self) {
        self.upload = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(upload) = self.upload.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            handle.spawn(async move {
                let _ = store.abort_multipart(&upload).await;
            });
        }
    }
}

#[async_trait]
impl Disk for RetryingObjectStoreDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DiskKind {
        DiskKind::RemoteObject
    }

    fn capabilities(&self) -> DiskCapabilities {
        DiskCapabilities {
            supports_delete: self.options.supports_delete,
        }
    }

    fn space(&self) -> DiskSpace {
        self.ledger.space(self.slot)
    }

    fn reserve(&self, bytes: u64) -> Result<Reservation, TierError> {
        self.ledger.try_reserve(self.slot, bytes)
    }

    fn release(&self, reservation: Reservation) {
        if reservation.disk() != self.name {
            warn!(
                disk = %self.name,
                owner = reservation.disk(),
                id = %reservation.id(),
                "reservation released through the wrong disk"
            );
        }
        self.ledger.release(reservation);
    }

    async fn write(
        &self,
        key: &str,
        data: &[u8],
        reservation: &Reservation,
    ) -> Result<(), TierError> {
        reservation.check_covers(&self.name, data.len() as u64)?;

        // Only quota-enforced disks track usage closely enough to need this.
        let replaced = match self.options.quota_bytes {
            Some(_) => self.head(key).await?,
            None => None,
        };

        if data.len() as u64 > self.options.max_single_part_upload_size {
            self.put_multipart(key, data).await?;
        } else {
            self.put_single(key, data).await?;
        }

        self.ledger.commit(reservation, data.len() as u64);
        if let Some(old) = replaced {
            self.ledger.credit(self.slot, old);
        }
        debug!(disk = %self.name, key, bytes = data.len(), "wrote object");
        Ok(())
    }

    async fn read(&self, key: &str, range: ByteRange) -> Result<Vec<u8>, TierError> {
        self.options
            .read_retry
            .run("get", move || async move {
                let res = if range.is_full() {
                    self.store.get(key).await
                } else {
                    self.store.get_range(key, range).await
                };
                res.map_err(|e| self.classify(key, e))
            })
            .await
    }

    async fn object_size(&self, key: &str) -> Result<u64, TierError> {
        self.head(key).await?.ok_or_else(|| TierError::NotFound {
            disk: self.name.clone(),
            key: key.to_string(),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, TierError> {
        Ok(self.head(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        if !self.options.supports_delete {
            return Err(TierError::UnsupportedOperation {
                disk: self.name.clone(),
                op: "delete",
            });
        }

        let size = match self.options.quota_bytes {
            Some(_) => self.head(key).await?,
            None => None,
        };

        self.options
            .write_retry
            .run("delete", move || async move {
                match self.store.delete(key).await {
                    Ok(()) | Err(ObjectStoreError::NotFound(_)) => Ok(()),
                    Err(e) => Err(self.classify(key, e)),
                }
            })
            .await?;

        if let Some(len) = size {
            self.ledger.credit(self.slot, len);
        }
        debug!(disk = %self.name, key, "deleted object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        let mut keys = self
            .options
            .read_retry
            .run("list", move || async move {
                self.store.list(prefix).await.map_err(|e| self.classify(prefix, e))
            })
            .await?;
        keys.sort();
        Ok(keys)
    }
}
