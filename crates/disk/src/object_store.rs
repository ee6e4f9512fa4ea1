use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tierstore_common::{ByteRange, ObjectStore, ObjectStoreError, UploadId};

/// Transport calls that can be counted and made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Head,
    Put,
    Delete,
    List,
    CreateMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
}

struct Fault {
    /// Calls to let through before failing.
    skip: u32,
    /// Failures left to inject.
    remaining: u32,
    error: ObjectStoreError,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    faults: HashMap<StoreOp, Vec<Fault>>,
    calls: HashMap<StoreOp, u64>,
    /// Bytes returned by get and get_range.
    served: u64,
    quota: Option<u64>,
}

/// In-process object store with scripted failures and injected latency.
///
/// Stands in for a real remote backend: objects are only visible once a
/// `put` or `complete_multipart` finishes, and every call can be made to fail
/// a given number of times to exercise retry and atomicity paths.
pub struct MemoryObjectStore {
    state: Mutex<State>,
    latency: Duration,
    next_upload: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Every call sleeps for `latency` before touching state.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            latency,
            next_upload: AtomicU64::new(1),
        }
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: StoreOp, times: u32, error: ObjectStoreError) {
        self.fail_after(op, 0, times, error);
    }

    /// Let `skip` calls of `op` succeed, then fail the following `times`.
    pub fn fail_after(&self, op: StoreOp, skip: u32, times: u32, error: ObjectStoreError) {
        let mut state = self.state.lock().unwrap();
        state.faults.entry(op).or_default().push(Fault {
            skip,
            remaining: times,
            error,
        });
    }

    /// Reject puts that would grow the stored total past `bytes`.
    pub fn set_quota(&self, bytes: Option<u64>) {
        self.state.lock().unwrap().quota = bytes;
    }

    pub fn calls(&self, op: StoreOp) -> u64 {
        self.state.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    /// Total bytes handed out by successful reads.
    pub fn bytes_served(&self) -> u64 {
        self.state.lock().unwrap().served
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn pending_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    /// Direct peek at stored bytes, bypassing faults and counters.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    async fn enter(&self, op: StoreOp) -> Result<(), ObjectStoreError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(faults) = state.faults.get_mut(&op) {
            if let Some(fault) = faults.first_mut() {
                if fault.skip > 0 {
                    fault.skip -= 1;
                } else {
                    let error = fault.error.clone();
                    fault.remaining = fault.remaining.saturating_sub(1);
                    if fault.remaining == 0 {
                        faults.remove(0);
                    }
                    return Err(error);
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_quota(state: &State, key: &str, new_len: u64) -> Result<(), ObjectStoreError> {
    let Some(quota) = state.quota else {
        return Ok(());
    };
    let stored: u64 = state.objects.values().map(|v| v.len() as u64).sum();
    let replaced = state.objects.get(key).map(|v| v.len() as u64).unwrap_or(0);
    if stored - replaced + new_len > quota {
        return Err(ObjectStoreError::QuotaExceeded);
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.enter(StoreOp::Get).await?;
        let mut state = self.state.lock().unwrap();
        let data = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        state.served += data.len() as u64;
        Ok(data)
    }

    async fn get_range(&self, key: &str, range: ByteRange) -> Result<Vec<u8>, ObjectStoreError> {
        self.enter(StoreOp::Get).await?;
        let mut state = self.state.lock().unwrap();
        let data = state
            .objects
            .get(key)
            .map(|data| range.slice(data).to_vec())
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        state.served += data.len() as u64;
        Ok(data)
    }

    async fn head(&self, key: &str) -> Result<u64, ObjectStoreError> {
        self.enter(StoreOp::Head).await?;
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(key)
            .map(|v| v.len() as u64)
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), ObjectStoreError> {
        self.enter(StoreOp::Put).await?;
        let mut state = self.state.lock().unwrap();
        check_quota(&state, key, data.len() as u64)?;
        state.objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.enter(StoreOp::Delete).await?;
        let mut state = self.state.lock().unwrap();
        state.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        self.enter(StoreOp::List).await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn create_multipart(&self, key: &str) -> Result<UploadId, ObjectStoreError> {
        self.enter(StoreOp::CreateMultipart).await?;
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock().unwrap();
        state.uploads.insert(
            id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(UploadId(id))
    }

    async fn upload_part(
        &self,
        upload: &UploadId,
        part_number: u32,
        data: &[u8],
    ) -> Result<(), ObjectStoreError> {
        self.enter(StoreOp::UploadPart).await?;
        let mut state = self.state.lock().unwrap();
        let pending = state
            .uploads
            .get_mut(&upload.0)
            .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload.0.clone()))?;
        pending.parts.insert(part_number, data.to_vec());
        Ok(())
    }

    async fn complete_multipart(&self, upload: &UploadId) -> Result<(), ObjectStoreError> {
        self.enter(StoreOp::CompleteMultipart).await?;
        let mut state = self.state.lock().unwrap();
        let pending = state
            .uploads
            .remove(&upload.0)
            .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload.0.clone()))?;
        let data: Vec<u8> = pending.parts.into_values().flatten().collect();
        check_quota(&state, &pending.key, data.len() as u64)?;
        state.objects.insert(pending.key, data);
        Ok(())
    }

    async fn abort_multipart(&self, upload: &UploadId) -> Result<(), ObjectStoreError> {
        self.enter(StoreOp::AbortMultipart).await?;
        let mut state = self.state.lock().unwrap();
        state.uploads.remove(&upload.0);
        Ok(())
    }
}
