use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod context;
pub mod error;
pub mod settings;

pub use context::OpContext;
pub use error::{ObjectStoreError, TierError};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Opaque part identifier, unique within a table.
pub type PartId = String;

/// Index of a disk inside a `ReservationLedger` arena.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DiskSlot(pub u32);

/// Process-unique reservation identifier (monotonic, never reused).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskKind {
    Local,
    RemoteObject,
}

impl fmt::Display for DiskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskKind::Local => write!(f, "local"),
            DiskKind::RemoteObject => write!(f, "remote-object"),
        }
    }
}

/// Capability flags, fixed when a disk is constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskCapabilities {
    pub supports_delete: bool,
}

/// Storage format of a part. Chosen by the table engine, carried as a tag here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartFormat {
    Wide,
    Compact,
}

impl PartFormat {
    /// Pick the format for a part of `size` bytes given the wide-part threshold.
    pub fn for_size(size: u64, min_bytes_for_wide_part: u64) -> Self {
        if size >= min_bytes_for_wide_part {
            PartFormat::Wide
        } else {
            PartFormat::Compact
        }
    }
}

impl fmt::Display for PartFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartFormat::Wide => write!(f, "wide"),
            PartFormat::Compact => write!(f, "compact"),
        }
    }
}

// ---------------------------------------------------------------------------
// Byte ranges
// ---------------------------------------------------------------------------

/// A byte range within an object. `len == None` means "to the end".
///
/// Ranges past the end of an object are clamped, like an HTTP range read:
/// an offset beyond the object yields an empty result rather than an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub len: Option<u64>,
}

impl ByteRange {
    pub const FULL: ByteRange = ByteRange { offset: 0, len: None };

    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len: Some(len) }
    }

    pub fn from_offset(offset: u64) -> Self {
        Self { offset, len: None }
    }

    pub fn is_full(&self) -> bool {
        self.offset == 0 && self.len.is_none()
    }

    /// Resolve against an object of `size` bytes into `[start, end)`.
    pub fn resolve(&self, size: u64) -> (u64, u64) {
        let start = self.offset.min(size);
        let end = match self.len {
            Some(len) => start.saturating_add(len).min(size),
            None => size,
        };
        (start, end)
    }

    /// Slice `data` (a whole object) down to this range.
    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let (start, end) = self.resolve(data.len() as u64);
        &data[start as usize..end as usize]
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.len {
            Some(len) => write!(f, "[{}..+{}]", self.offset, len),
            None => write!(f, "[{}..]", self.offset),
        }
    }
}

// ---------------------------------------------------------------------------
// Space accounting
// ---------------------------------------------------------------------------

/// Point-in-time space report for a disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiskSpace {
    /// Usable capacity, `None` when the backend does not report one.
    pub capacity: Option<u64>,
    /// Durable bytes stored.
    pub used: u64,
    /// Bytes claimed by in-flight reservations.
    pub reserved: u64,
}

impl DiskSpace {
    /// Bytes still available for new reservations, if capacity is known.
    pub fn unreserved(&self) -> Option<u64> {
        self.capacity
            .map(|cap| cap.saturating_sub(self.used.saturating_add(self.reserved)))
    }
}

/// Takes back the unused share of a reservation.
pub trait ReservationOwner: Send + Sync {
    /// Called exactly once, when `reservation` is dropped.
    fn return_reservation(&self, reservation: &Reservation);
}

/// A temporary claim on disk space, held between "space requested" and
/// "write completed or aborted".
///
/// Dropping a reservation returns its outstanding bytes to the owner that
/// issued it, so a claim cannot outlive the future holding it.
pub struct Reservation {
    id: ReservationId,
    disk: String,
    slot: DiskSlot,
    bytes: u64,
    /// Bytes already converted into durable usage by a completed write.
    committed: AtomicU64,
    created_at: Instant,
    owner: Arc<dyn ReservationOwner>,
}

impl Reservation {
    pub fn new(
        id: ReservationId,
        disk: &str,
        slot: DiskSlot,
        bytes: u64,
        owner: Arc<dyn ReservationOwner>,
    ) -> Self {
        Self {
            id,
            disk: disk.to_string(),
            slot,
            bytes,
            committed: AtomicU64::new(0),
            created_at: Instant::now(),
            owner,
        }
    }

    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn disk(&self) -> &str {
        &self.disk
    }

    pub fn slot(&self) -> DiskSlot {
        self.slot
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Bytes still held as an in-flight claim.
    pub fn outstanding(&self) -> u64 {
        self.bytes.saturating_sub(self.committed())
    }

    /// Move up to `bytes` of this claim into the committed share and return
    /// how much was actually moved.
    pub fn commit(&self, bytes: u64) -> u64 {
        let mut moved = 0;
        let _ = self
            .committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                moved = bytes.min(self.bytes.saturating_sub(c));
                Some(c + moved)
            });
        moved
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Check this reservation may back a write of `len` bytes to `disk`.
    pub fn check_covers(&self, disk: &str, len: u64) -> Result<(), TierError> {
        if self.disk != disk {
            return Err(TierError::InvalidReservation(format!(
                "reservation {} belongs to disk {}, not {disk}",
                self.id, self.disk
            )));
        }
        if len > self.outstanding() {
            return Err(TierError::InvalidReservation(format!(
                "reservation {} has {} uncommitted bytes, write needs {len}",
                self.id,
                self.outstanding()
            )));
        }
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let owner = self.owner.clone();
        owner.return_reservation(self);
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("disk", &self.disk)
            .field("slot", &self.slot)
            .field("bytes", &self.bytes)
            .field("committed", &self.committed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Disk trait: the uniform capability surface every backend and decorator implements
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Disk: Send + Sync {
    /// Unique name within the process.
    fn name(&self) -> &str;

    fn kind(&self) -> DiskKind;

    fn capabilities(&self) -> DiskCapabilities;

    /// Current capacity/usage/reservation snapshot.
    fn space(&self) -> DiskSpace;

    /// Claim `bytes` of space. Fails with `NotEnoughSpace` when the disk knows
    /// it cannot hold them.
    fn reserve(&self, bytes: u64) -> Result<Reservation, TierError>;

    /// Return a reservation's space to the disk.
    fn release(&self, reservation: Reservation);

    /// Store `data` under `key`. The object becomes visible atomically.
    async fn write(&self, key: &str, data: &[u8], reservation: &Reservation)
        -> Result<(), TierError>;

    async fn read(&self, key: &str, range: ByteRange) -> Result<Vec<u8>, TierError>;

    /// Read the whole object from the backing store, skipping any cache
    /// layer. Used to verify what was actually persisted.
    async fn read_durable(&self, key: &str) -> Result<Vec<u8>, TierError> {
        self.read(key, ByteRange::FULL).await
    }

    async fn object_size(&self, key: &str) -> Result<u64, TierError>;

    async fn exists(&self, key: &str) -> Result<bool, TierError>;

    /// Remove `key`. Always `UnsupportedOperation` on a no-delete disk.
    async fn delete(&self, key: &str) -> Result<(), TierError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, TierError>;
}

// ---------------------------------------------------------------------------
// ObjectStore trait: the remote transport boundary
// ---------------------------------------------------------------------------

/// Handle for an in-progress multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UploadId(pub String);

/// Raw remote-object protocol (get/put/list/delete plus multipart uploads).
///
/// Implementations make a single attempt per call; retrying is the disk's job.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    async fn get_range(&self, key: &str, range: ByteRange) -> Result<Vec<u8>, ObjectStoreError>;

    /// Object size in bytes, `NotFound` if absent.
    async fn head(&self, key: &str) -> Result<u64, ObjectStoreError>;

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    async fn create_multipart(&self, key: &str) -> Result<UploadId, ObjectStoreError>;

    /// Upload part `part_number` (1-based). Re-uploading a number replaces it.
    async fn upload_part(
        &self,
        upload: &UploadId,
        part_number: u32,
        data: &[u8],
    ) -> Result<(), ObjectStoreError>;

    /// Assemble all parts in order and make the object visible.
    async fn complete_multipart(&self, upload: &UploadId) -> Result<(), ObjectStoreError>;

    async fn abort_multipart(&self, upload: &UploadId) -> Result<(), ObjectStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_resolve_clamps() {
        assert_eq!(ByteRange::FULL.resolve(10), (0, 10));
        assert_eq!(ByteRange::new(2, 3).resolve(10), (2, 5));
        assert_eq!(ByteRange::new(8, 5).resolve(10), (8, 10));
        assert_eq!(ByteRange::from_offset(12).resolve(10), (10, 10));
    }

    #[test]
    fn test_range_slice() {
        let data = b"hello world";
        assert_eq!(ByteRange::new(6, 5).slice(data), b"world");
        assert_eq!(ByteRange::from_offset(20).slice(data), b"");
        assert_eq!(ByteRange::FULL.slice(data), data);
    }

    #[test]
    fn test_part_format_threshold() {
        assert_eq!(PartFormat::for_size(100, 1000), PartFormat::Compact);
        assert_eq!(PartFormat::for_size(1000, 1000), PartFormat::Wide);
        assert_eq!(PartFormat::for_size(0, 0), PartFormat::Wide);
    }

    /// Records what each dropped reservation handed back.
    #[derive(Default)]
    struct Returned(std::sync::Mutex<Vec<(ReservationId, u64)>>);

    impl ReservationOwner for Returned {
        fn return_reservation(&self, reservation: &Reservation) {
            self.0
                .lock()
                .unwrap()
                .push((reservation.id(), reservation.outstanding()));
        }
    }

    fn reservation(id: u64, bytes: u64, owner: &Arc<Returned>) -> Reservation {
        Reservation::new(ReservationId(id), "local", DiskSlot(0), bytes, owner.clone())
    }

    #[test]
    fn test_reservation_covers() {
        let owner = Arc::new(Returned::default());
        let r = reservation(7, 100, &owner);
        assert!(r.check_covers("local", 100).is_ok());
        assert!(matches!(
            r.check_covers("local", 101),
            Err(TierError::InvalidReservation(_))
        ));
        assert!(matches!(
            r.check_covers("s3", 10),
            Err(TierError::InvalidReservation(_))
        ));
    }

    #[test]
    fn test_reservation_commit_is_bounded() {
        let owner = Arc::new(Returned::default());
        let r = reservation(1, 100, &owner);
        assert_eq!(r.commit(60), 60);
        assert_eq!(r.outstanding(), 40);
        assert_eq!(r.commit(60), 40);
        assert_eq!(r.outstanding(), 0);
        assert_eq!(r.committed(), 100);
    }

    #[test]
    fn test_drop_returns_outstanding_bytes_once() {
        let owner = Arc::new(Returned::default());
        let r = reservation(3, 100, &owner);
        r.commit(30);
        assert!(owner.0.lock().unwrap().is_empty());

        drop(r);
        assert_eq!(*owner.0.lock().unwrap(), vec![(ReservationId(3), 70)]);
    }

    #[test]
    fn test_unreserved_space() {
        let space = DiskSpace { capacity: Some(100), used: 40, reserved: 30 };
        assert_eq!(space.unreserved(), Some(30));
        let over = DiskSpace { capacity: Some(100), used: 90, reserved: 30 };
        assert_eq!(over.unreserved(), Some(0));
        assert_eq!(DiskSpace::default().unreserved(), None);
    }
}
