use crate::PartId;

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TierError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not enough space on disk {disk}: requested {requested} bytes, {available} available")]
    NotEnoughSpace {
        disk: String,
        requested: u64,
        available: u64,
    },

    #[error("no disk in volume {volume} can hold {requested} bytes")]
    NoDiskAvailable { volume: String, requested: u64 },

    #[error("part of {size} bytes exceeds max_part_size {max} of volume {volume}")]
    ExceedsMaxPartSize { volume: String, size: u64, max: u64 },

    #[error("no volume in policy {policy} can hold {requested} bytes")]
    NoSpace { policy: String, requested: u64 },

    #[error("operation {op} is not supported by disk {disk}")]
    UnsupportedOperation { disk: String, op: &'static str },

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("I/O failed after {attempts} attempts: {last}")]
    IoFailure { attempts: u32, last: String },

    #[error("upload of {key} failed at part {part}: {reason}")]
    UploadFailed {
        key: String,
        part: u32,
        reason: String,
    },

    #[error("move of part {part} failed: {reason}")]
    MoveFailed { part: PartId, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("object {key} not found on disk {disk}")]
    NotFound { disk: String, key: String },

    #[error("invalid object key {0:?}")]
    InvalidKey(String),

    #[error("invalid reservation: {0}")]
    InvalidReservation(String),

    #[error("unknown storage policy {0}")]
    UnknownPolicy(String),

    #[error("volume {volume} is not part of policy {policy}")]
    UnknownVolume { policy: String, volume: String },

    #[error("unknown part {0}")]
    UnknownPart(PartId),

    #[error("part {0} already exists")]
    DuplicatePart(PartId),

    #[error("part {0} is busy with another operation")]
    PartBusy(PartId),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,
}

impl TierError {
    /// Errors worth another attempt against the same backend.
    pub fn is_transient(&self) -> bool {
        matches!(self, TierError::Transient(_))
    }

    /// Space errors that a caller may answer by trying another volume or policy.
    pub fn is_space_error(&self) -> bool {
        matches!(
            self,
            TierError::NotEnoughSpace { .. }
                | TierError::NoDiskAvailable { .. }
                | TierError::ExceedsMaxPartSize { .. }
                | TierError::NoSpace { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Errors reported by an `ObjectStore` transport for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("request timed out")]
    Timeout,

    #[error("connection reset")]
    ConnectionReset,

    #[error("server error {0}")]
    Server(u16),

    #[error("object {0} not found")]
    NotFound(String),

    #[error("access denied")]
    AccessDenied,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("unknown upload {0}")]
    NoSuchUpload(String),

    #[error("{0}")]
    Other(String),
}

impl ObjectStoreError {
    /// Timeouts, resets and 5xx responses are retryable; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            ObjectStoreError::Timeout | ObjectStoreError::ConnectionReset => true,
            ObjectStoreError::Server(code) => (500..600).contains(code),
            _ => false,
        }
    }
}

impl From<ObjectStoreError> for TierError {
    fn from(err: ObjectStoreError) -> Self {
        if err.is_transient() {
            return TierError::Transient(err.to_string());
        }
        match err {
            ObjectStoreError::QuotaExceeded => TierError::NotEnoughSpace {
                disk: String::new(),
                requested: 0,
                available: 0,
            },
            other => TierError::Backend(other.to_string()),
        }
    }
}
