//! Typed storage configuration, materialised from TOML.
//!
//! Layout mirrors the on-disk file: `[disks.<name>]`, `[volumes.<name>]`,
//! `[policies.<name>]` and `[merge_tree]`. Cross-references between sections
//! are validated when the registry is built, not here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::TierError;

pub const DEFAULT_MAX_SINGLE_PART_UPLOAD_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_MAX_SINGLE_READ_RETRIES: u32 = 4;
pub const DEFAULT_MAX_WRITE_RETRIES: u32 = 4;
pub const DEFAULT_MOVE_FACTOR: f64 = 0.1;
pub const DEFAULT_MIN_BYTES_FOR_WIDE_PART: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub disks: BTreeMap<String, DiskSettings>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeSettings>,
    #[serde(default)]
    pub policies: BTreeMap<String, PolicySettings>,
    #[serde(default)]
    pub merge_tree: MergeTreeSettings,
}

impl StorageConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, TierError> {
        toml::from_str(content).map_err(|e| TierError::Config(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Disks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DiskSettings {
    Local(LocalDiskSettings),
    RemoteObject(RemoteDiskSettings),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalDiskSettings {
    pub path: PathBuf,
    /// Logical capacity of the disk in bytes.
    pub capacity_bytes: u64,
    /// Headroom that reservations may never consume.
    #[serde(default)]
    pub keep_free_space_bytes: u64,
    /// Accepted only so that the registry can reject it: local disks are
    /// never cached.
    #[serde(default)]
    pub cache_enabled: bool,
}

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDiskSettings {
    pub endpoint: String,
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default = "default_true")]
    pub supports_delete: bool,
    #[serde(default = "default_max_single_part_upload_size")]
    pub max_single_part_upload_size: u64,
    #[serde(default = "default_max_single_read_retries")]
    pub max_single_read_retries: u32,
    #[serde(default = "default_max_write_retries")]
    pub max_unexpected_write_error_retries: u32,
    /// Hard logical quota. Without one, reservations are optimistic.
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    #[serde(default)]
    pub retry_backoff: Backoff,
    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default)]
    pub cache_max_bytes: u64,
    #[serde(default)]
    pub cache_granularity: CacheGranularity,
    #[serde(default)]
    pub cache_populate_on_write: bool,
}

/// Delay schedule between attempts of a retried remote call.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Backoff {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: 100,
            max_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// What a cache entry holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheGranularity {
    /// The whole object; ranged misses fetch the full object and slice it.
    #[default]
    WholeObject,
    /// Exactly the bytes requested, keyed by range.
    ByteRange,
}

// ---------------------------------------------------------------------------
// Volumes and policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeSelection {
    #[default]
    FirstFit,
    RoundRobin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeSettings {
    /// Disk names in preference order.
    pub disks: Vec<String>,
    #[serde(default)]
    pub max_part_size: Option<u64>,
    #[serde(default)]
    pub selection: VolumeSelection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySettings {
    /// Volume names in tier order; the first one receives new parts.
    pub volumes: Vec<String>,
    #[serde(default = "default_move_factor")]
    pub move_factor: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeTreeSettings {
    #[serde(default = "default_min_bytes_for_wide_part")]
    pub min_bytes_for_wide_part: u64,
}

impl Default for MergeTreeSettings {
    fn default() -> Self {
        Self {
            min_bytes_for_wide_part: DEFAULT_MIN_BYTES_FOR_WIDE_PART,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_single_part_upload_size() -> u64 {
    DEFAULT_MAX_SINGLE_PART_UPLOAD_SIZE
}

fn default_max_single_read_retries() -> u32 {
    DEFAULT_MAX_SINGLE_READ_RETRIES
}

fn default_max_write_retries() -> u32 {
    DEFAULT_MAX_WRITE_RETRIES
}

fn default_move_factor() -> f64 {
    DEFAULT_MOVE_FACTOR
}

fn default_min_bytes_for_wide_part() -> u64 {
    DEFAULT_MIN_BYTES_FOR_WIDE_PART
}
