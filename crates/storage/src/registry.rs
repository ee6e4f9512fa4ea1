use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tierstore_cache::{CacheConfig, CachingDisk};
use tierstore_common::settings::{DiskSettings, MergeTreeSettings, RemoteDiskSettings, StorageConfig};
use tierstore_common::{Disk, ObjectStore, TierError};
use tierstore_disk::{LocalDisk, MemoryObjectStore, RemoteDiskOptions, ReservationLedger, RetryingObjectStoreDisk};
use tracing::info;

use crate::policy::StoragePolicy;
use crate::volume::Volume;

// ---------------------------------------------------------------------------
// Transport factory
// ---------------------------------------------------------------------------

/// Connects remote-object disks to their transport.
pub trait ObjectStoreFactory: Send + Sync {
    fn connect(&self, disk: &str, settings: &RemoteDiskSettings) -> Result<Arc<dyn ObjectStore>, TierError>;
}

/// In-process transport: one `MemoryObjectStore` per endpoint, shared by
/// every disk that names the same endpoint.
pub struct MemoryTransport {
    latency: Duration,
    stores: Mutex<HashMap<String, Arc<MemoryObjectStore>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// The store behind `endpoint`, created on first use.
    pub fn store(&self, endpoint: &str) -> Arc<MemoryObjectStore> {
        self.stores
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(MemoryObjectStore::with_latency(self.latency)))
            .clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStoreFactory for MemoryTransport {
    fn connect(&self, _disk: &str, settings: &RemoteDiskSettings) -> Result<Arc<dyn ObjectStore>, TierError> {
        Ok(self.store(&settings.endpoint))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable name -> entity tables built once from configuration.
pub struct StorageRegistry {
    ledger: Arc<ReservationLedger>,
    disks: BTreeMap<String, Arc<dyn Disk>>,
    volumes: BTreeMap<String, Arc<Volume>>,
    policies: BTreeMap<String, Arc<StoragePolicy>>,
    merge_tree: MergeTreeSettings,
}

impl StorageRegistry {
    /// Validate `config`, open every disk and wire volumes and policies.
    ///
    /// Validation runs before any disk is opened, so a rejected config has
    /// no side effects.
    pub fn from_config(config: &StorageConfig, factory: &dyn ObjectStoreFactory) -> Result<Self, TierError> {
        validate(config)?;

        let ledger = Arc::new(ReservationLedger::new());
        let mut disks: BTreeMap<String, Arc<dyn Disk>> = BTreeMap::new();
        for (name, settings) in &config.disks {
            let disk: Arc<dyn Disk> = match settings {
                DiskSettings::Local(local) => Arc::new(LocalDisk::open(name, local, ledger.clone())?),
                DiskSettings::RemoteObject(remote) => {
                    let store = factory.connect(name, remote)?;
                    let disk: Arc<dyn Disk> = Arc::new(RetryingObjectStoreDisk::new(
                        name,
                        store,
                        RemoteDiskOptions::from_settings(remote),
                        ledger.clone(),
                    ));
                    if remote.cache_enabled {
                        Arc::new(CachingDisk::new(disk, &CacheConfig::from_settings(remote))?)
                    } else {
                        disk
                    }
                }
            };
            disks.insert(name.clone(), disk);
        }

        let mut volumes = BTreeMap::new();
        for (name, settings) in &config.volumes {
            let members = settings.disks.iter().map(|d| disks[d].clone()).collect();
            let volume = Volume::new(name, members, settings.max_part_size, settings.selection)?;
            volumes.insert(name.clone(), Arc::new(volume));
        }

        let mut policies = BTreeMap::new();
        for (name, settings) in &config.policies {
            let members = settings.volumes.iter().map(|v| volumes[v].clone()).collect();
            let policy = StoragePolicy::new(name, members, settings.move_factor)?;
            policies.insert(name.clone(), Arc::new(policy));
        }

        info!(
            disks = disks.len(),
            volumes = volumes.len(),
            policies = policies.len(),
            "storage registry built"
        );

        Ok(Self {
            ledger,
            disks,
            volumes,
            policies,
            merge_tree: config.merge_tree,
        })
    }

    pub fn ledger(&self) -> &Arc<ReservationLedger> {
        &self.ledger
    }

    pub fn merge_tree(&self) -> &MergeTreeSettings {
        &self.merge_tree
    }

    pub fn disk(&self, name: &str) -> Option<&Arc<dyn Disk>> {
        self.disks.get(name)
    }

    pub fn disks(&self) -> impl Iterator<Item = &Arc<dyn Disk>> {
        self.disks.values()
    }

    pub fn volume(&self, name: &str) -> Option<&Arc<Volume>> {
        self.volumes.get(name)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Arc<Volume>> {
        self.volumes.values()
    }

    pub fn policy(&self, name: &str) -> Result<&Arc<StoragePolicy>, TierError> {
        self.policies
            .get(name)
            .ok_or_else(|| TierError::UnknownPolicy(name.to_string()))
    }

    pub fn policies(&self) -> impl Iterator<Item = &Arc<StoragePolicy>> {
        self.policies.values()
    }
}

fn validate(config: &StorageConfig) -> Result<(), TierError> {
    for (name, settings) in &config.disks {
        match settings {
            DiskSettings::Local(local) if local.cache_enabled => {
                return Err(TierError::Config(format!(
                    "disk {name}: cache is only supported on remote-object disks"
                )));
            }
            DiskSettings::RemoteObject(remote) if remote.cache_enabled && remote.cache_max_bytes == 0 => {
                return Err(TierError::Config(format!(
                    "disk {name}: cache enabled with cache_max_bytes = 0"
                )));
            }
            _ => {}
        }
    }

    for (name, volume) in &config.volumes {
        if volume.disks.is_empty() {
            return Err(TierError::Config(format!("volume {name} has no disks")));
        }
        if let Some(disk) = volume.disks.iter().find(|d| !config.disks.contains_key(*d)) {
            return Err(TierError::Config(format!(
                "volume {name} references unknown disk {disk}"
            )));
        }
    }

    for (name, policy) in &config.policies {
        if policy.volumes.is_empty() {
            return Err(TierError::Config(format!("policy {name} has no volumes")));
        }
        if let Some(volume) = policy.volumes.iter().find(|v| !config.volumes.contains_key(*v)) {
            return Err(TierError::Config(format!(
                "policy {name} references unknown volume {volume}"
            )));
        }
        if !(0.0..=1.0).contains(&policy.move_factor) {
            return Err(TierError::Config(format!(
                "policy {name}: move_factor {} is outside [0, 1]",
                policy.move_factor
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for disk in policy.volumes.iter().flat_map(|v| &config.volumes[v].disks) {
            if !seen.insert(disk) {
                return Err(TierError::Config(format!(
                    "policy {name}: disk {disk} appears more than once"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tierstore_common::DiskKind;

    fn config(dir: &TempDir, extra: &str) -> String {
        format!(
            r#"
            [disks.s3]
            type = "remote-object"
            endpoint = "mem://bucket"
            access_key = "k"
            secret_key = "s"
            cache_enabled = true
            cache_max_bytes = 1024

            [disks.local]
            type = "local"
            path = "{}"
            capacity_bytes = 4096

            [volumes.main]
            disks = ["s3"]

            [volumes.external]
            disks = ["local"]

            [policies.s3_main]
            volumes = ["main", "external"]
            {extra}
            "#,
            dir.path().join("local").display()
        )
    }

    fn build(toml: &str) -> Result<StorageRegistry, TierError> {
        let config = StorageConfig::from_toml_str(toml)?;
        StorageRegistry::from_config(&config, &MemoryTransport::new())
    }

    fn expect_config_error(toml: &str, needle: &str) {
        match build(toml) {
            Err(TierError::Config(msg)) => assert!(msg.contains(needle), "{msg}"),
            Err(other) => panic!("expected config error, got {other}"),
            Ok(_) => panic!("expected config error containing {needle:?}"),
        }
    }

    #[test]
    fn test_builds_from_config() {
        let dir = TempDir::new().unwrap();
        let registry = build(&config(&dir, "")).unwrap();

        assert_eq!(registry.disk("s3").unwrap().kind(), DiskKind::RemoteObject);
        assert_eq!(registry.disk("local").unwrap().kind(), DiskKind::Local);
        assert_eq!(registry.disk("local").unwrap().space().capacity, Some(4096));

        let policy = registry.policy("s3_main").unwrap();
        let names: Vec<&str> = policy.volumes().iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["main", "external"]);
        assert!(matches!(registry.policy("nope"), Err(TierError::UnknownPolicy(_))));
    }

    #[test]
    fn test_disks_on_same_endpoint_share_a_store() {
        let transport = MemoryTransport::new();
        let a = transport.store("mem://x");
        let b = transport.store("mem://x");
        let c = transport.store("mem://y");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_unknown_disk_in_volume() {
        let dir = TempDir::new().unwrap();
        let toml = config(&dir, "").replace(r#"disks = ["local"]"#, r#"disks = ["nvme"]"#);
        expect_config_error(&toml, "unknown disk nvme");
        assert!(!dir.path().join("local").exists());
    }

    #[test]
    fn test_unknown_volume_in_policy() {
        let dir = TempDir::new().unwrap();
        let toml = config(&dir, "").replace(r#"["main", "external"]"#, r#"["main", "cold"]"#);
        expect_config_error(&toml, "unknown volume cold");
    }

    #[test]
    fn test_empty_volume_and_policy() {
        let dir = TempDir::new().unwrap();
        expect_config_error(
            &config(&dir, "").replace(r#"disks = ["s3"]"#, "disks = []"),
            "volume main has no disks",
        );
        expect_config_error(
            &config(&dir, "").replace(r#"volumes = ["main", "external"]"#, "volumes = []"),
            "policy s3_main has no volumes",
        );
    }

    #[test]
    fn test_duplicate_disk_in_policy() {
        let dir = TempDir::new().unwrap();
        let toml = config(&dir, "").replace(r#"disks = ["local"]"#, r#"disks = ["local", "s3"]"#);
        expect_config_error(&toml, "disk s3 appears more than once");
    }

    #[test]
    fn test_move_factor_range() {
        let dir = TempDir::new().unwrap();
        expect_config_error(&config(&dir, "move_factor = 1.5"), "move_factor");
        expect_config_error(&config(&dir, "move_factor = -0.1"), "move_factor");
    }

    #[test]
    fn test_cache_settings_validated() {
        let dir = TempDir::new().unwrap();
        expect_config_error(
            &config(&dir, "").replace("cache_max_bytes = 1024", "cache_max_bytes = 0"),
            "cache_max_bytes = 0",
        );
        expect_config_error(
            &config(&dir, "").replace("capacity_bytes = 4096", "capacity_bytes = 4096\ncache_enabled = true"),
            "only supported on remote-object disks",
        );
    }
}
