use std::fs;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tierstore_common::settings::LocalDiskSettings;
use tierstore_common::{
    ByteRange, Disk, DiskCapabilities, DiskKind, DiskSlot, DiskSpace, Reservation, TierError,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::ledger::ReservationLedger;

/// Suffix of in-progress writes; such files are never visible as objects.
const TEMP_MARKER: &str = ".tmp-";

/// Disk backed by a directory on the local filesystem.
///
/// Capacity is the configured logical size minus `keep_free_space_bytes`;
/// usage is measured once at open and then kept current by writes and
/// deletes. Objects are written to a temp file and renamed into place.
pub struct LocalDisk {
    name: String,
    root: PathBuf,
    ledger: Arc<ReservationLedger>,
    slot: DiskSlot,
}

impl LocalDisk {
    /// Open (or create) a local disk rooted at `settings.path`.
    ///
    /// Leftover temp files from interrupted writes are removed before usage
    /// is measured.
    pub fn open(
        name: &str,
        settings: &LocalDiskSettings,
        ledger: Arc<ReservationLedger>,
    ) -> Result<Self, TierError> {
        let root = settings.path.clone();
        fs::create_dir_all(&root)?;

        let mut objects = Vec::new();
        let mut stale = Vec::new();
        scan(&root, &root, &mut objects, &mut stale)?;
        for path in &stale {
            warn!(disk = name, path = %path.display(), "removing interrupted write");
            fs::remove_file(path)?;
        }
        let used: u64 = objects.iter().map(|(_, len)| len).sum();

        let capacity = settings
            .capacity_bytes
            .saturating_sub(settings.keep_free_space_bytes);
        let slot = ledger.register(name, Some(capacity));
        ledger.set_used(slot, used);

        info!(
            disk = name,
            root = %root.display(),
            capacity,
            used,
            objects = objects.len(),
            "opened local disk"
        );

        Ok(Self {
            name: name.to_string(),
            root,
            ledger,
            slot,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, TierError> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && !key.contains(TEMP_MARKER)
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(TierError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn not_found(&self, key: &str) -> TierError {
        TierError::NotFound {
            disk: self.name.clone(),
            key: key.to_string(),
        }
    }

    async fn existing_len(path: &Path) -> Result<Option<u64>, TierError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Disk for LocalDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DiskKind {
        DiskKind::Local
    }

    fn capabilities(&self) -> DiskCapabilities {
        DiskCapabilities {
            supports_delete: true,
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
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(format!("{TEMP_MARKER}{}", reservation.id().0));
        let tmp = PathBuf::from(tmp_name);

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let replaced = Self::existing_len(&path).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        self.ledger.commit(reservation, data.len() as u64);
        if let Some(old) = replaced {
            self.ledger.credit(self.slot, old);
        }
        debug!(disk = %self.name, key, bytes = data.len(), "wrote object");
        Ok(())
    }

    async fn read(&self, key: &str, range: ByteRange) -> Result<Vec<u8>, TierError> {
        let path = self.object_path(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(self.not_found(key)),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        let (start, end) = range.resolve(size);
        let mut buf = vec![0u8; (end - start) as usize];
        if !buf.is_empty() {
            file.seek(SeekFrom::Start(start)).await?;
            file.read_exact(&mut buf).await?;
        }
        Ok(buf)
    }

    async fn object_size(&self, key: &str) -> Result<u64, TierError> {
        let path = self.object_path(key)?;
        Self::existing_len(&path)
            .await?
            .ok_or_else(|| self.not_found(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, TierError> {
        let path = self.object_path(key)?;
        Ok(Self::existing_len(&path).await?.is_some())
    }

    /// Deleting an absent key succeeds, matching object-store semantics.
    async fn delete(&self, key: &str) -> Result<(), TierError> {
        let path = self.object_path(key)?;
        let Some(len) = Self::existing_len(&path).await? else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.ledger.credit(self.slot, len);
                debug!(disk = %self.name, key, bytes = len, "deleted object");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        let root = self.root.clone();
        let objects = tokio::task::spawn_blocking(move || {
            let mut objects = Vec::new();
            let mut stale = Vec::new();
            scan(&root, &root, &mut objects, &mut stale).map(|()| objects)
        })
        .await
        .map_err(|e| TierError::Backend(format!("directory scan of {} failed: {e}", self.name)))??;
        let mut keys: Vec<String> = objects
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Recursively collect `(key, len)` for every object under `dir`, and the
/// paths of temp files left by interrupted writes.
fn scan(
    root: &Path,
    dir: &Path,
    objects: &mut Vec<(String, u64)>,
    stale: &mut Vec<PathBuf>,
) -> Result<(), std::io::Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            scan(root, &path, objects, stale)?;
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.contains(TEMP_MARKER) {
            stale.push(path);
        } else {
            objects.push((key, meta.len()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, capacity: u64) -> LocalDiskSettings {
        LocalDiskSettings {
            path: dir.path().join("disk"),
            capacity_bytes: capacity,
            keep_free_space_bytes: 0,
            cache_enabled: false,
        }
    }

    fn open(dir: &TempDir, capacity: u64) -> LocalDisk {
        LocalDisk::open("local", &settings(dir, capacity), Arc::new(ReservationLedger::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1024);

        let r = disk.reserve(11).unwrap();
        disk.write("t1/all_1_1_0", b"hello local", &r).await.unwrap();
        disk.release(r);

        assert_eq!(disk.read("t1/all_1_1_0", ByteRange::FULL).await.unwrap(), b"hello local");
        assert_eq!(disk.read("t1/all_1_1_0", ByteRange::new(6, 5)).await.unwrap(), b"local");
        assert_eq!(disk.object_size("t1/all_1_1_0").await.unwrap(), 11);
        assert!(disk.exists("t1/all_1_1_0").await.unwrap());

        let space = disk.space();
        assert_eq!(space.used, 11);
        assert_eq!(space.reserved, 0);
    }

    #[tokio::test]
    async fn test_reserve_respects_capacity_and_keep_free() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(&dir, 100);
        s.keep_free_space_bytes = 20;
        let disk = LocalDisk::open("local", &s, Arc::new(ReservationLedger::new())).unwrap();

        assert!(matches!(
            disk.reserve(81),
            Err(TierError::NotEnoughSpace { available: 80, .. })
        ));
        let r = disk.reserve(80).unwrap();
        assert!(disk.reserve(1).is_err());
        disk.release(r);
        assert!(disk.reserve(1).is_ok());
    }

    #[tokio::test]
    async fn test_write_requires_covering_reservation() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1024);
        let r = disk.reserve(2).unwrap();
        let res = disk.write("k", b"too long", &r).await;
        assert!(matches!(res, Err(TierError::InvalidReservation(_))));
        assert!(!disk.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_frees_space() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 10);
        let r = disk.reserve(10).unwrap();
        disk.write("k", &[7u8; 10], &r).await.unwrap();
        disk.release(r);
        assert!(disk.reserve(1).is_err());

        disk.delete("k").await.unwrap();
        assert!(!disk.exists("k").await.unwrap());
        assert!(disk.reserve(10).is_ok());
        disk.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 10);
        assert!(matches!(
            disk.read("nope", ByteRange::FULL).await,
            Err(TierError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 10);
        for key in ["", "../etc/passwd", "/abs", "./a", "x.tmp-3"] {
            assert!(
                matches!(disk.exists(key).await, Err(TierError::InvalidKey(_))),
                "{key} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_reopen_measures_usage_and_drops_temp_files() {
        let dir = TempDir::new().unwrap();
        {
            let disk = open(&dir, 1024);
            let r = disk.reserve(300).unwrap();
            disk.write("a/1", &[1u8; 100], &r).await.unwrap();
            disk.release(r);
            let r = disk.reserve(200).unwrap();
            disk.write("b/2", &[2u8; 200], &r).await.unwrap();
            disk.release(r);
        }
        std::fs::write(dir.path().join("disk/a/3.tmp-99"), [0u8; 50]).unwrap();

        let disk = open(&dir, 1024);
        assert_eq!(disk.space().used, 300);
        assert_eq!(disk.list("").await.unwrap(), vec!["a/1", "b/2"]);
        assert_eq!(disk.list("b/").await.unwrap(), vec!["b/2"]);
        assert!(!dir.path().join("disk/a/3.tmp-99").exists());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_usage() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1024);
        let r = disk.reserve(100).unwrap();
        disk.write("k", &[1u8; 100], &r).await.unwrap();
        disk.release(r);
        let r = disk.reserve(40).unwrap();
        disk.write("k", &[2u8; 40], &r).await.unwrap();
        disk.release(r);
        assert_eq!(disk.space().used, 40);
        assert_eq!(disk.read("k", ByteRange::FULL).await.unwrap(), vec![2u8; 40]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_lists_and_writes() {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(open(&dir, 1 << 20));
        for i in 0..50 {
            let r = disk.reserve(8).unwrap();
            disk.write(&format!("t/{i:02}"), &[i as u8; 8], &r).await.unwrap();
            disk.release(r);
        }

        let mut tasks = Vec::new();
        for w in 0..4 {
            let disk = disk.clone();
            tasks.push(tokio::spawn(async move {
                let r = disk.reserve(8).unwrap();
                disk.write(&format!("u/{w}"), &[0; 8], &r).await.unwrap();
                disk.release(r);
                disk.list("t/").await.unwrap()
            }));
        }
        for task in tasks {
            let keys = task.await.unwrap();
            assert_eq!(keys.len(), 50);
            assert_eq!(keys[0], "t/00");
        }
        assert_eq!(disk.list("u/").await.unwrap(), vec!["u/0", "u/1", "u/2", "u/3"]);
    }
}
