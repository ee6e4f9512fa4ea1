use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tierstore_common::settings::VolumeSelection;
use tierstore_common::{Disk, DiskSpace, Reservation, TierError};
use tracing::debug;

/// Ordered failover group of disks, presented as one allocation target.
pub struct Volume {
    name: String,
    disks: Vec<Arc<dyn Disk>>,
    max_part_size: Option<u64>,
    selection: VolumeSelection,
    /// Next starting disk for round-robin selection.
    cursor: AtomicUsize,
}

impl Volume {
    pub fn new(
        name: &str,
        disks: Vec<Arc<dyn Disk>>,
        max_part_size: Option<u64>,
        selection: VolumeSelection,
    ) -> Result<Self, TierError> {
        if disks.is_empty() {
            return Err(TierError::Config(format!("volume {name} has no disks")));
        }
        Ok(Self {
            name: name.to_string(),
            disks,
            max_part_size,
            selection,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn disks(&self) -> &[Arc<dyn Disk>] {
        &self.disks
    }

    pub fn max_part_size(&self) -> Option<u64> {
        self.max_part_size
    }

    pub fn selection(&self) -> VolumeSelection {
        self.selection
    }

    pub fn contains_disk(&self, disk: &str) -> bool {
        self.disks.iter().any(|d| d.name() == disk)
    }

    /// Reserve `bytes` on the first disk that can take them.
    ///
    /// First-fit walks disks in configured order; round-robin starts from a
    /// cursor that advances on every call. Non-space errors from a disk stop
    /// the walk.
    pub fn reserve(&self, bytes: u64) -> Result<(Arc<dyn Disk>, Reservation), TierError> {
        if let Some(max) = self.max_part_size {
            if bytes > max {
                return Err(TierError::ExceedsMaxPartSize {
                    volume: self.name.clone(),
                    size: bytes,
                    max,
                });
            }
        }

        let n = self.disks.len();
        let start = match self.selection {
            VolumeSelection::FirstFit => 0,
            VolumeSelection::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % n,
        };
        for i in 0..n {
            let disk = &self.disks[(start + i) % n];
            match disk.reserve(bytes) {
                Ok(reservation) => {
                    debug!(volume = %self.name, disk = disk.name(), bytes, "volume reserved");
                    return Ok((disk.clone(), reservation));
                }
                Err(e) if e.is_space_error() => {
                    debug!(volume = %self.name, disk = disk.name(), bytes, error = %e, "disk full, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Err(TierError::NoDiskAvailable {
            volume: self.name.clone(),
            requested: bytes,
        })
    }

    /// Sum over member disks. Capacity is unknown if any disk's is.
    pub fn space(&self) -> DiskSpace {
        self.disks
            .iter()
            .map(|d| d.space())
            .fold(
                DiskSpace {
                    capacity: Some(0),
                    used: 0,
                    reserved: 0,
                },
                |acc, s| DiskSpace {
                    capacity: acc.capacity.zip(s.capacity).map(|(a, b)| a + b),
                    used: acc.used + s.used,
                    reserved: acc.reserved + s.reserved,
                },
            )
    }

    /// Unreserved fraction of capacity, `None` when capacity is unknown.
    pub fn free_ratio(&self) -> Option<f64> {
        let space = self.space();
        let capacity = space.capacity?;
        if capacity == 0 {
            return Some(0.0);
        }
        Some(space.unreserved()? as f64 / capacity as f64)
    }
}
