use std::collections::HashSet;
use std::sync::Arc;

use tierstore_common::{Disk, Reservation, TierError};
use tracing::debug;

use crate::volume::Volume;

/// Where a new part's space was reserved.
pub struct PlacementResult {
    pub policy: String,
    pub volume: String,
    /// Position of `volume` in the policy, 0 for the default tier.
    pub volume_index: usize,
    pub disk: Arc<dyn Disk>,
    pub reservation: Reservation,
}

/// Named, ordered tier list of volumes. The first volume is the default
/// target for new parts.
pub struct StoragePolicy {
    name: String,
    volumes: Vec<Arc<Volume>>,
    move_factor: f64,
}

impl StoragePolicy {
    pub fn new(name: &str, volumes: Vec<Arc<Volume>>, move_factor: f64) -> Result<Self, TierError> {
        if volumes.is_empty() {
            return Err(TierError::Config(format!("policy {name} has no volumes")));
        }
        if !(0.0..=1.0).contains(&move_factor) {
            return Err(TierError::Config(format!(
                "policy {name}: move_factor {move_factor} is outside [0, 1]"
            )));
        }
        let mut seen = HashSet::new();
        for volume in &volumes {
            for disk in volume.disks() {
                if !seen.insert(disk.name().to_string()) {
                    return Err(TierError::Config(format!(
                        "policy {name}: disk {} appears in more than one volume",
                        disk.name()
                    )));
                }
            }
        }
        Ok(Self {
            name: name.to_string(),
            volumes,
            move_factor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volumes(&self) -> &[Arc<Volume>] {
        &self.volumes
    }

    pub fn move_factor(&self) -> f64 {
        self.move_factor
    }

    pub fn volume(&self, name: &str) -> Option<(usize, &Arc<Volume>)> {
        self.volumes.iter().enumerate().find(|(_, v)| v.name() == name)
    }

    /// Index of the volume holding `disk`.
    pub fn volume_of_disk(&self, disk: &str) -> Option<usize> {
        self.volumes.iter().position(|v| v.contains_disk(disk))
    }

    /// Reserve space for a new part, trying volumes in tier order.
    pub fn place_new_part(&self, size: u64) -> Result<PlacementResult, TierError> {
        for (index, volume) in self.volumes.iter().enumerate() {
            match volume.reserve(size) {
                Ok((disk, reservation)) => {
                    debug!(
                        policy = %self.name,
                        volume = volume.name(),
                        disk = disk.name(),
                        size,
                        reservation = %reservation.id(),
                        "placed new part"
                    );
                    return Ok(PlacementResult {
                        policy: self.name.clone(),
                        volume: volume.name().to_string(),
                        volume_index: index,
                        disk,
                        reservation,
                    });
                }
                Err(e) if e.is_space_error() => {
                    debug!(policy = %self.name, volume = volume.name(), size, error = %e, "volume cannot take part");
                }
                Err(e) => return Err(e),
            }
        }
        Err(TierError::NoSpace {
            policy: self.name.clone(),
            requested: size,
        })
    }

    /// Volumes, other than the last tier, whose free fraction has fallen
    /// below `move_factor`.
    pub fn volumes_over_move_factor(&self) -> Vec<(usize, Arc<Volume>)> {
        let last = self.volumes.len() - 1;
        self.volumes[..last]
            .iter()
            .enumerate()
            .filter(|(_, v)| v.free_ratio().is_some_and(|ratio| ratio < self.move_factor))
            .map(|(i, v)| (i, v.clone()))
            .collect()
    }
}
