use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use tierstore_common::{ByteRange, OpContext, PartFormat, PartId, TierError};
use tierstore_storage::{Part, PlacementEngine};
use tracing::{debug, info, warn};

/// Table engine client: decides nothing about *when* parts are created or
/// merged, only drives their space and I/O through the placement engine.
///
/// The part map is only locked for lookups and updates, never across I/O.
pub struct TableStore {
    name: String,
    policy: String,
    engine: Arc<PlacementEngine>,
    min_bytes_for_wide_part: u64,
    inner: Mutex<TableInner>,
}

#[derive(Default)]
struct TableInner {
    parts: BTreeMap<PartId, Part>,
    /// Parts with an insert, move or drop in flight.
    busy: HashSet<PartId>,
}

/// Marks a part busy until dropped.
struct BusyGuard<'a> {
    table: &'a TableStore,
    id: PartId,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.table.inner.lock().unwrap().busy.remove(&self.id);
    }
}

impl TableStore {
    /// Create a table storing its parts under `policy`.
    pub fn new(name: &str, policy: &str, engine: Arc<PlacementEngine>) -> Result<Self, TierError> {
        engine.registry().policy(policy)?;
        let min_bytes_for_wide_part = engine.registry().merge_tree().min_bytes_for_wide_part;
        Ok(Self {
            name: name.to_string(),
            policy: policy.to_string(),
            engine,
            min_bytes_for_wide_part,
            inner: Mutex::new(TableInner::default()),
        })
    }

    pub fn with_min_bytes_for_wide_part(mut self, bytes: u64) -> Self {
        self.min_bytes_for_wide_part = bytes;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn part(&self, id: &str) -> Option<Part> {
        self.inner.lock().unwrap().parts.get(id).cloned()
    }

    /// All registered parts, ordered by id.
    pub fn parts(&self) -> Vec<Part> {
        self.inner.lock().unwrap().parts.values().cloned().collect()
    }

    fn object_key(&self, id: &str) -> String {
        format!("{}/{}", self.name, id)
    }

    fn claim(&self, id: &str, new: bool) -> Result<(BusyGuard<'_>, Option<Part>), TierError> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner.parts.get(id).cloned();
        if new && existing.is_some() {
            return Err(TierError::DuplicatePart(id.to_string()));
        }
        if !new && existing.is_none() {
            return Err(TierError::UnknownPart(id.to_string()));
        }
        if !inner.busy.insert(id.to_string()) {
            return Err(TierError::PartBusy(id.to_string()));
        }
        let guard = BusyGuard {
            table: self,
            id: id.to_string(),
        };
        Ok((guard, existing))
    }

    /// Store a new part: pick its format, reserve space under the table's
    /// policy, write it and register it.
    pub async fn insert(&self, id: &str, data: &[u8], ctx: &OpContext) -> Result<Part, TierError> {
        let (_guard, _) = self.claim(id, true)?;
        let size = data.len() as u64;
        let format = PartFormat::for_size(size, self.min_bytes_for_wide_part);

        let placed = self.engine.reserve_part_space(&self.policy, size)?;
        let key = self.object_key(id);
        let disk = placed.disk.clone();
        self.engine
            .write_part(&disk, &key, data, placed.reservation, ctx)
            .await?;

        let part = Part::new(id, &key, disk.name(), format, data);
        self.inner
            .lock()
            .unwrap()
            .parts
            .insert(id.to_string(), part.clone());
        info!(
            table = %self.name,
            part = id,
            size,
            %format,
            volume = %placed.volume,
            disk = disk.name(),
            "part inserted"
        );
        Ok(part)
    }

    /// Read a part. A read that loses the race with a move (its object is
    /// gone from the old disk) follows the part to its new disk.
    pub async fn read(&self, id: &str, range: ByteRange, ctx: &OpContext) -> Result<Vec<u8>, TierError> {
        let mut part = self
            .part(id)
            .ok_or_else(|| TierError::UnknownPart(id.to_string()))?;
        loop {
            let disk = self.engine.disk(&part.disk)?;
            match self.engine.read_part(disk, &part.key, range, ctx).await {
                Err(e @ TierError::NotFound { .. }) => match self.part(id) {
                    Some(current) if current.disk != part.disk => {
                        debug!(table = %self.name, part = id, from = %part.disk, to = %current.disk, "part moved during read, retrying");
                        part = current;
                    }
                    _ => return Err(e),
                },
                other => return other,
            }
        }
    }

    /// Delete a part's object and unregister it. If its disk refuses the
    /// delete the error is returned and the part stays registered.
    pub async fn drop_part(&self, id: &str, ctx: &OpContext) -> Result<(), TierError> {
        let (_guard, part) = self.claim(id, false)?;
        let Some(part) = part else {
            return Err(TierError::UnknownPart(id.to_string()));
        };
        let disk = self.engine.disk(&part.disk)?;
        self.engine.delete_part(disk, &part.key, ctx).await?;
        self.inner.lock().unwrap().parts.remove(id);
        info!(table = %self.name, part = id, disk = %part.disk, "part dropped");
        Ok(())
    }

    /// Move a part to `volume` of the table's policy.
    pub async fn move_part(&self, id: &str, volume: &str, ctx: &OpContext) -> Result<Part, TierError> {
        let (_guard, part) = self.claim(id, false)?;
        let Some(part) = part else {
            return Err(TierError::UnknownPart(id.to_string()));
        };
        let moved = self
            .engine
            .move_to_volume(&part, &self.policy, volume, ctx)
            .await?;
        if moved.disk == part.disk {
            return Ok(moved);
        }
        self.inner
            .lock()
            .unwrap()
            .parts
            .insert(id.to_string(), moved.clone());
        // New readers see the new disk from here on; in-flight ones follow it on NotFound.
        self.engine.retire_source(&part).await;
        info!(table = %self.name, part = id, from = %part.disk, to = %moved.disk, "part moved");
        Ok(moved)
    }

    /// Move the largest parts off every volume whose free fraction is below
    /// the policy's move factor, onto the next volume, until it recovers.
    /// Returns the parts that moved.
    pub async fn rebalance(&self, ctx: &OpContext) -> Result<Vec<Part>, TierError> {
        let policy = self.engine.registry().policy(&self.policy)?.clone();
        let mut moved = Vec::new();

        for (index, volume) in policy.volumes_over_move_factor() {
            let next = policy.volumes()[index + 1].name().to_string();
            let mut candidates: Vec<Part> = self
                .parts()
                .into_iter()
                .filter(|p| volume.contains_disk(&p.disk))
                .collect();
            candidates.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.id.cmp(&b.id)));
            debug!(
                table = %self.name,
                volume = volume.name(),
                free_ratio = ?volume.free_ratio(),
                candidates = candidates.len(),
                "rebalancing volume"
            );

            for part in candidates {
                if volume
                    .free_ratio()
                    .map_or(true, |ratio| ratio >= policy.move_factor())
                {
                    break;
                }
                ctx.check()?;
                match self.move_part(&part.id, &next, ctx).await {
                    Ok(part) => moved.push(part),
                    Err(e) => {
                        warn!(table = %self.name, part = %part.id, to = %next, error = %e, "rebalance move skipped");
                    }
                }
            }
        }
        Ok(moved)
    }
}
