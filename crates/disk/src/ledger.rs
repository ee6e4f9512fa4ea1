use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tierstore_common::{
    DiskSlot, DiskSpace, Reservation, ReservationId, ReservationOwner, TierError,
};
use tracing::debug;

/// Per-disk space accounting shared by every disk in a registry.
///
/// Slots live in an arena indexed by `DiskSlot`. Each slot keeps one atomic
/// `committed` counter (durable usage plus outstanding reservations) that
/// reservations are admitted against with a compare-and-swap loop, so two
/// concurrent reservations on a nearly full disk cannot both succeed. A write
/// converts reserved bytes into used bytes without touching `committed`.
/// Reservations hold the ledger and hand their unused bytes back when
/// dropped. The arena lock is only taken for writing when a disk registers.
pub struct ReservationLedger {
    slots: RwLock<Vec<SlotCounters>>,
    next_id: AtomicU64,
}

struct SlotCounters {
    disk: String,
    /// Usable capacity; `None` means the backend reports no limit.
    capacity: Option<u64>,
    /// used + outstanding reservations.
    committed: AtomicU64,
    used: AtomicU64,
    active: AtomicU64,
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a disk to the arena and return its slot.
    pub fn register(&self, disk: &str, capacity: Option<u64>) -> DiskSlot {
        let mut slots = self.slots.write().unwrap();
        let slot = DiskSlot(slots.len() as u32);
        slots.push(SlotCounters {
            disk: disk.to_string(),
            capacity,
            committed: AtomicU64::new(0),
            used: AtomicU64::new(0),
            active: AtomicU64::new(0),
        });
        debug!(disk, slot = slot.0, ?capacity, "registered disk in ledger");
        slot
    }

    /// Atomically claim `bytes` on `slot`.
    pub fn try_reserve(self: &Arc<Self>, slot: DiskSlot, bytes: u64) -> Result<Reservation, TierError> {
        let slots = self.slots.read().unwrap();
        let counters = lookup(&slots, slot)?;

        match counters.capacity {
            Some(capacity) => {
                let admitted = counters.committed.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |committed| {
                        let next = committed.checked_add(bytes)?;
                        (next <= capacity).then_some(next)
                    },
                );
                if let Err(committed) = admitted {
                    return Err(TierError::NotEnoughSpace {
                        disk: counters.disk.clone(),
                        requested: bytes,
                        available: capacity.saturating_sub(committed),
                    });
                }
            }
            None => {
                counters.committed.fetch_add(bytes, Ordering::AcqRel);
            }
        }

        counters.active.fetch_add(1, Ordering::AcqRel);
        let id = ReservationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(disk = %counters.disk, %id, bytes, "reserved");
        Ok(Reservation::new(id, &counters.disk, slot, bytes, self.clone()))
    }

    /// Turn `bytes` of a reservation into durable usage after a successful write.
    pub fn commit(&self, reservation: &Reservation, bytes: u64) {
        let slots = self.slots.read().unwrap();
        let Ok(counters) = lookup(&slots, reservation.slot()) else {
            return;
        };
        let moved = reservation.commit(bytes);
        counters.used.fetch_add(bytes, Ordering::AcqRel);
        if bytes > moved {
            counters.committed.fetch_add(bytes - moved, Ordering::AcqRel);
        }
    }

    /// Return the uncommitted part of a reservation to its slot. Same as
    /// dropping it.
    pub fn release(&self, reservation: Reservation) {
        drop(reservation);
    }

    /// Record `bytes` of durable data removed from `slot`.
    pub fn credit(&self, slot: DiskSlot, bytes: u64) {
        let slots = self.slots.read().unwrap();
        if let Ok(counters) = lookup(&slots, slot) {
            saturating_sub(&counters.used, bytes);
            saturating_sub(&counters.committed, bytes);
        }
    }

    /// Seed durable usage, e.g. after scanning a disk at open.
    pub fn set_used(&self, slot: DiskSlot, bytes: u64) {
        let slots = self.slots.read().unwrap();
        if let Ok(counters) = lookup(&slots, slot) {
            let previous = counters.used.swap(bytes, Ordering::AcqRel);
            saturating_sub(&counters.committed, previous);
            counters.committed.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    pub fn space(&self, slot: DiskSlot) -> DiskSpace {
        let slots = self.slots.read().unwrap();
        match lookup(&slots, slot) {
            Ok(counters) => {
                let committed = counters.committed.load(Ordering::Acquire);
                let used = counters.used.load(Ordering::Acquire);
                DiskSpace {
                    capacity: counters.capacity,
                    used,
                    reserved: committed.saturating_sub(used),
                }
            }
            Err(_) => DiskSpace::default(),
        }
    }

    /// Number of reservations currently held on `slot`.
    pub fn active_reservations(&self, slot: DiskSlot) -> u64 {
        let slots = self.slots.read().unwrap();
        lookup(&slots, slot)
            .map(|c| c.active.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl ReservationOwner for ReservationLedger {
    fn return_reservation(&self, reservation: &Reservation) {
        let slots = self.slots.read().unwrap();
        let Ok(counters) = lookup(&slots, reservation.slot()) else {
            return;
        };
        saturating_sub(&counters.committed, reservation.outstanding());
        saturating_sub(&counters.active, 1);
        debug!(
            disk = %counters.disk,
            id = %reservation.id(),
            bytes = reservation.bytes(),
            committed = reservation.committed(),
            held_ms = reservation.created_at().elapsed().as_millis() as u64,
            "released"
        );
    }
}

impl Default for ReservationLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(slots: &[SlotCounters], slot: DiskSlot) -> Result<&SlotCounters, TierError> {
    slots
        .get(slot.0 as usize)
        .ok_or_else(|| TierError::InvalidReservation(format!("unknown ledger slot {}", slot.0)))
}

fn saturating_sub(counter: &AtomicU64, amount: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_sub(amount))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::Rng;

    #[test]
    fn test_reserve_within_capacity() {
        let ledger = Arc::new(ReservationLedger::new());
        let slot = ledger.register("local", Some(100));

        let a = ledger.try_reserve(slot, 60).unwrap();
        assert_eq!(ledger.space(slot).reserved, 60);

        let err = ledger.try_reserve(slot, 50).unwrap_err();
        assert!(matches!(
            err,
            TierError::NotEnoughSpace { requested: 50, available: 40, .. }
        ));

        ledger.release(a);
        assert_eq!(ledger.space(slot).reserved, 0);
        assert!(ledger.try_reserve(slot, 100).is_ok());
    }

    #[test]
    fn test_commit_moves_reserved_into_used() {
        let ledger = Arc::new(ReservationLedger::new());
        let slot = ledger.register("local", Some(100));

        let r = ledger.try_reserve(slot, 80).unwrap();
        ledger.commit(&r, 50);
        let space = ledger.space(slot);
        assert_eq!(space.used, 50);
        assert_eq!(space.reserved, 30);

        ledger.release(r);
        let space = ledger.space(slot);
        assert_eq!(space.used, 50);
        assert_eq!(space.reserved, 0);
        assert_eq!(space.unreserved(), Some(50));

        ledger.credit(slot, 50);
        assert_eq!(ledger.space(slot).unreserved(), Some(100));
    }

    #[test]
    fn test_used_counts_against_capacity() {
        let ledger = Arc::new(ReservationLedger::new());
        let slot = ledger.register("local", Some(100));
        ledger.set_used(slot, 70);
        assert!(ledger.try_reserve(slot, 31).is_err());
        let r = ledger.try_reserve(slot, 30).unwrap();
        assert_eq!(ledger.space(slot).unreserved(), Some(0));
        ledger.release(r);
        ledger.credit(slot, 70);
        assert_eq!(ledger.space(slot).unreserved(), Some(100));
    }

    #[test]
    fn test_unbounded_slot_is_optimistic() {
        let ledger = Arc::new(ReservationLedger::new());
        let slot = ledger.register("s3", None);
        let r = ledger.try_reserve(slot, u64::MAX / 2).unwrap();
        assert_eq!(ledger.active_reservations(slot), 1);
        ledger.release(r);
        assert_eq!(ledger.active_reservations(slot), 0);
    }

    #[test]
    fn test_reservation_ids_are_unique() {
        let ledger = Arc::new(ReservationLedger::new());
        let slot = ledger.register("local", None);
        let a = ledger.try_reserve(slot, 1).unwrap();
        let b = ledger.try_reserve(slot, 1).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_dropped_reservation_is_returned() {
        let ledger = Arc::new(ReservationLedger::new());
        let slot = ledger.register("local", Some(100));

        let r = ledger.try_reserve(slot, 80).unwrap();
        ledger.commit(&r, 20);
        drop(r);
        let space = ledger.space(slot);
        assert_eq!((space.used, space.reserved), (20, 0));
        assert_eq!(ledger.active_reservations(slot), 0);
        assert!(ledger.try_reserve(slot, 80).is_ok());
    }

    #[test]
    fn test_concurrent_reserve_commit_release_never_exceeds_capacity() {
        const CAPACITY: u64 = 10_000;
        let ledger = Arc::new(ReservationLedger::new());
        let slot = ledger.register("local", Some(CAPACITY));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut held = Vec::new();
                    let mut durable = Vec::new();
                    for _ in 0..2_000 {
                        match rng.gen_range(0..4) {
                            0 | 1 => {
                                if let Ok(r) = ledger.try_reserve(slot, rng.gen_range(1..=900)) {
                                    held.push(r);
                                }
                            }
                            2 if !held.is_empty() => {
                                let idx = rng.gen_range(0..held.len());
                                let r = held.swap_remove(idx);
                                if rng.gen_bool(0.5) {
                                    let written = rng.gen_range(0..=r.bytes());
                                    ledger.commit(&r, written);
                                    durable.push(written);
                                }
                                ledger.release(r);
                            }
                            _ => {
                                if let Some(bytes) = durable.pop() {
                                    ledger.credit(slot, bytes);
                                }
                            }
                        }
                        let space = ledger.space(slot);
                        assert!(space.used + space.reserved <= CAPACITY);
                    }
                    for r in held {
                        ledger.release(r);
                    }
                    for bytes in durable {
                        ledger.credit(slot, bytes);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        let space = ledger.space(slot);
        assert_eq!(space.reserved, 0);
        assert_eq!(space.used, 0);
        assert_eq!(ledger.active_reservations(slot), 0);
    }
}
