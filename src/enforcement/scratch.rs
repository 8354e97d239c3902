//! Per-execution-unit scratch slots
//!
//! Every unit (CPU, worker thread) owns exactly one pre-allocated
//! [`EventRecord`]. A record is staged in the unit's slot and handed to the
//! event channel from there, so the enforcement path never allocates.
//!
//! Slots are claimed with `try_lock`. A unit only ever touches its own slot,
//! so the lock is uncontended; it exists to turn an overlapping invocation
//! on the same unit (a reentrant call) into a visible "slot unavailable"
//! instead of two writers interleaving in one record.

use heimdall_common::EventRecord;
use parking_lot::Mutex;

/// Fixed set of record slots, one per execution unit.
#[derive(Debug)]
pub struct ScratchBuffer {
    slots: Box<[Mutex<EventRecord>]>,
}

impl ScratchBuffer {
    /// Provision `units` zeroed slots.
    pub fn new(units: usize) -> Self {
        let slots = (0..units)
            .map(|_| Mutex::new(EventRecord::zeroed()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    /// One slot per available CPU.
    pub fn per_cpu() -> Self {
        let units = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(units)
    }

    pub fn units(&self) -> usize {
        self.slots.len()
    }

    /// Run `f` with exclusive access to the slot of `unit`.
    ///
    /// Returns `None` without calling `f` if the unit has no slot or its
    /// slot is already held by another invocation.
    pub fn with_slot<R>(&self, unit: usize, f: impl FnOnce(&mut EventRecord) -> R) -> Option<R> {
        let slot = self.slots.get(unit)?;
        let mut record = slot.try_lock()?;
        Some(f(&mut *record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heimdall_common::comm_from_bytes;

    #[test]
    fn test_slot_per_unit() {
        let scratch = ScratchBuffer::new(2);
        scratch.with_slot(0, |r| r.fill(1, 0, 62, 500, comm_from_bytes(b"a")));
        scratch.with_slot(1, |r| r.fill(2, 0, 59, 501, comm_from_bytes(b"b")));

        assert_eq!(scratch.with_slot(0, |r| r.pid), Some(1));
        assert_eq!(scratch.with_slot(1, |r| r.pid), Some(2));
    }

    #[test]
    fn test_unknown_unit_is_unavailable() {
        let scratch = ScratchBuffer::new(1);
        assert_eq!(scratch.with_slot(1, |_| ()), None);
    }

    #[test]
    fn test_reentrant_use_is_unavailable() {
        let scratch = ScratchBuffer::new(1);
        let nested = scratch.with_slot(0, |_| scratch.with_slot(0, |_| ()));

        assert_eq!(nested, Some(None));
        // Released again once the outer invocation returns
        assert_eq!(scratch.with_slot(0, |_| ()), Some(()));
    }

    #[test]
    fn test_per_cpu_has_at_least_one_unit() {
        assert!(ScratchBuffer::per_cpu().units() >= 1);
    }
}
