//! Slot arena shared by the acquire/release and eviction engines.
//!
//! Slots are addressed by index and indices are stable: a failed reservation
//! or an evicted resource leaves an `Empty` hole that the next acquire reuses,
//! and later slots never shift. Only a trailing run of `Empty` slots is ever
//! dropped, since no in-flight reservation can point past the last live slot.

use tokio::time::Instant;

/// One position in the pool.
#[derive(Debug, Clone)]
pub enum Slot<R> {
    /// Created and unused since `returned_at`.
    Idle { resource: R, returned_at: Instant },
    /// Claimed by an in-flight creation.
    Reserved,
    /// Holds nothing; reusable.
    Empty,
    /// Checked out by a caller.
    InUse(R),
}

impl<R> Slot<R> {
    pub fn is_idle(&self) -> bool {
        matches!(self, Slot::Idle { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, Slot::Reserved)
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, Slot::InUse(_))
    }
}

#[derive(Debug)]
pub struct SlotStore<R> {
    slots: Vec<Slot<R>>,
}

impl<R> Default for SlotStore<R> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<R> SlotStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&Slot<R>> {
        self.slots.get(index)
    }

    /// First idle slot in index order (first-fit, not least-recently-used).
    pub fn find_idle_slot(&self) -> Option<usize> {
        self.slots.iter().position(Slot::is_idle)
    }

    /// First empty slot, or `len()` when the store has to grow.
    pub fn find_reusable_index(&self) -> usize {
        self.slots
            .iter()
            .position(Slot::is_empty)
            .unwrap_or(self.slots.len())
    }

    /// Slots holding or about to hold a resource.
    pub fn count_live(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    pub fn count_idle(&self) -> usize {
        self.slots.iter().filter(|s| s.is_idle()).count()
    }

    pub fn count_in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_in_use()).count()
    }

    pub fn count_reserved(&self) -> usize {
        self.slots.iter().filter(|s| s.is_reserved()).count()
    }

    /// Replace the slot at `index`, growing the store by one if `index == len()`.
    ///
    /// Returns the previous state (`Empty` for a freshly appended slot).
    pub(crate) fn replace(&mut self, index: usize, slot: Slot<R>) -> Slot<R> {
        if index == self.slots.len() {
            self.slots.push(slot);
            return Slot::Empty;
        }
        std::mem::replace(&mut self.slots[index], slot)
    }

    /// Index of the first checked-out slot whose resource satisfies `matches`.
    pub(crate) fn position_in_use(&self, mut matches: impl FnMut(&R) -> bool) -> Option<usize> {
        self.slots.iter().position(|slot| match slot {
            Slot::InUse(r) => matches(r),
            _ => false,
        })
    }

    /// Drop the trailing run of empty slots.
    pub(crate) fn truncate_empty_tail(&mut self) {
        while self.slots.last().is_some_and(Slot::is_empty) {
            self.slots.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(resource: u32) -> Slot<u32> {
        Slot::Idle {
            resource,
            returned_at: Instant::now(),
        }
    }

    #[test]
    fn empty_store_appends() {
        let store: SlotStore<u32> = SlotStore::new();
        assert_eq!(store.find_reusable_index(), 0);
        assert_eq!(store.find_idle_slot(), None);
        assert_eq!(store.count_live(), 0);
    }

    #[test]
    fn reusable_index_prefers_first_hole() {
        let mut store = SlotStore::new();
        store.replace(0, Slot::InUse(1));
        store.replace(1, Slot::Empty);
        store.replace(2, Slot::Reserved);
        store.replace(3, Slot::Empty);

        assert_eq!(store.find_reusable_index(), 1);
        assert_eq!(store.count_live(), 2);
    }

    #[test]
    fn idle_lookup_is_first_fit() {
        let mut store = SlotStore::new();
        store.replace(0, Slot::InUse(1));
        store.replace(1, idle(2));
        store.replace(2, idle(3));

        assert_eq!(store.find_idle_slot(), Some(1));
        assert_eq!(store.count_idle(), 2);
        assert_eq!(store.count_in_use(), 1);
    }

    #[test]
    fn replace_returns_previous_state() {
        let mut store = SlotStore::new();
        assert!(store.replace(0, Slot::Reserved).is_empty());
        assert!(store.replace(0, Slot::InUse(7)).is_reserved());
        assert!(matches!(store.replace(0, Slot::Empty), Slot::InUse(7)));
    }

    #[test]
    fn position_in_use_ignores_idle_slots() {
        let mut store = SlotStore::new();
        store.replace(0, idle(5));
        store.replace(1, Slot::InUse(5));

        assert_eq!(store.position_in_use(|r| *r == 5), Some(1));
        assert_eq!(store.position_in_use(|r| *r == 6), None);
    }

    #[test]
    fn truncate_keeps_interior_holes() {
        let mut store = SlotStore::new();
        store.replace(0, Slot::Empty);
        store.replace(1, Slot::InUse(1));
        store.replace(2, Slot::Empty);
        store.replace(3, Slot::Empty);

        store.truncate_empty_tail();

        assert_eq!(store.len(), 2);
        assert!(store.get(0).is_some_and(Slot::is_empty));
        assert_eq!(store.count_reserved(), 0);
    }
}
