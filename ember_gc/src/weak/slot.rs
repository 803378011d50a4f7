//! Weak reference slots and the table that owns them.
//!
//! ```text
//! WeakRefTable
//! ┌─────────┬─────────┬─────────┬─────────┐
//! │ slot 0  │ slot 1  │ slot 2  │ slot 3  │
//! │ Marked  │ Free ───┼─────────┼──► Free │ ◄── free_head
//! │ target  │ gen 3   │ Unmarked│ gen 1   │
//! └─────────┴─────────┴─────────┴─────────┘
//! ```
//!
//! A [`WeakSlotId`] names a slot by index and generation. Freeing a slot
//! bumps its generation, so ids issued before the slot was recycled stop
//! resolving instead of aliasing the new occupant. Generation 0 is never
//! issued, which keeps zeroed weak fields inert.

use std::marker::PhantomData;
use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::cell::{CellLayout, CellRef, GcCell};
use crate::trace::WeakRefAcceptor;

/// Guards the weak reference table.
///
/// The collector holds this lock from the start of marking until weak
/// slots have been swept and relocated; mutators hold it while creating,
/// reading or pruning weak references.
pub type WeakRefMutex = Mutex<WeakRefTable>;

/// Proof that the weak reference lock is held.
pub type WeakRefLock<'a> = MutexGuard<'a, WeakRefTable>;

/// Handle to a slot in a [`WeakRefTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct WeakSlotId {
    index: u32,
    generation: u32,
}

impl WeakSlotId {
    /// The id read from zeroed memory. Never resolves.
    pub const NONE: WeakSlotId = WeakSlotId {
        index: 0,
        generation: 0,
    };

    /// Whether this is [`NONE`](Self::NONE).
    #[inline]
    pub const fn is_none(self) -> bool {
        self.generation == 0
    }

    /// Slot index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation the slot had when this id was issued.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Collection state of a weak slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakSlotState {
    /// Not yet reported by any holder during this collection.
    Unmarked,
    /// Reported by a live holder.
    Marked,
    /// On the free list.
    Free,
}

#[derive(Debug)]
struct WeakRefSlot {
    state: WeakSlotState,
    target: Option<NonNull<GcCell>>,
    generation: u32,
    next_free: Option<u32>,
}

const FIRST_GENERATION: u32 = 1;

#[inline]
fn next_generation(generation: u32) -> u32 {
    generation.wrapping_add(1).max(FIRST_GENERATION)
}

/// Outcome of [`WeakRefTable::sweep`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WeakSweepResult {
    /// Marked slots whose target died.
    pub cleared: usize,
    /// Unmarked slots returned to the free list.
    pub freed: usize,
}

/// Owns every weak slot in a heap.
#[derive(Debug, Default)]
pub struct WeakRefTable {
    slots: Vec<WeakRefSlot>,
    free_head: Option<u32>,
    used: usize,
}

// SAFETY: targets are only dereferenced by the collector, and the table is
// only reachable through its mutex.
unsafe impl Send for WeakRefTable {}

impl WeakRefTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot pointing at `cell`.
    pub fn alloc(&mut self, cell: NonNull<GcCell>) -> WeakSlotId {
        self.used += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            debug_assert_eq!(slot.state, WeakSlotState::Free);
            self.free_head = slot.next_free.take();
            slot.state = WeakSlotState::Unmarked;
            slot.target = Some(cell);
            return WeakSlotId {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len())
            .unwrap_or_else(|_| panic!("weak reference table exceeded u32::MAX slots"));
        self.slots.push(WeakRefSlot {
            state: WeakSlotState::Unmarked,
            target: Some(cell),
            generation: FIRST_GENERATION,
            next_free: None,
        });
        WeakSlotId {
            index,
            generation: FIRST_GENERATION,
        }
    }

    #[inline]
    fn slot(&self, id: WeakSlotId) -> Option<&WeakRefSlot> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation && s.state != WeakSlotState::Free)
    }

    #[inline]
    fn slot_mut(&mut self, id: WeakSlotId) -> Option<&mut WeakRefSlot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.state != WeakSlotState::Free)
    }

    /// The target of a slot, or `None` if it was cleared or the id is stale.
    #[inline]
    pub fn get(&self, id: WeakSlotId) -> Option<NonNull<GcCell>> {
        self.slot(id).and_then(|s| s.target)
    }

    /// Whether the slot still points at a live cell.
    #[inline]
    pub fn has_value(&self, id: WeakSlotId) -> bool {
        self.get(id).is_some()
    }

    /// Collection state of the slot, or `None` if the id is stale.
    pub fn state(&self, id: WeakSlotId) -> Option<WeakSlotState> {
        self.slot(id).map(|s| s.state)
    }

    /// Mark a slot as held by a live owner. Returns false for stale ids.
    #[inline]
    pub fn mark(&mut self, id: WeakSlotId) -> bool {
        match self.slot_mut(id) {
            Some(slot) => {
                slot.state = WeakSlotState::Marked;
                true
            }
            None => false,
        }
    }

    /// Reset every allocated slot to unmarked ahead of marking.
    pub fn unmark_all(&mut self) {
        for slot in &mut self.slots {
            if slot.state == WeakSlotState::Marked {
                slot.state = WeakSlotState::Unmarked;
            }
        }
    }

    /// Drop a slot's target. Returns false for stale ids.
    pub fn clear_pointer(&mut self, id: WeakSlotId) -> bool {
        match self.slot_mut(id) {
            Some(slot) => {
                slot.target = None;
                true
            }
            None => false,
        }
    }

    /// Post-mark sweep.
    ///
    /// Unmarked slots are no longer reachable from any holder and return to
    /// the free list. Marked slots whose target is not live are cleared.
    pub fn sweep(&mut self, mut is_live: impl FnMut(NonNull<GcCell>) -> bool) -> WeakSweepResult {
        let mut result = WeakSweepResult::default();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot.state {
                WeakSlotState::Free => {}
                WeakSlotState::Unmarked => {
                    slot.state = WeakSlotState::Free;
                    slot.target = None;
                    slot.generation = next_generation(slot.generation);
                    slot.next_free = self.free_head;
                    self.free_head = Some(index as u32);
                    self.used -= 1;
                    result.freed += 1;
                }
                WeakSlotState::Marked => {
                    if let Some(target) = slot.target {
                        if !is_live(target) {
                            slot.target = None;
                            result.cleared += 1;
                        }
                    }
                }
            }
        }
        result
    }

    /// Rewrite every remaining target through `forward` after compaction.
    pub fn relocate(&mut self, mut forward: impl FnMut(NonNull<GcCell>) -> NonNull<GcCell>) {
        for slot in &mut self.slots {
            if slot.state == WeakSlotState::Free {
                continue;
            }
            if let Some(target) = slot.target {
                slot.target = Some(forward(target));
            }
        }
    }

    /// Slots currently allocated.
    #[inline]
    pub fn used_slots(&self) -> usize {
        self.used
    }

    /// Slots ever created, allocated or free.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl WeakRefAcceptor for WeakRefTable {
    #[inline]
    fn accept_weak_slot(&mut self, slot: &mut WeakSlotId) {
        self.mark(*slot);
    }
}

// =============================================================================
// Typed weak references
// =============================================================================

/// A typed weak reference to a cell.
///
/// The owner of a `WeakRef` must report its slot to the collector on every
/// collection, through declared weak fields or a `mark_weak` hook; an
/// unreported slot is freed and the reference stops resolving.
#[repr(transparent)]
pub struct WeakRef<T> {
    slot: WeakSlotId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: CellLayout> WeakRef<T> {
    /// Allocate a weak slot pointing at `cell`.
    pub fn new(lock: &mut WeakRefLock<'_>, cell: CellRef<T>) -> Self {
        Self {
            slot: lock.alloc(cell.as_cell()),
            _marker: PhantomData,
        }
    }

    /// The target, if still alive.
    #[inline]
    pub fn get(&self, lock: &WeakRefLock<'_>) -> Option<CellRef<T>> {
        // SAFETY: slots only ever point at cells of the kind they were
        // created for, and cleared slots return None.
        lock.get(self.slot)
            .map(|cell| unsafe { CellRef::from_cell_unchecked(cell) })
    }

    /// Whether the target is still alive.
    #[inline]
    pub fn is_valid(&self, lock: &WeakRefLock<'_>) -> bool {
        lock.has_value(self.slot)
    }
}

impl<T> WeakRef<T> {
    /// The underlying slot id.
    #[inline]
    pub fn slot_id(&self) -> WeakSlotId {
        self.slot
    }

    /// Mutable access to the slot id, for reporting to an acceptor.
    #[inline]
    pub fn slot_mut(&mut self) -> &mut WeakSlotId {
        &mut self.slot
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for WeakRef<T> {}

impl<T> PartialEq for WeakRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl<T> Eq for WeakRef<T> {}

impl<T> std::fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WeakRef({}#{})", self.slot.index, self.slot.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_cell(storage: &mut [u64; 2]) -> NonNull<GcCell> {
        NonNull::from(storage).cast()
    }

    #[test]
    fn test_alloc_and_get() {
        let mut a = [0u64; 2];
        let cell = fake_cell(&mut a);
        let mut table = WeakRefTable::new();
        let id = table.alloc(cell);
        assert_eq!(table.get(id), Some(cell));
        assert!(table.has_value(id));
        assert_eq!(table.state(id), Some(WeakSlotState::Unmarked));
        assert_eq!(table.used_slots(), 1);
    }

    #[test]
    fn test_sweep_frees_unmarked_and_clears_dead() {
        let mut a = [0u64; 2];
        let mut b = [0u64; 2];
        let (live, dead) = (fake_cell(&mut a), fake_cell(&mut b));
        let mut table = WeakRefTable::new();
        let unreported = table.alloc(live);
        let held_dead = table.alloc(dead);
        let held_live = table.alloc(live);

        assert!(table.mark(held_dead));
        assert!(table.mark(held_live));
        let result = table.sweep(|cell| cell == live);

        assert_eq!(result, WeakSweepResult { cleared: 1, freed: 1 });
        assert_eq!(table.state(unreported), None);
        assert_eq!(table.get(held_dead), None);
        assert_eq!(table.state(held_dead), Some(WeakSlotState::Marked));
        assert_eq!(table.get(held_live), Some(live));
        assert_eq!(table.used_slots(), 2);
    }

    #[test]
    fn test_freed_slot_is_recycled_with_new_generation() {
        let mut a = [0u64; 2];
        let cell = fake_cell(&mut a);
        let mut table = WeakRefTable::new();
        let old = table.alloc(cell);
        table.sweep(|_| true);

        let new = table.alloc(cell);
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert_eq!(table.get(old), None);
        assert!(!table.mark(old));
        assert_eq!(table.get(new), Some(cell));
        assert_eq!(table.capacity(), 1);
    }

    #[test]
    fn test_none_id_never_resolves() {
        let mut a = [0u64; 2];
        let mut table = WeakRefTable::new();
        let id = table.alloc(fake_cell(&mut a));
        assert_eq!(id.index(), WeakSlotId::NONE.index());
        assert!(WeakSlotId::NONE.is_none());
        assert!(!id.is_none());
        assert_eq!(table.get(WeakSlotId::NONE), None);
        assert!(!table.mark(WeakSlotId::NONE));
    }

    #[test]
    fn test_unmark_all() {
        let mut a = [0u64; 2];
        let mut table = WeakRefTable::new();
        let id = table.alloc(fake_cell(&mut a));
        table.mark(id);
        table.unmark_all();
        assert_eq!(table.state(id), Some(WeakSlotState::Unmarked));
    }

    #[test]
    fn test_relocate() {
        let mut a = [0u64; 2];
        let mut b = [0u64; 2];
        let (from, to) = (fake_cell(&mut a), fake_cell(&mut b));
        let mut table = WeakRefTable::new();
        let id = table.alloc(from);
        table.relocate(|cell| if cell == from { to } else { cell });
        assert_eq!(table.get(id), Some(to));
    }

    #[test]
    fn test_clear_pointer() {
        let mut a = [0u64; 2];
        let mut table = WeakRefTable::new();
        let id = table.alloc(fake_cell(&mut a));
        assert!(table.clear_pointer(id));
        assert!(!table.has_value(id));
        assert_eq!(table.state(id), Some(WeakSlotState::Unmarked));
    }

    #[test]
    fn test_table_is_weak_acceptor() {
        let mut a = [0u64; 2];
        let mut table = WeakRefTable::new();
        let mut id = table.alloc(fake_cell(&mut a));
        table.accept_weak_slot(&mut id);
        assert_eq!(table.state(id), Some(WeakSlotState::Marked));
    }
}
