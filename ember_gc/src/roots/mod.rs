//! Root tracking.
//!
//! GC roots are the starting points for marking:
//! - Pointer roots registered on the heap and named by [`RootId`]
//! - Global values pinned for the heap's lifetime
//! - Slots reported by an embedder's [`RootProvider`] at collection time
//!
//! Roots are visited mutably, so the compactor rewrites them in place when
//! their targets move.

use std::ptr::NonNull;

use crate::cell::{GcCell, GcPointer};
use crate::trace::{SlotAcceptor, WeakRefAcceptor};
use crate::value::Value;

/// Names a pointer root registered on a [`RootSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(u32);

/// Root set for garbage collection.
#[derive(Debug, Default)]
pub struct RootSet {
    pointers: Vec<GcPointer>,
    free: Vec<u32>,
    globals: Vec<Value>,
}

impl RootSet {
    /// Create a new empty root set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `cell` as a root.
    pub fn add(&mut self, cell: NonNull<GcCell>) -> RootId {
        if let Some(index) = self.free.pop() {
            self.pointers[index as usize] = GcPointer::new(cell);
            return RootId(index);
        }
        let index = u32::try_from(self.pointers.len())
            .unwrap_or_else(|_| panic!("root set exceeded u32::MAX entries"));
        self.pointers.push(GcPointer::new(cell));
        RootId(index)
    }

    /// Current target of a root, reflecting any relocation.
    #[inline]
    pub fn get(&self, id: RootId) -> Option<NonNull<GcCell>> {
        self.pointers.get(id.0 as usize).and_then(|p| p.get())
    }

    /// Retarget a root.
    pub fn set(&mut self, id: RootId, cell: Option<NonNull<GcCell>>) {
        self.pointers[id.0 as usize].set(cell);
    }

    /// Unregister a root. Its id may be reissued.
    pub fn remove(&mut self, id: RootId) {
        debug_assert!(!self.free.contains(&id.0), "root removed twice");
        self.pointers[id.0 as usize] = GcPointer::NULL;
        self.free.push(id.0);
    }

    /// Pin a value for the heap's lifetime.
    pub fn add_global(&mut self, value: Value) {
        self.globals.push(value);
    }

    /// Global values, reflecting any relocation.
    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    /// Clear all globals (for reset/shutdown).
    pub fn clear_globals(&mut self) {
        self.globals.clear();
    }

    /// Number of live pointer roots.
    pub fn len(&self) -> usize {
        self.pointers.len() - self.free.len()
    }

    /// Whether no pointer roots are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Targets of every live pointer root.
    pub fn iter(&self) -> impl Iterator<Item = NonNull<GcCell>> + '_ {
        self.pointers.iter().filter_map(|p| p.get())
    }

    /// Visit every root slot.
    pub fn mark_roots<A: SlotAcceptor + ?Sized>(&mut self, acceptor: &mut A) {
        for slot in &mut self.pointers {
            if !slot.is_null() {
                acceptor.accept_pointer(slot, Some("root"));
            }
        }
        for value in &mut self.globals {
            acceptor.accept_value(value, Some("global"));
        }
    }
}

/// Supplies roots held outside the heap.
///
/// Both methods may be called more than once per collection, once for
/// marking and once for updating relocated pointers, and must report the
/// same slots each time.
pub trait RootProvider {
    /// Report every strong root slot.
    fn mark_roots(&mut self, acceptor: &mut dyn SlotAcceptor);

    /// Report weak slots held outside the heap.
    fn mark_weak_roots(&mut self, _acceptor: &mut dyn WeakRefAcceptor) {}
}

/// A provider with no roots.
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn mark_roots(&mut self, _acceptor: &mut dyn SlotAcceptor) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CountingAcceptor;

    fn fake(storage: &mut [u64; 2]) -> NonNull<GcCell> {
        NonNull::from(storage).cast()
    }

    #[test]
    fn test_root_set_creation() {
        let roots = RootSet::new();
        assert!(roots.is_empty());
        assert!(roots.globals().is_empty());
    }

    #[test]
    fn test_add_get_remove() {
        let mut a = [0u64; 2];
        let mut b = [0u64; 2];
        let mut roots = RootSet::new();
        let id = roots.add(fake(&mut a));
        assert_eq!(roots.get(id), Some(fake(&mut a)));
        roots.set(id, Some(fake(&mut b)));
        assert_eq!(roots.get(id), Some(fake(&mut b)));
        roots.remove(id);
        assert_eq!(roots.get(id), None);
        assert!(roots.is_empty());

        let reused = roots.add(fake(&mut a));
        assert_eq!(reused, id);
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn test_mark_roots_skips_removed() {
        let mut a = [0u64; 2];
        let mut roots = RootSet::new();
        let first = roots.add(fake(&mut a));
        roots.add(fake(&mut a));
        roots.remove(first);
        roots.add_global(Value::int32(1));
        roots.add_global(Value::bool(true));

        let mut counter = CountingAcceptor::new();
        roots.mark_roots(&mut counter);
        assert_eq!(counter.pointers, 1);
        assert_eq!(counter.values, 2);

        roots.clear_globals();
        assert!(roots.globals().is_empty());
    }
}
