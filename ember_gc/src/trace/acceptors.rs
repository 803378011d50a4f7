//! Utility acceptors for diagnostics, tests and benchmarks.

use super::{SlotAcceptor, WeakRefAcceptor};
use crate::cell::GcPointer;
use crate::metadata::SlotKind;
use crate::value::Value;
use crate::weak::WeakSlotId;

/// An acceptor that does nothing.
pub struct NullAcceptor;

impl SlotAcceptor for NullAcceptor {
    #[inline]
    fn accept_pointer(&mut self, _slot: &mut GcPointer, _name: Option<&'static str>) {}

    #[inline]
    fn accept_value(&mut self, _slot: &mut Value, _name: Option<&'static str>) {}

    #[inline]
    fn accept_weak(&mut self, _slot: &mut WeakSlotId, _name: Option<&'static str>) {}
}

impl WeakRefAcceptor for NullAcceptor {
    #[inline]
    fn accept_weak_slot(&mut self, _slot: &mut WeakSlotId) {}
}

/// Counts visited slots by kind.
#[derive(Debug, Default)]
pub struct CountingAcceptor {
    /// Pointer slots visited.
    pub pointers: usize,
    /// Value slots visited.
    pub values: usize,
    /// Weak slots visited.
    pub weaks: usize,
}

impl CountingAcceptor {
    /// Create a new counting acceptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get total number of slots visited.
    pub fn total(&self) -> usize {
        self.pointers + self.values + self.weaks
    }
}

impl SlotAcceptor for CountingAcceptor {
    fn accept_pointer(&mut self, _slot: &mut GcPointer, _name: Option<&'static str>) {
        self.pointers += 1;
    }

    fn accept_value(&mut self, _slot: &mut Value, _name: Option<&'static str>) {
        self.values += 1;
    }

    fn accept_weak(&mut self, _slot: &mut WeakSlotId, _name: Option<&'static str>) {
        self.weaks += 1;
    }
}

impl WeakRefAcceptor for CountingAcceptor {
    fn accept_weak_slot(&mut self, _slot: &mut WeakSlotId) {
        self.weaks += 1;
    }
}

/// Records the offset and kind of every visited slot relative to a base.
#[derive(Debug)]
pub struct OffsetRecorder {
    base: usize,
    /// Visited slots in visitation order.
    pub visited: Vec<(SlotKind, usize)>,
}

impl OffsetRecorder {
    /// Record offsets relative to `base`.
    pub fn new(base: *const u8) -> Self {
        Self {
            base: base as usize,
            visited: Vec::new(),
        }
    }

    /// Just the offsets, in visitation order.
    pub fn offsets(&self) -> Vec<usize> {
        self.visited.iter().map(|(_, off)| *off).collect()
    }

    fn record<T>(&mut self, kind: SlotKind, slot: &mut T) {
        let addr = slot as *mut T as usize;
        self.visited.push((kind, addr - self.base));
    }
}

impl SlotAcceptor for OffsetRecorder {
    fn accept_pointer(&mut self, slot: &mut GcPointer, _name: Option<&'static str>) {
        self.record(SlotKind::Pointer, slot);
    }

    fn accept_value(&mut self, slot: &mut Value, _name: Option<&'static str>) {
        self.record(SlotKind::Value, slot);
    }

    fn accept_weak(&mut self, slot: &mut WeakSlotId, _name: Option<&'static str>) {
        self.record(SlotKind::Weak, slot);
    }
}
