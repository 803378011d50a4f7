//! Slot visitation for garbage collection.
//!
//! Cells do not trace themselves. Instead the [`SlotVisitor`] walks the
//! slots a kind declared in its [`Metadata`](crate::metadata::Metadata)
//! and hands each one, mutably, to a [`SlotAcceptor`]. The same walk
//! serves marking, pointer updating after compaction, heap verification
//! and dirty-card scanning.

pub mod acceptors;
pub mod slot_visitor;

pub use acceptors::{CountingAcceptor, NullAcceptor, OffsetRecorder};
pub use slot_visitor::SlotVisitor;

use crate::cell::GcPointer;
use crate::value::Value;
use crate::weak::WeakSlotId;

/// Receives every slot of a visited cell.
///
/// Slots are passed mutably so acceptors can rewrite them in place, as the
/// compactor does when it installs forwarded addresses. `name` is the
/// declared field name for fixed slots and `None` for array elements.
///
/// # Example
///
/// ```ignore
/// struct MarkAcceptor<'a> {
///     worklist: &'a mut Vec<NonNull<GcCell>>,
/// }
///
/// impl SlotAcceptor for MarkAcceptor<'_> {
///     fn accept_pointer(&mut self, slot: &mut GcPointer, _name: Option<&'static str>) {
///         if let Some(cell) = slot.get() {
///             self.worklist.push(cell);
///         }
///     }
///     // ...
/// }
/// ```
pub trait SlotAcceptor {
    /// Visit a pointer slot.
    fn accept_pointer(&mut self, slot: &mut GcPointer, name: Option<&'static str>);

    /// Visit a tagged value slot.
    fn accept_value(&mut self, slot: &mut Value, name: Option<&'static str>);

    /// Visit a weak slot.
    fn accept_weak(&mut self, slot: &mut WeakSlotId, name: Option<&'static str>);
}

/// Receives weak slots held outside of declared cell fields.
///
/// Native structures owned by a cell, such as weak value maps, report
/// their slots through this trait from the kind's `mark_weak` hook.
pub trait WeakRefAcceptor {
    /// Visit one weak slot.
    fn accept_weak_slot(&mut self, slot: &mut WeakSlotId);
}
