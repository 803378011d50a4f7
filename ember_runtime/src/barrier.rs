//! Barriered stores into slots of existing cells.
//!
//! Every helper writes the slot first and then dirties the card covering
//! it, so card scanning observes the new contents:
//!
//! ```text
//! store_value(heap, &mut obj.slot, v)
//!     │
//!     ├── obj.slot = v
//!     └── heap.write_barrier(&obj.slot)   // card ← dirty
//! ```
//!
//! Freshly allocated cells that have not been published anywhere may be
//! initialized without a barrier.

use std::ptr::NonNull;

use ember_gc::{GcCell, GcPointer, Heap, Value};

/// Store a value into a value slot.
#[inline]
pub fn store_value(heap: &Heap, slot: &mut Value, value: Value) {
    *slot = value;
    heap.write_barrier((slot as *const Value).cast());
}

/// Store a cell reference into a pointer slot.
#[inline]
pub fn store_pointer(heap: &Heap, slot: &mut GcPointer, cell: Option<NonNull<GcCell>>) {
    slot.set(cell);
    heap.write_barrier((slot as *const GcPointer).cast());
}

/// Store a value through a raw element pointer.
///
/// # Safety
///
/// `slot` must address a value slot inside a live cell of `heap`.
#[inline]
pub unsafe fn store_value_raw(heap: &Heap, slot: *mut Value, value: Value) {
    unsafe { slot.write(value) };
    heap.write_barrier(slot.cast_const().cast());
}
