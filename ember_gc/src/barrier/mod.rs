//! Write barriers.
//!
//! Every store of a pointer or value into a slot of an existing cell must
//! be followed by a barrier call. The barrier dirties the card covering
//! the slot, so a later card scan revisits exactly the slots that changed.

mod card_table;

pub use card_table::{CardTable, CARD_CLEAN, CARD_DIRTY};

use crate::heap::Heap;

/// Record a store into the slot at `slot`.
///
/// Slots outside the heap, such as roots held on the native stack, are
/// ignored.
///
/// # Example
///
/// ```ignore
/// // When storing a reference:
/// obj.next = GcPointer::new(other);
/// write_barrier(&heap, std::ptr::addr_of!(obj.next).cast());
/// ```
#[inline(always)]
pub fn write_barrier(heap: &Heap, slot: *const u8) {
    if let Some(segment) = heap.find_segment(slot) {
        segment.card_table().dirty(slot);
    }
}
