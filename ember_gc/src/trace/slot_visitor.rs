//! Metadata-driven slot walking.

use std::ptr::NonNull;

use super::SlotAcceptor;
use crate::cell::GcPointer;
use crate::metadata::{ArrayData, Metadata, SlotKind};
use crate::value::Value;
use crate::weak::WeakSlotId;

/// Walks the slots of a cell as described by its metadata.
///
/// Fixed slots are visited grouped by kind (pointers, then values, then
/// weak slots), each group in ascending offset order, followed by the
/// array elements in index order. Visitation is monomorphized over the
/// acceptor so marking loops compile to direct calls.
pub struct SlotVisitor;

impl SlotVisitor {
    /// Visit every slot of the cell at `base`.
    ///
    /// # Safety
    ///
    /// `base` must address a cell whose layout is described by `metadata`,
    /// and no other reference to its slots may be live.
    pub unsafe fn visit<A: SlotAcceptor + ?Sized>(acceptor: &mut A, base: NonNull<u8>, metadata: &Metadata) {
        let base = base.as_ptr();
        for (kind, field) in metadata.slot_offsets().iter() {
            unsafe { Self::visit_slot(acceptor, kind, base.add(field.offset as usize), Some(field.name)) };
        }
        if let Some(array) = metadata.array() {
            unsafe { Self::visit_array(acceptor, base, array, base as usize, usize::MAX) };
        }
    }

    /// Visit only the slots whose address lies in `[begin, end)`.
    ///
    /// Array iteration starts at the first element boundary at or after
    /// `begin` and stops at the earlier of `end` and the array end, so a
    /// card scan never reads past the live elements.
    ///
    /// # Safety
    ///
    /// As for [`visit`](Self::visit).
    pub unsafe fn visit_within_range<A: SlotAcceptor + ?Sized>(
        acceptor: &mut A,
        base: NonNull<u8>,
        metadata: &Metadata,
        begin: *const u8,
        end: *const u8,
    ) {
        let base = base.as_ptr();
        let (lo, hi) = (begin as usize, end as usize);
        for (kind, field) in metadata.slot_offsets().iter() {
            let addr = base as usize + field.offset as usize;
            if addr >= lo && addr < hi {
                unsafe { Self::visit_slot(acceptor, kind, base.add(field.offset as usize), Some(field.name)) };
            }
        }
        if let Some(array) = metadata.array() {
            unsafe { Self::visit_array(acceptor, base, array, lo, hi) };
        }
    }

    /// Visit array elements whose address lies in `[lo, hi)`.
    #[inline]
    unsafe fn visit_array<A: SlotAcceptor + ?Sized>(
        acceptor: &mut A,
        base: *mut u8,
        array: &ArrayData,
        lo: usize,
        hi: usize,
    ) {
        let length = unsafe { array.load_length(base) } as usize;
        let stride = array.stride as usize;
        let start = base as usize + array.start_offset as usize;
        let stop = hi.min(start + length * stride);

        let first = if lo <= start { 0 } else { (lo - start).div_ceil(stride) };
        let mut index = first;
        while start + index * stride < stop {
            let offset = array.start_offset as usize + index * stride;
            unsafe { Self::visit_slot(acceptor, array.kind, base.add(offset), None) };
            index += 1;
        }
    }

    #[inline(always)]
    unsafe fn visit_slot<A: SlotAcceptor + ?Sized>(
        acceptor: &mut A,
        kind: SlotKind,
        addr: *mut u8,
        name: Option<&'static str>,
    ) {
        match kind {
            SlotKind::Pointer => acceptor.accept_pointer(unsafe { &mut *addr.cast::<GcPointer>() }, name),
            SlotKind::Value => acceptor.accept_value(unsafe { &mut *addr.cast::<Value>() }, name),
            SlotKind::Weak => acceptor.accept_weak(unsafe { &mut *addr.cast::<WeakSlotId>() }, name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataBuilder;
    use crate::trace::{CountingAcceptor, OffsetRecorder};

    /// 64 bytes: two pointer slots at 8 and 16, a u32 length at 4 and a
    /// five-element value array starting at 24.
    #[repr(C, align(8))]
    struct Fixture([u64; 8]);

    fn fixture() -> (Box<Fixture>, Metadata) {
        let mut buf = Box::new(Fixture([0; 8]));
        // Length 5 in bytes 4..8.
        buf.0[0] = 5u64 << 32;
        let mut b = MetadataBuilder::new();
        b.add_pointer(8, "a")
            .add_pointer(16, "b")
            .add_array(ArrayData::new(SlotKind::Value, 24, 4));
        (buf, b.build())
    }

    fn base_of(buf: &mut Fixture) -> NonNull<u8> {
        NonNull::from(buf).cast()
    }

    #[test]
    fn test_visit_all_slots_in_order() {
        let (mut buf, meta) = fixture();
        let base = base_of(&mut buf);
        let mut rec = OffsetRecorder::new(base.as_ptr());
        unsafe { SlotVisitor::visit(&mut rec, base, &meta) };
        assert_eq!(rec.offsets(), vec![8, 16, 24, 32, 40, 48, 56]);
        assert_eq!(rec.visited[0].0, SlotKind::Pointer);
        assert_eq!(rec.visited[2].0, SlotKind::Value);
    }

    #[test]
    fn test_visit_respects_current_length() {
        let (mut buf, meta) = fixture();
        buf.0[0] = 2u64 << 32;
        let base = base_of(&mut buf);
        let mut counter = CountingAcceptor::new();
        unsafe { SlotVisitor::visit(&mut counter, base, &meta) };
        assert_eq!(counter.pointers, 2);
        assert_eq!(counter.values, 2);
    }

    #[test]
    fn test_visit_within_range_clips_fixed_slots() {
        let (mut buf, meta) = fixture();
        let base = base_of(&mut buf);
        let p = base.as_ptr();
        let mut rec = OffsetRecorder::new(p);
        unsafe { SlotVisitor::visit_within_range(&mut rec, base, &meta, p.add(12), p.add(40)) };
        assert_eq!(rec.offsets(), vec![16, 24, 32]);
    }

    #[test]
    fn test_visit_within_range_rounds_up_to_element_boundary() {
        let (mut buf, meta) = fixture();
        let base = base_of(&mut buf);
        let p = base.as_ptr();
        let mut rec = OffsetRecorder::new(p);
        unsafe { SlotVisitor::visit_within_range(&mut rec, base, &meta, p.add(28), p.add(1024)) };
        assert_eq!(rec.offsets(), vec![32, 40, 48, 56]);
    }

    #[test]
    fn test_visit_within_range_stops_at_array_end() {
        let (mut buf, meta) = fixture();
        buf.0[0] = 1u64 << 32;
        let base = base_of(&mut buf);
        let p = base.as_ptr();
        let mut rec = OffsetRecorder::new(p);
        unsafe { SlotVisitor::visit_within_range(&mut rec, base, &meta, p.add(20), p.add(64)) };
        assert_eq!(rec.offsets(), vec![24]);
    }

    #[test]
    fn test_empty_range_visits_nothing() {
        let (mut buf, meta) = fixture();
        let base = base_of(&mut buf);
        let p = base.as_ptr();
        let mut counter = CountingAcceptor::new();
        unsafe { SlotVisitor::visit_within_range(&mut counter, base, &meta, p.add(32), p.add(32)) };
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_acceptor_can_rewrite_slots() {
        struct Overwrite;
        impl SlotAcceptor for Overwrite {
            fn accept_pointer(&mut self, slot: &mut GcPointer, _: Option<&'static str>) {
                *slot = GcPointer::NULL;
            }
            fn accept_value(&mut self, slot: &mut Value, _: Option<&'static str>) {
                *slot = Value::int32(7);
            }
            fn accept_weak(&mut self, _: &mut WeakSlotId, _: Option<&'static str>) {}
        }

        let (mut buf, meta) = fixture();
        let base = base_of(&mut buf);
        unsafe { SlotVisitor::visit(&mut Overwrite, base, &meta) };
        assert_eq!(Value::int32(7).raw(), buf.0[3]);
        assert_eq!(Value::int32(7).raw(), buf.0[7]);
    }
}
