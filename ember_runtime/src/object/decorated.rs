//! Objects carrying an opaque native decoration.
//!
//! ```text
//! ┌──────────────────────┬────────────┬────────────┬──────────────────┐
//! │ PlainObject (64)     │ decoration │ additional │ additional slots │
//! │                      │ Box<dyn>   │ count: u32 │ [Value; count]   │
//! └──────────────────────┴────────────┴────────────┴──────────────────┘
//!  0                      64           80           88
//! ```
//!
//! The decoration is owned by the cell and dropped when the cell is
//! finalized. Up to [`MAX_ADDITIONAL_SLOTS`] extra value slots trail the
//! fixed part and are traced like any other value.

use std::any::Any;
use std::mem::offset_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use ember_gc::cell::FinalizeContext;
use ember_gc::metadata::{ArrayData, MetadataBuilder, SlotKind};
use ember_gc::{CellKind, CellLayout, CellRef, GcCell, Heap, Value, VTable};

use super::PlainObject;
use crate::barrier::store_value_raw;
use crate::error::{RuntimeError, RuntimeResult};

/// Most trailing value slots a decorated object may request.
pub const MAX_ADDITIONAL_SLOTS: u32 = 3;

/// Native state attached to a [`DecoratedObject`].
pub trait Decoration: Any {
    /// Native bytes owned by the decoration.
    fn malloc_size(&self) -> usize {
        0
    }

    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An object that owns a native [`Decoration`].
#[repr(C)]
pub struct DecoratedObject {
    base: PlainObject,
    decoration: Option<Box<dyn Decoration>>,
    additional_count: AtomicU32,
}

impl DecoratedObject {
    /// Offset of the first additional slot.
    pub const DATA_OFFSET: usize = std::mem::size_of::<DecoratedObject>();

    /// Cell size for `additional` trailing slots.
    pub fn allocation_size(additional: u32) -> RuntimeResult<u32> {
        if additional > MAX_ADDITIONAL_SLOTS {
            return Err(RuntimeError::TooManySlots {
                requested: additional as u64,
                max: MAX_ADDITIONAL_SLOTS as u64,
            });
        }
        Ok(Self::DATA_OFFSET as u32 + additional * std::mem::size_of::<Value>() as u32)
    }

    /// Allocate a decorated object with `additional` empty trailing slots.
    pub fn create(
        heap: &mut Heap,
        prototype: Option<NonNull<GcCell>>,
        decoration: Box<dyn Decoration>,
        additional: u32,
    ) -> RuntimeResult<CellRef<Self>> {
        let size = Self::allocation_size(additional)?;
        let obj = heap.alloc_variable(
            size,
            DecoratedObject {
                base: PlainObject::new(prototype),
                decoration: Some(decoration),
                additional_count: AtomicU32::new(additional),
            },
        )?;
        Ok(obj)
    }

    /// The ordinary object part.
    #[inline]
    pub fn object(&self) -> &PlainObject {
        &self.base
    }

    /// Mutable access to the ordinary object part.
    #[inline]
    pub fn object_mut(&mut self) -> &mut PlainObject {
        &mut self.base
    }

    /// The attached decoration.
    pub fn decoration(&self) -> Option<&dyn Decoration> {
        self.decoration.as_deref()
    }

    /// Mutable access to the attached decoration.
    pub fn decoration_mut(&mut self) -> Option<&mut (dyn Decoration + 'static)> {
        self.decoration.as_deref_mut()
    }

    /// The decoration as its concrete type.
    pub fn decoration_as<D: Decoration>(&self) -> Option<&D> {
        self.decoration()?.as_any().downcast_ref()
    }

    /// Replace the decoration, returning the previous one.
    pub fn set_decoration(&mut self, decoration: Box<dyn Decoration>) -> Option<Box<dyn Decoration>> {
        self.decoration.replace(decoration)
    }

    /// Number of trailing slots.
    #[inline]
    pub fn additional_slot_count(&self) -> u32 {
        self.additional_count.load(Ordering::Acquire)
    }

    #[inline]
    fn additional_data(&self) -> *mut Value {
        (self as *const Self as *mut u8)
            .wrapping_add(Self::DATA_OFFSET)
            .cast()
    }

    /// The trailing slot at `index`.
    pub fn get_additional_slot(&self, index: u32) -> Option<Value> {
        // SAFETY: index < count, and count slots were allocated.
        (index < self.additional_slot_count())
            .then(|| unsafe { self.additional_data().add(index as usize).read() })
    }

    /// Overwrite the trailing slot at `index`.
    pub fn set_additional_slot(&mut self, heap: &Heap, index: u32, value: Value) -> RuntimeResult<()> {
        let len = self.additional_slot_count();
        if index >= len {
            return Err(RuntimeError::IndexOutOfBounds { index, len });
        }
        // SAFETY: index < count, and the slot lies inside this heap cell.
        unsafe { store_value_raw(heap, self.additional_data().add(index as usize), value) };
        Ok(())
    }
}

// =============================================================================
// Cell description
// =============================================================================

unsafe fn decorated_finalize(cell: NonNull<GcCell>, ctx: &mut FinalizeContext) {
    let this = cell.cast::<DecoratedObject>().as_ptr();
    let released = unsafe { (*this).decoration.as_ref() }.map_or(0, |d| d.malloc_size());
    // SAFETY: the cell is dead and is not touched again.
    unsafe { std::ptr::drop_in_place(this) };
    ctx.release_native(released);
}

unsafe fn decorated_malloc_size(cell: NonNull<GcCell>) -> usize {
    let this = unsafe { cell.cast::<DecoratedObject>().as_ref() };
    this.decoration.as_ref().map_or(0, |d| d.malloc_size())
}

static DECORATED_OBJECT_VTABLE: VTable = VTable::new(CellKind::DecoratedObject, 0)
    .with_finalizer(decorated_finalize)
    .with_malloc_size(decorated_malloc_size);

unsafe impl CellLayout for DecoratedObject {
    const VTABLE: &'static VTable = &DECORATED_OBJECT_VTABLE;

    fn build_metadata(builder: &mut MetadataBuilder) {
        PlainObject::add_fields(builder);
        builder.add_array(ArrayData::new(
            SlotKind::Value,
            DecoratedObject::DATA_OFFSET,
            offset_of!(DecoratedObject, additional_count),
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;
    use crate::registry::new_heap;
    use ember_gc::HeapConfig;

    struct Buffer {
        bytes: Vec<u8>,
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for Buffer {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Decoration for Buffer {
        fn malloc_size(&self) -> usize {
            self.bytes.capacity()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn buffer(len: usize, dropped: &Arc<AtomicUsize>) -> Box<dyn Decoration> {
        Box::new(Buffer {
            bytes: vec![0; len],
            dropped: Arc::clone(dropped),
        })
    }

    #[test]
    fn test_layout() {
        assert_eq!(offset_of!(DecoratedObject, decoration), 64);
        assert_eq!(offset_of!(DecoratedObject, additional_count), 80);
        assert_eq!(DecoratedObject::DATA_OFFSET, 88);
        assert_eq!(DecoratedObject::allocation_size(3).unwrap(), 112);
        assert!(matches!(
            DecoratedObject::allocation_size(4),
            Err(RuntimeError::TooManySlots { requested: 4, max: 3 })
        ));
    }

    #[test]
    fn test_additional_slots() {
        let mut heap = new_heap(HeapConfig::for_testing()).unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut obj = DecoratedObject::create(&mut heap, None, buffer(8, &dropped), 2).unwrap();

        assert_eq!(obj.additional_slot_count(), 2);
        assert_eq!(obj.get_additional_slot(1), Some(Value::EMPTY));
        obj.set_additional_slot(&heap, 1, Value::int32(3)).unwrap();
        assert_eq!(obj.get_additional_slot(1), Some(Value::int32(3)));
        assert_eq!(obj.get_additional_slot(2), None);
        assert!(obj.set_additional_slot(&heap, 2, Value::NULL).is_err());

        obj.object_mut().set_slot(&heap, 0, Value::bool(true)).unwrap();
        assert_eq!(obj.object().get_slot(0), Some(Value::bool(true)));
    }

    #[test]
    fn test_decoration_downcast_and_replace() {
        let mut heap = new_heap(HeapConfig::for_testing()).unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut obj = DecoratedObject::create(&mut heap, None, buffer(16, &dropped), 0).unwrap();

        assert_eq!(obj.decoration_as::<Buffer>().unwrap().bytes.len(), 16);
        let old = obj.set_decoration(buffer(32, &dropped));
        drop(old);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(obj.decoration().unwrap().malloc_size(), 32);
    }

    #[test]
    fn test_dead_object_drops_decoration() {
        let mut heap = new_heap(HeapConfig::for_testing()).unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let live = DecoratedObject::create(&mut heap, None, buffer(64, &dropped), 1).unwrap();
        DecoratedObject::create(&mut heap, None, buffer(100, &dropped), 3).unwrap();
        let root = heap.add_root(live.as_cell());
        assert_eq!(heap.count_malloc_size(), 164);

        let result = heap.collect();
        assert_eq!(result.cells_finalized, 1);
        assert_eq!(result.native_bytes_released, 100);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        let live = heap.root_as::<DecoratedObject>(root).unwrap();
        assert_eq!(live.decoration_as::<Buffer>().unwrap().bytes.len(), 64);
        assert_eq!(live.additional_slot_count(), 1);

        drop(heap);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }
}
