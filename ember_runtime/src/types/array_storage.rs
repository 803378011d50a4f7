//! Variable-size backing store of tagged values.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────┬──────────┬──────────┬─────────┬─────────┬─────┐
//! │ GcCell (16)  │ capacity │   size   │ data[0] │ data[1] │ ... │
//! │              │   u32    │ AtomicU32│  Value  │  Value  │     │
//! └──────────────┴──────────┴──────────┴─────────┴─────────┴─────┘
//!  0              16         20         24
//! ```
//!
//! Only the first `size` elements are visited by the collector. The slots
//! between `size` and `capacity` are kept empty. On compaction the cell
//! shrinks so that capacity equals size.

use std::mem::offset_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use ember_gc::metadata::{ArrayData, MetadataBuilder, SlotKind};
use ember_gc::{CellKind, CellLayout, CellRef, GcCell, Heap, KindAndSize, Value, VTable};

use crate::barrier::store_value_raw;
use crate::error::{RuntimeError, RuntimeResult};

/// Smallest capacity chosen when a full storage grows.
const MIN_GROWTH_CAPACITY: u32 = 4;

/// A resizable array of values living in a single heap cell.
#[repr(C)]
pub struct ArrayStorage {
    header: GcCell,
    capacity: u32,
    size: AtomicU32,
}

impl ArrayStorage {
    /// Offset of element 0.
    pub const DATA_OFFSET: usize = std::mem::size_of::<ArrayStorage>();

    /// Largest capacity a single storage cell can describe.
    pub const MAX_CAPACITY: u32 =
        (KindAndSize::max_size() - Self::DATA_OFFSET as u32) / std::mem::size_of::<Value>() as u32;

    /// Cell size needed for `capacity` elements.
    pub fn allocation_size(capacity: u32) -> RuntimeResult<u32> {
        if capacity > Self::MAX_CAPACITY {
            return Err(RuntimeError::TooManySlots {
                requested: capacity as u64,
                max: Self::MAX_CAPACITY as u64,
            });
        }
        Ok(Self::DATA_OFFSET as u32 + capacity * std::mem::size_of::<Value>() as u32)
    }

    /// Allocate an empty storage able to hold `capacity` elements.
    pub fn create(heap: &mut Heap, capacity: u32) -> RuntimeResult<CellRef<Self>> {
        let size = Self::allocation_size(capacity)?;
        let storage = heap.alloc_variable(
            size,
            ArrayStorage {
                header: GcCell::uninit(),
                capacity,
                size: AtomicU32::new(0),
            },
        )?;
        Ok(storage)
    }

    /// Number of elements that fit without reallocating.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of elements in use.
    #[inline]
    pub fn len(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Whether no elements are in use.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn data(&self) -> *mut Value {
        (self as *const Self as *mut u8)
            .wrapping_add(Self::DATA_OFFSET)
            .cast()
    }

    /// The element at `index`, or `None` past the end.
    #[inline]
    pub fn get(&self, index: u32) -> Option<Value> {
        // SAFETY: index < len <= capacity.
        (index < self.len()).then(|| unsafe { self.data().add(index as usize).read() })
    }

    /// The element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn at(&self, index: u32) -> Value {
        self.get(index)
            .unwrap_or_else(|| panic!("index {index} out of bounds for length {}", self.len()))
    }

    /// The elements in use.
    pub fn as_slice(&self) -> &[Value] {
        // SAFETY: the first len elements are initialized values.
        unsafe { std::slice::from_raw_parts(self.data(), self.len() as usize) }
    }

    /// Iterate the elements in use.
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.as_slice().iter().copied()
    }

    /// Overwrite the element at `index`.
    pub fn set(&mut self, heap: &Heap, index: u32, value: Value) -> RuntimeResult<()> {
        let len = self.len();
        if index >= len {
            return Err(RuntimeError::IndexOutOfBounds { index, len });
        }
        // SAFETY: index < len, and the slot lies inside this heap cell.
        unsafe { store_value_raw(heap, self.data().add(index as usize), value) };
        Ok(())
    }

    /// Append one element within the current capacity.
    pub fn push(&mut self, heap: &Heap, value: Value) -> RuntimeResult<()> {
        let len = self.len();
        if len >= self.capacity {
            return Err(RuntimeError::ArrayFull {
                capacity: self.capacity,
            });
        }
        // The element must be in place before the length covers it.
        unsafe { store_value_raw(heap, self.data().add(len as usize), value) };
        self.size.store(len + 1, Ordering::Release);
        Ok(())
    }

    /// Remove and return the last element.
    pub fn pop(&mut self) -> Option<Value> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let last = len - 1;
        self.size.store(last, Ordering::Release);
        // SAFETY: last < capacity. The slot is no longer visited, so
        // clearing it needs no barrier.
        unsafe {
            let slot = self.data().add(last as usize);
            let value = slot.read();
            slot.write(Value::EMPTY);
            Some(value)
        }
    }

    /// Append `value`, moving to a larger storage when full.
    ///
    /// Returns the storage that now holds the elements, which is `this`
    /// unless it had to grow. A grown storage replaces `this` in every
    /// slot that referenced it.
    pub fn append(this: CellRef<Self>, heap: &mut Heap, value: Value) -> RuntimeResult<CellRef<Self>> {
        let mut target = this;
        if target.len() == target.capacity {
            let wanted = Self::grown_capacity(target.capacity).ok_or(RuntimeError::ArrayFull {
                capacity: target.capacity,
            })?;
            target = Self::reallocate(this, heap, wanted)?;
        }
        target.push(heap, value)?;
        Ok(target)
    }

    /// Capacity to grow a full storage of `capacity` to, or `None` when it
    /// is already at [`MAX_CAPACITY`](Self::MAX_CAPACITY).
    fn grown_capacity(capacity: u32) -> Option<u32> {
        (capacity < Self::MAX_CAPACITY).then(|| {
            capacity
                .saturating_mul(2)
                .max(MIN_GROWTH_CAPACITY)
                .min(Self::MAX_CAPACITY)
        })
    }

    /// Change the length to `new_len`.
    ///
    /// Growing fills the new elements with [`Value::EMPTY`] and may move to a
    /// larger storage, as with [`append`](Self::append). Shrinking clears
    /// the dropped elements.
    pub fn resize(this: CellRef<Self>, heap: &mut Heap, new_len: u32) -> RuntimeResult<CellRef<Self>> {
        let mut target = this;
        let len = target.len();
        if new_len <= len {
            while target.len() > new_len {
                target.pop();
            }
            return Ok(target);
        }
        if new_len > target.capacity {
            target = Self::reallocate(this, heap, new_len)?;
        }
        // The tail past len is already empty.
        target.size.store(new_len, Ordering::Release);
        Ok(target)
    }

    /// Make room for at least `capacity` elements.
    ///
    /// Returns `this` when it is already large enough, otherwise a larger
    /// storage holding the same elements.
    pub fn reserve(this: CellRef<Self>, heap: &mut Heap, capacity: u32) -> RuntimeResult<CellRef<Self>> {
        if capacity <= this.capacity {
            return Ok(this);
        }
        Self::reallocate(this, heap, capacity)
    }

    /// Copy the elements of `this` into a fresh storage of `capacity`.
    fn reallocate(this: CellRef<Self>, heap: &mut Heap, capacity: u32) -> RuntimeResult<CellRef<Self>> {
        let len = this.len();
        if capacity < len {
            return Err(RuntimeError::TooManySlots {
                requested: len as u64,
                max: capacity as u64,
            });
        }
        // The source is not moved by allocation: collection never runs
        // implicitly.
        let grown = Self::create(heap, capacity)?;
        // SAFETY: both cells are live and disjoint, and the destination
        // is unpublished so its stores need no barrier.
        unsafe {
            std::ptr::copy_nonoverlapping(this.data(), grown.data(), len as usize);
        }
        grown.size.store(len, Ordering::Release);
        tracing::trace!(from = this.capacity, to = capacity, len, "array storage grew");
        Ok(grown)
    }
}

impl std::fmt::Debug for ArrayStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayStorage")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Cell description
// =============================================================================

unsafe fn array_storage_compacted_size(cell: NonNull<GcCell>) -> u32 {
    let storage = unsafe { cell.cast::<ArrayStorage>().as_ref() };
    ArrayStorage::DATA_OFFSET as u32 + storage.len() * std::mem::size_of::<Value>() as u32
}

unsafe fn array_storage_compact(cell: NonNull<GcCell>, new_size: u32) {
    let storage = unsafe { cell.cast::<ArrayStorage>().as_mut() };
    storage.capacity = (new_size - ArrayStorage::DATA_OFFSET as u32) / std::mem::size_of::<Value>() as u32;
    debug_assert!(storage.capacity >= storage.len());
}

static ARRAY_STORAGE_VTABLE: VTable = VTable::new(CellKind::ArrayStorage, 0)
    .with_compaction(array_storage_compacted_size, array_storage_compact);

unsafe impl CellLayout for ArrayStorage {
    const VTABLE: &'static VTable = &ARRAY_STORAGE_VTABLE;

    fn build_metadata(builder: &mut MetadataBuilder) {
        builder.add_array(ArrayData::new(
            SlotKind::Value,
            ArrayStorage::DATA_OFFSET,
            offset_of!(ArrayStorage, size),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::new_heap;
    use ember_gc::HeapConfig;

    fn heap() -> Heap {
        new_heap(HeapConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_layout() {
        assert_eq!(ArrayStorage::DATA_OFFSET, 24);
        assert_eq!(offset_of!(ArrayStorage, capacity), 16);
        assert_eq!(offset_of!(ArrayStorage, size), 20);
        assert_eq!(ArrayStorage::allocation_size(4).unwrap(), 56);
    }

    #[test]
    fn test_create_is_empty() {
        let mut heap = heap();
        let storage = ArrayStorage::create(&mut heap, 8).unwrap();
        assert_eq!(storage.capacity(), 8);
        assert!(storage.is_empty());
        assert_eq!(storage.get(0), None);
        assert_eq!(storage.header().get_allocated_size(), 24 + 64);
    }

    #[test]
    fn test_push_get_set() {
        let mut heap = heap();
        let mut storage = ArrayStorage::create(&mut heap, 2).unwrap();
        storage.push(&heap, Value::int32(1)).unwrap();
        storage.push(&heap, Value::int32(2)).unwrap();
        assert_eq!(
            storage.push(&heap, Value::int32(3)),
            Err(RuntimeError::ArrayFull { capacity: 2 })
        );

        storage.set(&heap, 0, Value::bool(true)).unwrap();
        assert_eq!(storage.at(0), Value::bool(true));
        assert_eq!(
            storage.set(&heap, 2, Value::NULL),
            Err(RuntimeError::IndexOutOfBounds { index: 2, len: 2 })
        );
        assert_eq!(storage.as_slice(), &[Value::bool(true), Value::int32(2)]);
    }

    #[test]
    fn test_pop_clears_slot() {
        let mut heap = heap();
        let mut storage = ArrayStorage::create(&mut heap, 2).unwrap();
        storage.push(&heap, Value::int32(9)).unwrap();
        assert_eq!(storage.pop(), Some(Value::int32(9)));
        assert_eq!(storage.pop(), None);
        let raw = unsafe { storage.data().read() };
        assert!(raw.is_empty());
    }

    #[test]
    fn test_append_grows() {
        let mut heap = heap();
        let mut storage = ArrayStorage::create(&mut heap, 0).unwrap();
        for i in 0..10 {
            storage = ArrayStorage::append(storage, &mut heap, Value::int32(i)).unwrap();
        }
        assert_eq!(storage.len(), 10);
        assert_eq!(storage.capacity(), 16);
        let values: Vec<_> = storage.iter().filter_map(Value::as_int32).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_growth_stops_at_max_capacity() {
        assert_eq!(ArrayStorage::grown_capacity(0), Some(MIN_GROWTH_CAPACITY));
        assert_eq!(ArrayStorage::grown_capacity(6), Some(12));
        let near = ArrayStorage::MAX_CAPACITY - 1;
        assert_eq!(ArrayStorage::grown_capacity(near), Some(ArrayStorage::MAX_CAPACITY));
        // A full storage at the limit is reported without reallocating.
        assert_eq!(ArrayStorage::grown_capacity(ArrayStorage::MAX_CAPACITY), None);
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let mut heap = heap();
        let mut storage = ArrayStorage::create(&mut heap, 2).unwrap();
        storage.push(&heap, Value::int32(1)).unwrap();

        let storage = ArrayStorage::resize(storage, &mut heap, 6).unwrap();
        assert_eq!(storage.len(), 6);
        assert_eq!(storage.capacity(), 6);
        assert_eq!(storage.at(0), Value::int32(1));
        assert!(storage.at(5).is_empty());

        let storage = ArrayStorage::resize(storage, &mut heap, 1).unwrap();
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.capacity(), 6);
    }

    #[test]
    fn test_reserve_keeps_small_requests() {
        let mut heap = heap();
        let mut storage = ArrayStorage::create(&mut heap, 4).unwrap();
        storage.push(&heap, Value::int32(1)).unwrap();

        let same = ArrayStorage::reserve(storage, &mut heap, 3).unwrap();
        assert_eq!(same, storage);

        let grown = ArrayStorage::reserve(storage, &mut heap, 12).unwrap();
        assert_ne!(grown, storage);
        assert_eq!(grown.capacity(), 12);
        assert_eq!(grown.as_slice(), &[Value::int32(1)]);
    }

    #[test]
    fn test_too_large_capacity_is_rejected() {
        let mut heap = heap();
        let err = ArrayStorage::create(&mut heap, u32::MAX).unwrap_err();
        assert!(matches!(err, RuntimeError::TooManySlots { .. }));
    }

    #[test]
    fn test_compaction_trims_capacity() {
        let mut heap = heap();
        let mut storage = ArrayStorage::create(&mut heap, 32).unwrap();
        storage.push(&heap, Value::int32(5)).unwrap();
        storage.push(&heap, Value::int32(6)).unwrap();
        let root = heap.add_root(storage.as_cell());

        let result = heap.collect();
        assert_eq!(result.bytes_compacted, 30 * 8);

        let storage = heap.root_as::<ArrayStorage>(root).unwrap();
        assert_eq!(storage.capacity(), 2);
        assert_eq!(storage.header().get_allocated_size(), 24 + 16);
        assert_eq!(storage.as_slice(), &[Value::int32(5), Value::int32(6)]);
        heap.check_well_formed().unwrap();
    }
}
