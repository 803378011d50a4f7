//! Cell types shared by the crate's unit tests.

use std::mem::offset_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cell::{CellKind, CellLayout, CellRef, CellRegistry, FinalizeContext, GcCell, GcPointer, VTable};
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::heap::Heap;
use crate::metadata::{ArrayData, MetadataBuilder, SlotKind};
use crate::trace::WeakRefAcceptor;
use crate::value::Value;
use crate::weak::{WeakSlotId, WeakValueMap};

/// Every kind the test cells use.
pub fn registry() -> Arc<CellRegistry> {
    let registry = CellRegistry::builder()
        .register_layout::<Leaf>()
        .register_layout::<Node>()
        .register_layout::<Vector>()
        .register_layout::<Tracked>()
        .build()
        .unwrap();
    Arc::new(registry)
}

/// A small self-verifying heap.
pub fn heap() -> Heap {
    Heap::new(HeapConfig::for_testing(), registry()).unwrap()
}

// =============================================================================
// Leaf: one value slot
// =============================================================================

#[repr(C)]
pub struct Leaf {
    header: GcCell,
    pub value: Value,
}

static LEAF_VTABLE: VTable = VTable::new(CellKind::HostObject, 24);

impl Leaf {
    pub fn new(value: Value) -> Self {
        Self {
            header: GcCell::uninit(),
            value,
        }
    }
}

unsafe impl CellLayout for Leaf {
    const VTABLE: &'static VTable = &LEAF_VTABLE;

    fn build_metadata(builder: &mut MetadataBuilder) {
        builder.add_value(offset_of!(Leaf, value), "value");
    }
}

// =============================================================================
// Node: pointer, value and weak slot
// =============================================================================

#[repr(C)]
pub struct Node {
    header: GcCell,
    pub next: GcPointer,
    pub value: Value,
    pub weak: WeakSlotId,
}

static NODE_VTABLE: VTable = VTable::new(CellKind::PlainObject, 40);

impl Node {
    pub fn new(next: Option<NonNull<GcCell>>, value: Value) -> Self {
        Self {
            header: GcCell::uninit(),
            next: GcPointer::from_option(next),
            value,
            weak: WeakSlotId::NONE,
        }
    }
}

unsafe impl CellLayout for Node {
    const VTABLE: &'static VTable = &NODE_VTABLE;

    fn build_metadata(builder: &mut MetadataBuilder) {
        builder
            .add_pointer(offset_of!(Node, next), "next")
            .add_value(offset_of!(Node, value), "value")
            .add_weak(offset_of!(Node, weak), "weak");
    }
}

// =============================================================================
// Vector: growable value array that shrinks to its length when compacted
// =============================================================================

#[repr(C)]
pub struct Vector {
    header: GcCell,
    capacity: u32,
    length: AtomicU32,
}

impl Vector {
    pub const DATA_OFFSET: usize = 24;

    pub fn alloc(heap: &mut Heap, capacity: u32) -> Result<CellRef<Vector>, HeapError> {
        let size = Self::DATA_OFFSET as u32 + capacity * 8;
        heap.alloc_variable(
            size,
            Vector {
                header: GcCell::uninit(),
                capacity,
                length: AtomicU32::new(0),
            },
        )
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        self.length.load(Ordering::Acquire)
    }

    fn data(&self) -> *mut Value {
        (self as *const Self as *mut u8)
            .wrapping_add(Self::DATA_OFFSET)
            .cast()
    }

    pub fn slot(&self, index: u32) -> Value {
        assert!(index < self.capacity);
        unsafe { self.data().add(index as usize).read() }
    }

    pub fn push(&mut self, value: Value) {
        let len = self.len();
        assert!(len < self.capacity, "vector is full");
        unsafe { self.data().add(len as usize).write(value) };
        self.length.store(len + 1, Ordering::Release);
    }
}

unsafe fn vector_compact_size(cell: NonNull<GcCell>) -> u32 {
    let vector = unsafe { cell.cast::<Vector>().as_ref() };
    Vector::DATA_OFFSET as u32 + vector.len() * 8
}

unsafe fn vector_compact(cell: NonNull<GcCell>, new_size: u32) {
    let vector = unsafe { cell.cast::<Vector>().as_mut() };
    vector.capacity = (new_size - Vector::DATA_OFFSET as u32) / 8;
}

static VECTOR_VTABLE: VTable = VTable::new(CellKind::ArrayStorage, 0)
    .with_compaction(vector_compact_size, vector_compact);

unsafe impl CellLayout for Vector {
    const VTABLE: &'static VTable = &VECTOR_VTABLE;

    fn build_metadata(builder: &mut MetadataBuilder) {
        builder.add_array(ArrayData::new(
            SlotKind::Value,
            Vector::DATA_OFFSET,
            offset_of!(Vector, length),
        ));
    }
}

// =============================================================================
// Tracked: native resources, a finalizer and a weak value cache
// =============================================================================

#[repr(C)]
pub struct Tracked {
    header: GcCell,
    finalized: Option<Arc<AtomicUsize>>,
    cache: Option<Box<WeakValueMap<u32, Leaf>>>,
}

impl Tracked {
    /// Native bytes every tracked cell reports owning.
    pub const NATIVE_SIZE: usize = 128;

    pub fn new(finalized: &Arc<AtomicUsize>) -> Self {
        Self {
            header: GcCell::uninit(),
            finalized: Some(Arc::clone(finalized)),
            cache: None,
        }
    }

    pub fn with_cache(finalized: &Arc<AtomicUsize>) -> Self {
        Self {
            cache: Some(Box::default()),
            ..Self::new(finalized)
        }
    }

    pub fn cache_mut(&mut self) -> &mut WeakValueMap<u32, Leaf> {
        self.cache.get_or_insert_with(Box::default)
    }
}

unsafe fn tracked_finalize(cell: NonNull<GcCell>, ctx: &mut FinalizeContext) {
    let this = cell.cast::<Tracked>().as_ptr();
    unsafe {
        if let Some(counter) = &(*this).finalized {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        std::ptr::drop_in_place(this);
    }
    ctx.release_native(Tracked::NATIVE_SIZE);
}

unsafe fn tracked_mark_weak(cell: NonNull<GcCell>, acceptor: &mut dyn WeakRefAcceptor) {
    let this = unsafe { cell.cast::<Tracked>().as_mut() };
    if let Some(cache) = this.cache.as_mut() {
        cache.mark_weak_refs(acceptor);
    }
}

unsafe fn tracked_malloc_size(cell: NonNull<GcCell>) -> usize {
    let this = unsafe { cell.cast::<Tracked>().as_ref() };
    Tracked::NATIVE_SIZE + this.cache.as_ref().map_or(0, |cache| cache.native_size())
}

static TRACKED_VTABLE: VTable = VTable::new(CellKind::Domain, 32)
    .with_finalizer(tracked_finalize)
    .with_mark_weak(tracked_mark_weak)
    .with_malloc_size(tracked_malloc_size);

unsafe impl CellLayout for Tracked {
    const VTABLE: &'static VTable = &TRACKED_VTABLE;

    fn build_metadata(_builder: &mut MetadataBuilder) {}
}
