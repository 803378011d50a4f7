//! Ordinary objects.
//!
//! A plain object keeps its first [`DIRECT_SLOTS`] property values inline
//! and spills the rest into an [`ArrayStorage`]:
//!
//! ```text
//! ┌──────────────┬───────────┬────────────┬───────────────────────┐
//! │ GcCell (16)  │ prototype │ properties │ direct[0..4]          │
//! │              │ GcPointer │ GcPointer ─┼──► ArrayStorage       │
//! └──────────────┴───────────┴────────────┴───────────────────────┘
//!  0              16          24           32                     64
//! ```
//!
//! Slot `i` below `DIRECT_SLOTS` is `direct[i]`; slot `i` above is element
//! `i - DIRECT_SLOTS` of the property storage.

use std::mem::offset_of;
use std::ptr::NonNull;

use ember_gc::cell::heap_align_size;
use ember_gc::metadata::MetadataBuilder;
use ember_gc::{CellKind, CellLayout, CellRef, GcCell, GcPointer, Heap, Value, VTable};

use crate::barrier::{store_pointer, store_value};
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::ArrayStorage;

/// Property values stored inline in every object.
pub const DIRECT_SLOTS: usize = 4;

/// Capacity of the first property storage an object spills into.
const INITIAL_SPILL_CAPACITY: u32 = 4;

/// An ordinary object.
#[repr(C)]
pub struct PlainObject {
    header: GcCell,
    prototype: GcPointer,
    properties: GcPointer,
    direct: [Value; DIRECT_SLOTS],
}

impl PlainObject {
    /// An unallocated object with every direct slot empty.
    pub fn new(prototype: Option<NonNull<GcCell>>) -> Self {
        Self {
            header: GcCell::uninit(),
            prototype: GcPointer::from_option(prototype),
            properties: GcPointer::NULL,
            direct: [Value::EMPTY; DIRECT_SLOTS],
        }
    }

    /// Allocate an empty object.
    pub fn create(heap: &mut Heap, prototype: Option<NonNull<GcCell>>) -> RuntimeResult<CellRef<Self>> {
        Ok(heap.alloc_fixed(Self::new(prototype))?)
    }

    /// Declare the slots of an object embedded at the start of another kind.
    pub(crate) fn add_fields(builder: &mut MetadataBuilder) {
        builder
            .add_pointer(offset_of!(PlainObject, prototype), "prototype")
            .add_pointer(offset_of!(PlainObject, properties), "properties");
        let direct = offset_of!(PlainObject, direct);
        const NAMES: [&str; DIRECT_SLOTS] = ["direct0", "direct1", "direct2", "direct3"];
        for (i, name) in NAMES.into_iter().enumerate() {
            builder.add_value(direct + i * std::mem::size_of::<Value>(), name);
        }
    }

    // =========================================================================
    // Prototype
    // =========================================================================

    /// The prototype object.
    #[inline]
    pub fn prototype(&self) -> Option<NonNull<GcCell>> {
        self.prototype.get()
    }

    /// Replace the prototype.
    pub fn set_prototype(&mut self, heap: &Heap, prototype: Option<NonNull<GcCell>>) {
        store_pointer(heap, &mut self.prototype, prototype);
    }

    // =========================================================================
    // Slots
    // =========================================================================

    /// The spilled property storage, if any property spilled.
    pub fn properties(&self) -> Option<CellRef<ArrayStorage>> {
        // SAFETY: the properties slot only ever holds an ArrayStorage.
        self.properties
            .get()
            .map(|cell| unsafe { CellRef::from_cell_unchecked(cell) })
    }

    /// Number of addressable slots.
    pub fn slot_count(&self) -> u32 {
        DIRECT_SLOTS as u32 + self.properties().map_or(0, |props| props.len())
    }

    /// The value in slot `index`, or `None` past the last slot.
    pub fn get_slot(&self, index: u32) -> Option<Value> {
        match index.checked_sub(DIRECT_SLOTS as u32) {
            None => Some(self.direct[index as usize]),
            Some(spilled) => self.properties()?.get(spilled),
        }
    }

    /// Overwrite slot `index`.
    pub fn set_slot(&mut self, heap: &Heap, index: u32, value: Value) -> RuntimeResult<()> {
        match index.checked_sub(DIRECT_SLOTS as u32) {
            None => {
                store_value(heap, &mut self.direct[index as usize], value);
                Ok(())
            }
            Some(spilled) => match self.properties() {
                Some(mut props) => props.set(heap, spilled, value),
                None => Err(RuntimeError::IndexOutOfBounds {
                    index,
                    len: DIRECT_SLOTS as u32,
                }),
            },
        }
    }

    /// Append a slot past the current last one and return its index.
    ///
    /// The first push allocates the property storage; later pushes may
    /// move it to a larger one.
    pub fn push_slot(&mut self, heap: &mut Heap, value: Value) -> RuntimeResult<u32> {
        let props = match self.properties() {
            Some(props) => props,
            None => ArrayStorage::create(heap, INITIAL_SPILL_CAPACITY)?,
        };
        let props = ArrayStorage::append(props, heap, value)?;
        if self.properties.get() != Some(props.as_cell()) {
            store_pointer(heap, &mut self.properties, Some(props.as_cell()));
        }
        Ok(DIRECT_SLOTS as u32 + props.len() - 1)
    }

    /// Mutable access to a direct slot, for stores that issue their own
    /// barrier.
    ///
    /// # Panics
    ///
    /// Panics if `index >= DIRECT_SLOTS`.
    pub fn direct_slot_mut(&mut self, index: usize) -> &mut Value {
        &mut self.direct[index]
    }
}

impl std::fmt::Debug for PlainObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainObject")
            .field("prototype", &self.prototype)
            .field("properties", &self.properties)
            .field("direct", &self.direct)
            .finish()
    }
}

static PLAIN_OBJECT_VTABLE: VTable = VTable::new(
    CellKind::PlainObject,
    heap_align_size(std::mem::size_of::<PlainObject>()) as u32,
);

unsafe impl CellLayout for PlainObject {
    const VTABLE: &'static VTable = &PLAIN_OBJECT_VTABLE;

    fn build_metadata(builder: &mut MetadataBuilder) {
        Self::add_fields(builder);
    }
}
