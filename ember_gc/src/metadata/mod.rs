//! Slot layout descriptions for cell kinds.
//!
//! Every kind declares where its GC-visible slots live, grouped by slot
//! type, plus at most one trailing array:
//!
//! ```text
//! Metadata
//! ├── offsets
//! │   ├── Pointer: [ (8, "prototype"), (16, "properties") ]
//! │   ├── Value:   [ (24, "direct0"), ... ]
//! │   └── Weak:    [ ]
//! └── array: { kind: Value, start: 64, length at: 20, stride: 8 }
//! ```
//!
//! Offsets are byte offsets from the cell's base address and are built
//! with `std::mem::offset_of!` so they track the Rust layout.

use std::sync::atomic::{AtomicU32, Ordering};

use smallvec::SmallVec;

use crate::cell::GcPointer;
use crate::value::Value;
use crate::weak::WeakSlotId;

// =============================================================================
// Slot kinds
// =============================================================================

/// Type of a GC-visible slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// A [`GcPointer`].
    Pointer = 0,
    /// A tagged [`Value`].
    Value = 1,
    /// A [`WeakSlotId`].
    Weak = 2,
}

impl SlotKind {
    /// Number of slot kinds.
    pub const COUNT: usize = 3;

    /// Visitation order.
    pub const ALL: [SlotKind; Self::COUNT] = [SlotKind::Pointer, SlotKind::Value, SlotKind::Weak];

    /// Size in bytes of one slot of this kind.
    #[inline]
    pub const fn slot_size(self) -> usize {
        match self {
            SlotKind::Pointer => std::mem::size_of::<GcPointer>(),
            SlotKind::Value => std::mem::size_of::<Value>(),
            SlotKind::Weak => std::mem::size_of::<WeakSlotId>(),
        }
    }

    /// Required alignment of a slot of this kind.
    #[inline]
    pub const fn slot_align(self) -> usize {
        match self {
            SlotKind::Pointer => std::mem::align_of::<GcPointer>(),
            SlotKind::Value => std::mem::align_of::<Value>(),
            SlotKind::Weak => std::mem::align_of::<WeakSlotId>(),
        }
    }
}

/// One declared slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Byte offset from the cell base.
    pub offset: u32,
    /// Field name, for diagnostics.
    pub name: &'static str,
}

/// Declared slots grouped by [`SlotKind`].
#[derive(Debug, Clone, Default)]
pub struct SlotOffsets {
    buckets: [SmallVec<[FieldInfo; 4]>; SlotKind::COUNT],
}

impl SlotOffsets {
    /// Slots of one kind, in ascending offset order.
    #[inline]
    pub fn of(&self, kind: SlotKind) -> &[FieldInfo] {
        &self.buckets[kind as usize]
    }

    /// Total number of declared slots.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(SmallVec::len).sum()
    }

    /// Whether no slots are declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every slot with its kind, in visitation order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotKind, &FieldInfo)> + '_ {
        SlotKind::ALL
            .into_iter()
            .flat_map(move |kind| self.of(kind).iter().map(move |field| (kind, field)))
    }

    fn contains_offset(&self, offset: u32) -> bool {
        self.buckets.iter().flatten().any(|f| f.offset == offset)
    }
}

// =============================================================================
// Trailing arrays
// =============================================================================

/// A trailing array of homogeneous slots.
///
/// The element count lives in a `u32` field of the cell and is read with
/// acquire ordering so a concurrent marker never observes an element count
/// ahead of the element stores that preceded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayData {
    /// Element slot type.
    pub kind: SlotKind,
    /// Offset of element 0.
    pub start_offset: u32,
    /// Offset of the `u32` element count.
    pub length_offset: u32,
    /// Distance between consecutive elements.
    pub stride: u32,
}

impl ArrayData {
    /// A densely packed array of `kind` slots.
    pub fn new(kind: SlotKind, start_offset: usize, length_offset: usize) -> Self {
        Self {
            kind,
            start_offset: to_offset(start_offset),
            length_offset: to_offset(length_offset),
            stride: kind.slot_size() as u32,
        }
    }

    /// Override the element stride.
    pub fn with_stride(mut self, stride: u32) -> Self {
        assert!(
            stride as usize >= self.kind.slot_size(),
            "array stride {stride} is smaller than one {:?} slot",
            self.kind
        );
        self.stride = stride;
        self
    }

    /// Read the current element count.
    ///
    /// # Safety
    ///
    /// `base` must address a cell described by this array.
    #[inline]
    pub unsafe fn load_length(&self, base: *const u8) -> u32 {
        let length = unsafe { &*(base.add(self.length_offset as usize) as *const AtomicU32) };
        length.load(Ordering::Acquire)
    }
}

fn to_offset(offset: usize) -> u32 {
    u32::try_from(offset).unwrap_or_else(|_| panic!("slot offset {offset} does not fit in u32"))
}

// =============================================================================
// Metadata
// =============================================================================

/// The complete slot description of a cell kind.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    offsets: SlotOffsets,
    array: Option<ArrayData>,
}

impl Metadata {
    /// Start describing a kind.
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder::new()
    }

    /// Declared fixed slots.
    #[inline]
    pub fn slot_offsets(&self) -> &SlotOffsets {
        &self.offsets
    }

    /// Fixed slots of one kind, in ascending offset order.
    #[inline]
    pub fn fields_of(&self, kind: SlotKind) -> &[FieldInfo] {
        self.offsets.of(kind)
    }

    /// Number of fixed slots, excluding array elements.
    #[inline]
    pub fn field_count(&self) -> usize {
        self.offsets.len()
    }

    /// The trailing array, if any.
    #[inline]
    pub fn array(&self) -> Option<&ArrayData> {
        self.array.as_ref()
    }
}

/// Collects slot declarations for one kind.
///
/// # Panics
///
/// Declaring two slots at the same offset, a misaligned slot, or a second
/// array panics. These are layout bugs in the declaring type.
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    offsets: SlotOffsets,
    array: Option<ArrayData>,
}

impl MetadataBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a slot of `kind` at `offset`.
    pub fn add_field(&mut self, kind: SlotKind, offset: usize, name: &'static str) -> &mut Self {
        assert_eq!(
            offset % kind.slot_align(),
            0,
            "{kind:?} slot '{name}' at offset {offset} is misaligned"
        );
        let offset = to_offset(offset);
        assert!(
            !self.offsets.contains_offset(offset),
            "slot '{name}' declared twice at offset {offset}"
        );
        self.offsets.buckets[kind as usize].push(FieldInfo { offset, name });
        self
    }

    /// Declare a pointer slot.
    #[inline]
    pub fn add_pointer(&mut self, offset: usize, name: &'static str) -> &mut Self {
        self.add_field(SlotKind::Pointer, offset, name)
    }

    /// Declare a value slot.
    #[inline]
    pub fn add_value(&mut self, offset: usize, name: &'static str) -> &mut Self {
        self.add_field(SlotKind::Value, offset, name)
    }

    /// Declare a weak slot.
    #[inline]
    pub fn add_weak(&mut self, offset: usize, name: &'static str) -> &mut Self {
        self.add_field(SlotKind::Weak, offset, name)
    }

    /// Declare the trailing array.
    pub fn add_array(&mut self, array: ArrayData) -> &mut Self {
        assert!(self.array.is_none(), "a cell kind may declare only one array");
        assert_eq!(
            array.start_offset as usize % array.kind.slot_align(),
            0,
            "array elements are misaligned"
        );
        assert_eq!(
            array.length_offset % 4,
            0,
            "array length field is misaligned"
        );
        self.array = Some(array);
        self
    }

    /// Finish the description.
    pub fn build(mut self) -> Metadata {
        for bucket in &mut self.offsets.buckets {
            bucket.sort_unstable_by_key(|f| f.offset);
        }
        Metadata {
            offsets: self.offsets,
            array: self.array,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_sizes() {
        assert_eq!(SlotKind::Pointer.slot_size(), 8);
        assert_eq!(SlotKind::Value.slot_size(), 8);
        assert_eq!(SlotKind::Weak.slot_size(), 8);
    }

    #[test]
    fn test_builder_groups_and_sorts() {
        let mut b = MetadataBuilder::new();
        b.add_pointer(24, "b")
            .add_value(32, "v")
            .add_pointer(16, "a")
            .add_weak(40, "w");
        let meta = b.build();

        let pointers: Vec<_> = meta
            .slot_offsets()
            .of(SlotKind::Pointer)
            .iter()
            .map(|f| f.offset)
            .collect();
        assert_eq!(pointers, vec![16, 24]);
        assert_eq!(meta.slot_offsets().of(SlotKind::Value)[0].name, "v");
        assert_eq!(meta.slot_offsets().len(), 4);
        assert_eq!(meta.field_count(), 4);
        assert_eq!(meta.fields_of(SlotKind::Weak)[0].offset, 40);
        assert!(meta.array().is_none());

        let kinds: Vec<_> = meta.slot_offsets().iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![SlotKind::Pointer, SlotKind::Pointer, SlotKind::Value, SlotKind::Weak]
        );
    }

    #[test]
    fn test_array_defaults_stride_to_slot_size() {
        let array = ArrayData::new(SlotKind::Value, 24, 20);
        assert_eq!(array.stride, 8);
        assert_eq!(array.with_stride(16).stride, 16);
    }

    #[test]
    fn test_load_length() {
        let storage: [u32; 4] = [0, 5, 0, 0];
        let array = ArrayData::new(SlotKind::Value, 8, 4);
        let len = unsafe { array.load_length(storage.as_ptr().cast()) };
        assert_eq!(len, 5);
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn test_duplicate_offset_panics() {
        let mut b = MetadataBuilder::new();
        b.add_pointer(16, "a").add_value(16, "b");
    }

    #[test]
    #[should_panic(expected = "only one array")]
    fn test_second_array_panics() {
        let mut b = MetadataBuilder::new();
        b.add_array(ArrayData::new(SlotKind::Value, 24, 16))
            .add_array(ArrayData::new(SlotKind::Pointer, 32, 20));
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn test_misaligned_slot_panics() {
        MetadataBuilder::new().add_value(12, "odd");
    }
}
