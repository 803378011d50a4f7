//! The common cell header.
//!
//! Every heap cell begins with a [`GcCell`]:
//!
//! ```text
//! ┌───────────────────────────────────────────┬──────────┬──────────┐
//! │ word: usize                               │ magic    │ alloc_id │
//! │ kind (8 bits) │ size (remaining bits)     │ u32      │ u32      │
//! └───────────────────────────────────────────┴──────────┴──────────┘
//!   during compaction the word instead holds a forwarding pointer,
//!   tagged in bit 0 when the cell is marked
//! ```
//!
//! Cells are never constructed by value. The heap writes the header into
//! freshly bumped segment memory and the owning type fills in the rest.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::registry::CellRegistry;
use super::vtable::VTable;
use super::CellKind;

/// Alignment of every cell address and size.
pub const HEAP_ALIGN: usize = 8;

/// Magic stamped into every valid header.
pub const CELL_MAGIC: u32 = 0xCE11_0A7E;

/// Tag bit distinguishing a marked forwarding pointer from a header word.
const MARK_BIT: usize = 1;

/// Round `size` up to [`HEAP_ALIGN`].
#[inline]
pub const fn heap_align_size(size: usize) -> usize {
    (size + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)
}

/// Whether `size` is already a multiple of [`HEAP_ALIGN`].
#[inline]
pub const fn is_size_heap_aligned(size: usize) -> bool {
    size & (HEAP_ALIGN - 1) == 0
}

// =============================================================================
// KindAndSize
// =============================================================================

/// A cell kind and allocation size packed into one machine word.
///
/// The kind occupies the top [`KIND_BITS`](Self::KIND_BITS) bits and the
/// size the rest.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct KindAndSize(usize);

impl KindAndSize {
    /// Bits reserved for the kind.
    pub const KIND_BITS: u32 = 8;

    const SIZE_BITS: u32 = usize::BITS - Self::KIND_BITS;
    const SIZE_MASK: usize = (1 << Self::SIZE_BITS) - 1;

    /// Pack a kind and a heap-aligned size.
    #[inline]
    pub fn new(kind: CellKind, size: u32) -> Self {
        debug_assert!(
            is_size_heap_aligned(size as usize),
            "cell size {size} is not heap aligned"
        );
        debug_assert!(size <= Self::max_size(), "cell size {size} too large");
        Self(((kind as usize) << Self::SIZE_BITS) | size as usize)
    }

    /// Largest heap-aligned size representable in the size field.
    pub const fn max_size() -> u32 {
        let max = if Self::SIZE_MASK > u32::MAX as usize {
            u32::MAX as usize
        } else {
            Self::SIZE_MASK
        };
        (max & !(HEAP_ALIGN - 1)) as u32
    }

    /// The packed kind.
    ///
    /// # Panics
    ///
    /// Panics if the word does not carry a known kind, which means the
    /// header was overwritten.
    #[inline]
    pub fn kind(self) -> CellKind {
        let raw = (self.0 >> Self::SIZE_BITS) as u8;
        CellKind::from_u8(raw).unwrap_or_else(|| panic!("corrupt cell header: kind {raw:#x}"))
    }

    /// The packed size in bytes.
    #[inline]
    pub const fn size(self) -> u32 {
        (self.0 & Self::SIZE_MASK) as u32
    }

    /// The raw word.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    fn raw_kind_is_known(word: usize) -> bool {
        CellKind::from_u8((word >> Self::SIZE_BITS) as u8).is_some()
    }
}

impl fmt::Debug for KindAndSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindAndSize")
            .field("kind", &CellKind::from_u8((self.0 >> Self::SIZE_BITS) as u8))
            .field("size", &self.size())
            .finish()
    }
}

const _: () = assert!(CellKind::COUNT <= 1 << KindAndSize::KIND_BITS);

// =============================================================================
// GcCell
// =============================================================================

/// Debug stamp carried by every header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellDebugInfo {
    /// [`CELL_MAGIC`] for a live header.
    pub magic: u32,
    /// Allocation sequence number, or 0 when tracking is off.
    pub alloc_id: u32,
}

/// Header shared by every heap cell.
#[repr(C, align(8))]
pub struct GcCell {
    word: AtomicUsize,
    debug: CellDebugInfo,
}

const _: () = assert!(std::mem::size_of::<GcCell>() == 16);
const _: () = assert!(std::mem::align_of::<GcCell>() == HEAP_ALIGN);

impl GcCell {
    /// Header size; also the minimum cell size.
    pub const SIZE: usize = std::mem::size_of::<GcCell>();

    /// Placeholder header for struct literals.
    ///
    /// The heap overwrites it with a real header once the cell is placed.
    #[inline]
    pub const fn uninit() -> Self {
        Self {
            word: AtomicUsize::new(0),
            debug: CellDebugInfo {
                magic: 0,
                alloc_id: 0,
            },
        }
    }

    /// Write a fresh header at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be heap aligned and point to at least `size` writable bytes.
    #[inline]
    pub unsafe fn init_header(ptr: NonNull<GcCell>, kind: CellKind, size: u32, alloc_id: u32) {
        unsafe {
            ptr.as_ptr().write(GcCell {
                word: AtomicUsize::new(KindAndSize::new(kind, size).raw()),
                debug: CellDebugInfo {
                    magic: CELL_MAGIC,
                    alloc_id,
                },
            });
        }
    }

    #[inline]
    fn load(&self) -> usize {
        self.word.load(Ordering::Relaxed)
    }

    /// The packed kind and size.
    #[inline]
    pub fn kind_and_size(&self) -> KindAndSize {
        debug_assert!(!self.is_marked(), "header holds a forwarding pointer");
        KindAndSize(self.load())
    }

    /// Kind of this cell.
    #[inline]
    pub fn get_kind(&self) -> CellKind {
        self.kind_and_size().kind()
    }

    /// Allocated size of this cell in bytes, header included.
    #[inline]
    pub fn get_allocated_size(&self) -> u32 {
        self.kind_and_size().size()
    }

    /// Look up this cell's vtable.
    #[inline]
    pub fn get_vt<'r>(&self, registry: &'r CellRegistry) -> &'r VTable {
        debug_assert!(self.is_valid(), "vtable lookup on an invalid cell");
        registry.vtable(self.get_kind())
    }

    /// Whether the header looks like a live, well-formed cell.
    pub fn is_valid(&self) -> bool {
        let word = self.load();
        self.debug.magic == CELL_MAGIC
            && word & MARK_BIT == 0
            && KindAndSize::raw_kind_is_known(word)
            && KindAndSize(word).size() as usize >= Self::SIZE
    }

    /// Whether this is a valid cell of the given kind.
    #[inline]
    pub fn is_valid_kind(&self, kind: CellKind) -> bool {
        self.is_valid() && self.get_kind() == kind
    }

    /// The debug stamp.
    #[inline]
    pub fn debug_info(&self) -> CellDebugInfo {
        self.debug
    }

    /// Allocation sequence number, or 0 when tracking is off.
    #[inline]
    pub fn alloc_id(&self) -> u32 {
        self.debug.alloc_id
    }

    /// Address of this header.
    #[inline]
    pub fn as_non_null(&self) -> NonNull<GcCell> {
        NonNull::from(self)
    }

    /// Address just past this cell, where the next cell in the segment starts.
    #[inline]
    pub fn next_cell(&self) -> NonNull<GcCell> {
        let size = self.get_allocated_size() as usize;
        // SAFETY: a cell never extends past its segment's end.
        unsafe { self.as_non_null().cast::<u8>().add(size).cast() }
    }

    // =========================================================================
    // Collector-only header states
    // =========================================================================

    /// Overwrite the header with an untagged forwarding pointer.
    #[inline]
    pub fn set_forwarding_pointer(&self, target: NonNull<GcCell>) {
        let addr = target.as_ptr() as usize;
        debug_assert_eq!(addr & (HEAP_ALIGN - 1), 0);
        self.word.store(addr, Ordering::Relaxed);
    }

    /// Read an untagged forwarding pointer.
    #[inline]
    pub fn get_forwarding_pointer(&self) -> Option<NonNull<GcCell>> {
        let word = self.load();
        debug_assert_eq!(word & MARK_BIT, 0);
        NonNull::new(word as *mut GcCell)
    }

    /// Overwrite the header with a marked forwarding pointer.
    #[inline]
    pub fn set_marked_forwarding_pointer(&self, target: NonNull<GcCell>) {
        let addr = target.as_ptr() as usize;
        debug_assert_eq!(addr & (HEAP_ALIGN - 1), 0);
        self.word.store(addr | MARK_BIT, Ordering::Relaxed);
    }

    /// Read a marked forwarding pointer, or `None` if the header is unmarked.
    #[inline]
    pub fn get_marked_forwarding_pointer(&self) -> Option<NonNull<GcCell>> {
        let word = self.load();
        if word & MARK_BIT == 0 {
            return None;
        }
        NonNull::new((word & !MARK_BIT) as *mut GcCell)
    }

    /// Whether the header currently holds a marked forwarding pointer.
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.load() & MARK_BIT != 0
    }

    /// Reinstall a header word after the cell has been moved.
    #[inline]
    pub fn restore_header(&self, kind_and_size: KindAndSize) {
        self.word.store(kind_and_size.raw(), Ordering::Relaxed);
    }

    /// Shrink the recorded size during compaction.
    #[inline]
    pub fn set_size_from_gc(&self, new_size: u32) {
        let current = self.kind_and_size();
        debug_assert!(new_size <= current.size(), "cells never grow in place");
        self.restore_header(KindAndSize::new(current.kind(), new_size));
    }
}

impl fmt::Debug for GcCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.load();
        let mut s = f.debug_struct("GcCell");
        s.field("addr", &(self as *const Self));
        if word & MARK_BIT != 0 {
            s.field("forwarded_to", &((word & !MARK_BIT) as *const u8));
        } else {
            s.field("header", &KindAndSize(word));
        }
        s.field("alloc_id", &self.debug.alloc_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(8))]
    struct Buffer([u64; 8]);

    fn cell_in(buf: &mut Buffer) -> NonNull<GcCell> {
        NonNull::from(&mut buf.0).cast()
    }

    #[test]
    fn test_heap_align_size() {
        assert_eq!(heap_align_size(0), 0);
        assert_eq!(heap_align_size(1), 8);
        assert_eq!(heap_align_size(16), 16);
        assert_eq!(heap_align_size(17), 24);
        assert!(is_size_heap_aligned(24));
        assert!(!is_size_heap_aligned(20));
    }

    #[test]
    fn test_kind_and_size_packing() {
        let ks = KindAndSize::new(CellKind::Domain, 48);
        assert_eq!(ks.kind(), CellKind::Domain);
        assert_eq!(ks.size(), 48);
    }

    #[test]
    fn test_kind_and_size_max() {
        let max = KindAndSize::max_size();
        assert!(is_size_heap_aligned(max as usize));
        let ks = KindAndSize::new(CellKind::ArrayStorage, max);
        assert_eq!(ks.size(), max);
        assert_eq!(ks.kind(), CellKind::ArrayStorage);
    }

    #[test]
    fn test_header_size() {
        assert_eq!(GcCell::SIZE, 16);
    }

    #[test]
    fn test_init_header_is_valid() {
        let mut buf = Buffer([0; 8]);
        let ptr = cell_in(&mut buf);
        unsafe { GcCell::init_header(ptr, CellKind::PlainObject, 32, 7) };
        let cell = unsafe { ptr.as_ref() };
        assert!(cell.is_valid());
        assert!(cell.is_valid_kind(CellKind::PlainObject));
        assert!(!cell.is_valid_kind(CellKind::Domain));
        assert_eq!(cell.get_allocated_size(), 32);
        assert_eq!(cell.alloc_id(), 7);
        assert_eq!(cell.debug_info().magic, CELL_MAGIC);
    }

    #[test]
    fn test_zeroed_memory_is_not_a_cell() {
        let mut buf = Buffer([0; 8]);
        let cell = unsafe { cell_in(&mut buf).as_ref() };
        assert!(!cell.is_valid());
    }

    #[test]
    fn test_next_cell() {
        let mut buf = Buffer([0; 8]);
        let ptr = cell_in(&mut buf);
        unsafe { GcCell::init_header(ptr, CellKind::PlainObject, 24, 0) };
        let next = unsafe { ptr.as_ref() }.next_cell();
        assert_eq!(next.as_ptr() as usize - ptr.as_ptr() as usize, 24);
    }

    #[test]
    fn test_marked_forwarding_pointer() {
        let mut buf = Buffer([0; 8]);
        let ptr = cell_in(&mut buf);
        unsafe { GcCell::init_header(ptr, CellKind::HostObject, 32, 0) };
        let cell = unsafe { ptr.as_ref() };
        let target = unsafe { ptr.cast::<u8>().add(32).cast::<GcCell>() };

        assert!(!cell.is_marked());
        assert_eq!(cell.get_marked_forwarding_pointer(), None);

        cell.set_marked_forwarding_pointer(target);
        assert!(cell.is_marked());
        assert!(!cell.is_valid());
        assert_eq!(cell.get_marked_forwarding_pointer(), Some(target));

        cell.restore_header(KindAndSize::new(CellKind::HostObject, 32));
        assert!(!cell.is_marked());
        assert!(cell.is_valid());
    }

    #[test]
    fn test_unmarked_forwarding_pointer() {
        let mut buf = Buffer([0; 8]);
        let ptr = cell_in(&mut buf);
        unsafe { GcCell::init_header(ptr, CellKind::HostObject, 32, 0) };
        let cell = unsafe { ptr.as_ref() };
        cell.set_forwarding_pointer(ptr);
        assert!(!cell.is_marked());
        assert_eq!(cell.get_forwarding_pointer(), Some(ptr));
    }

    #[test]
    fn test_set_size_from_gc_shrinks() {
        let mut buf = Buffer([0; 8]);
        let ptr = cell_in(&mut buf);
        unsafe { GcCell::init_header(ptr, CellKind::ArrayStorage, 64, 0) };
        let cell = unsafe { ptr.as_ref() };
        cell.set_size_from_gc(24);
        assert_eq!(cell.get_allocated_size(), 24);
        assert_eq!(cell.get_kind(), CellKind::ArrayStorage);
    }
}
