//! Size-aligned heap segments.
//!
//! A segment is a power-of-two block of storage aligned to its own size,
//! filled by bump allocation:
//!
//! ```text
//! low_lim == start                    level                      hi_lim == end
//! ┌────────┬────────┬──────┬──────────┬─────────────────────────────┐
//! │ cell   │ cell   │ cell │ cell     │ zeroed, unallocated         │
//! └────────┴────────┴──────┴──────────┴─────────────────────────────┘
//! ```
//!
//! Because of the alignment, the segment owning any interior address is
//! found by masking off the low bits, see [`SegmentLayout::storage_start`].
//! The card table and mark bits live beside the storage, not inside it.
//! Memory between `level` and `end` is always zero.

use std::marker::PhantomData;
use std::ptr::NonNull;

use smallvec::SmallVec;

use super::mark_bits::MarkBitArray;
use super::storage::{AlignedStorage, StorageProvider};
use crate::barrier::CardTable;
use crate::cell::{heap_align_size, GcCell};
use crate::error::HeapError;

// =============================================================================
// Geometry
// =============================================================================

/// Size and alignment of every segment in a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    log2: u32,
}

impl SegmentLayout {
    /// Geometry for `size`-byte segments, if `size` is a power of two.
    pub fn new(size: usize) -> Option<Self> {
        size.is_power_of_two().then(|| Self {
            log2: size.trailing_zeros(),
        })
    }

    /// Segment size in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        1 << self.log2
    }

    /// Start of the segment-sized block containing `addr`.
    #[inline]
    pub const fn storage_start(self, addr: usize) -> usize {
        addr & !(self.size() - 1)
    }

    /// End of the segment-sized block containing `addr`.
    #[inline]
    pub const fn storage_end(self, addr: usize) -> usize {
        self.storage_start(addr) + self.size()
    }

    /// Offset of `addr` within its segment-sized block.
    #[inline]
    pub const fn offset(self, addr: usize) -> usize {
        addr & (self.size() - 1)
    }

    /// Whether `a` and `b` fall in the same segment-sized block.
    #[inline]
    pub const fn contained_in_same(self, a: usize, b: usize) -> bool {
        self.storage_start(a) == self.storage_start(b)
    }
}

// =============================================================================
// Segment
// =============================================================================

/// One bump-allocated segment of the heap.
pub struct AlignedHeapSegment {
    storage: AlignedStorage,
    /// Offset of the allocation level from `low_lim`.
    level: usize,
    cards: CardTable,
    marks: MarkBitArray,
}

impl AlignedHeapSegment {
    /// Create an empty segment with storage from `provider`.
    pub fn create(
        provider: &dyn StorageProvider,
        layout: SegmentLayout,
        card_size: usize,
    ) -> Result<Self, HeapError> {
        let storage = provider.new_storage(layout)?;
        let base = storage.low_lim().as_ptr() as usize;
        debug_assert_eq!(layout.storage_start(base), base, "storage is not size-aligned");
        Ok(Self {
            cards: CardTable::new(base, layout.size(), card_size),
            marks: MarkBitArray::new(base, layout.size()),
            storage,
            level: 0,
        })
    }

    /// Bump-allocate `size` bytes, rounded up to the heap alignment.
    ///
    /// Returns `None` when the segment cannot fit the request. The memory
    /// is zeroed; the caller writes the cell header.
    pub fn alloc(&mut self, size: u32) -> Option<NonNull<GcCell>> {
        debug_assert!(
            size as usize >= GcCell::SIZE,
            "allocation of {size} bytes cannot hold a cell header"
        );
        let size = heap_align_size(size as usize);
        if size > self.available() {
            return None;
        }
        // SAFETY: level + size <= segment size.
        let cell = unsafe { self.storage.low_lim().add(self.level) };
        self.cards.record_cell(self.level, self.level + size);
        self.level += size;
        Some(cell.cast())
    }

    /// First byte of the segment's storage.
    #[inline]
    pub fn low_lim(&self) -> *mut u8 {
        self.storage.low_lim().as_ptr()
    }

    /// One past the last byte of the segment's storage.
    #[inline]
    pub fn hi_lim(&self) -> *mut u8 {
        self.storage.hi_lim()
    }

    /// First allocatable byte.
    #[inline]
    pub fn start(&self) -> *mut u8 {
        self.low_lim()
    }

    /// End of the allocatable region.
    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.hi_lim()
    }

    /// Current bump pointer.
    #[inline]
    pub fn level(&self) -> *mut u8 {
        // SAFETY: level never exceeds the segment size.
        unsafe { self.low_lim().add(self.level) }
    }

    /// Segment size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.storage.size()
    }

    /// Bytes allocated so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.level
    }

    /// Bytes still available.
    #[inline]
    pub fn available(&self) -> usize {
        self.size() - self.level
    }

    /// Whether `ptr` lies in `[low_lim, hi_lim)`.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.low_lim() as usize && addr < self.hi_lim() as usize
    }

    /// Geometry of this segment.
    #[inline]
    pub fn layout(&self) -> SegmentLayout {
        self.storage.layout()
    }

    /// Move the bump pointer.
    ///
    /// Lowering the level zeroes the released bytes.
    ///
    /// # Panics
    ///
    /// Panics if `level` is outside `[start, end]`.
    pub fn set_level(&mut self, level: *mut u8) {
        let offset = (level as usize)
            .checked_sub(self.start() as usize)
            .filter(|off| *off <= self.size())
            .unwrap_or_else(|| panic!("level {level:p} is outside the segment"));
        if offset < self.level {
            // SAFETY: [offset, self.level) lies within the storage.
            unsafe { std::ptr::write_bytes(self.low_lim().add(offset), 0, self.level - offset) };
            self.cards.forget_cells_from(offset);
        }
        self.level = offset;
    }

    /// Recompute the first-cell index from the cells below the level.
    ///
    /// Needed after cells were moved or shrunk in place.
    pub fn rebuild_cell_index(&mut self) {
        self.cards.forget_all_cells();
        let base = self.low_lim() as usize;
        let spans: SmallVec<[(usize, usize); 64]> = self
            .cells()
            .map(|cell| {
                let start = cell.as_ptr() as usize - base;
                // SAFETY: cells yielded by the iterator have intact headers.
                (start, start + unsafe { cell.as_ref() }.get_allocated_size() as usize)
            })
            .collect();
        for (start, end) in spans {
            self.cards.record_cell(start, end);
        }
    }

    /// Release every cell in the segment.
    pub fn reset_level(&mut self) {
        self.set_level(self.start());
    }

    /// Iterate over the allocated cells in address order.
    ///
    /// Every allocation in `[start, level)` must carry a header.
    pub fn cells(&self) -> SegmentCells<'_> {
        SegmentCells {
            base: self.low_lim(),
            cur: 0,
            end: self.level,
            _segment: PhantomData,
        }
    }

    /// Call `f` on every allocated cell.
    pub fn for_all_objs(&self, f: impl FnMut(NonNull<GcCell>)) {
        self.cells().for_each(f);
    }

    /// Call `f` on every cell overlapping `[low, high)`.
    ///
    /// The walk starts at the cell covering the card that holds `low`.
    pub fn for_objs_in_range(&self, low: *const u8, high: *const u8, mut f: impl FnMut(NonNull<GcCell>)) {
        let Some(first) = self.cards.first_cell_covering(low) else {
            return;
        };
        let (low, high) = (low as usize, high as usize);
        let cells = SegmentCells {
            base: self.low_lim(),
            cur: first,
            end: self.level,
            _segment: PhantomData,
        };
        for cell in cells {
            let start = cell.as_ptr() as usize;
            if start >= high {
                break;
            }
            // SAFETY: cells yielded by the iterator have intact headers.
            let end = start + unsafe { cell.as_ref() }.get_allocated_size() as usize;
            if end > low {
                f(cell);
            }
        }
    }

    /// The segment's card table.
    #[inline]
    pub fn card_table(&self) -> &CardTable {
        &self.cards
    }

    /// The segment's mark bits.
    #[inline]
    pub fn mark_bits(&self) -> &MarkBitArray {
        &self.marks
    }

    /// Mutable access to the segment's mark bits.
    #[inline]
    pub fn mark_bits_mut(&mut self) -> &mut MarkBitArray {
        &mut self.marks
    }
}

impl std::fmt::Debug for AlignedHeapSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedHeapSegment")
            .field("low_lim", &self.low_lim())
            .field("used", &self.used())
            .field("size", &self.size())
            .finish()
    }
}

/// Iterator over the cells of a segment.
///
/// Each header is read before its cell is yielded, so callers may
/// overwrite the header of the cell they were just given.
pub struct SegmentCells<'a> {
    base: *mut u8,
    cur: usize,
    end: usize,
    _segment: PhantomData<&'a AlignedHeapSegment>,
}

impl Iterator for SegmentCells<'_> {
    type Item = NonNull<GcCell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur >= self.end {
            return None;
        }
        // SAFETY: cur < level, inside the segment.
        let cell = unsafe { NonNull::new_unchecked(self.base.add(self.cur)).cast::<GcCell>() };
        let size = unsafe { cell.as_ref() }.get_allocated_size() as usize;
        if size < GcCell::SIZE {
            debug_assert!(false, "cell at {:p} has a corrupt size {size}", cell.as_ptr());
            self.cur = self.end;
            return None;
        }
        self.cur += size;
        Some(cell)
    }
}
