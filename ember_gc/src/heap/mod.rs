//! The segmented heap.
//!
//! # Architecture
//!
//! ```text
//! Heap
//! ├── segments: [AlignedHeapSegment; n]   bump allocation, cursor moves forward
//! │     └── card table + mark bits         side tables per segment
//! ├── segment_index: storage_start -> n    O(1) owner lookup for any address
//! ├── roots: RootSet                       pointer roots and pinned globals
//! ├── weak_refs: Mutex<WeakRefTable>       indirection for weak references
//! └── finalizables: [cell]                 cells whose kind has a finalizer
//! ```
//!
//! Allocation never collects implicitly. When every segment is full and
//! `max_segments` is reached, allocation fails with
//! [`HeapError::OutOfMemory`] and the embedder decides whether to run
//! [`Heap::collect`] and retry.

mod mark_bits;
mod segment;
mod storage;

pub use mark_bits::MarkBitArray;
pub use segment::{AlignedHeapSegment, SegmentCells, SegmentLayout};
pub use storage::{AlignedStorage, LimitedStorageProvider, MallocStorageProvider, StorageProvider};

use std::ptr::NonNull;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::barrier;
use crate::cell::{
    heap_align_size, CellKind, CellLayout, CellRef, CellRegistry, FinalizeContext, GcCell,
    KindAndSize,
};
use crate::collector::{CollectionResult, MarkCompactCollector};
use crate::config::{ConfigError, HeapConfig};
use crate::error::HeapError;
use crate::roots::{NoRoots, RootId, RootProvider, RootSet};
use crate::stats::GcStats;
use crate::trace::{SlotAcceptor, SlotVisitor};
use crate::value::Value;
use crate::weak::{WeakRefLock, WeakRefMutex};

/// A garbage-collected heap of cells.
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) layout: SegmentLayout,
    pub(crate) registry: Arc<CellRegistry>,
    provider: Box<dyn StorageProvider>,
    pub(crate) segments: Vec<AlignedHeapSegment>,
    pub(crate) segment_index: FxHashMap<usize, usize>,
    pub(crate) alloc_cursor: usize,
    pub(crate) weak_refs: WeakRefMutex,
    pub(crate) roots: RootSet,
    pub(crate) finalizables: Vec<NonNull<GcCell>>,
    pub(crate) stats: GcStats,
    next_alloc_id: u32,
    collector: MarkCompactCollector,
}

impl Heap {
    /// Create a heap backed by the global allocator.
    pub fn new(config: HeapConfig, registry: Arc<CellRegistry>) -> Result<Self, HeapError> {
        Self::with_provider(config, registry, Box::new(MallocStorageProvider))
    }

    /// Create a heap that takes segment storage from `provider`.
    pub fn with_provider(
        config: HeapConfig,
        registry: Arc<CellRegistry>,
        provider: Box<dyn StorageProvider>,
    ) -> Result<Self, HeapError> {
        config.validate()?;
        let layout = config
            .segment_layout()
            .ok_or(ConfigError::SegmentNotPowerOfTwo(config.segment_size))?;

        tracing::debug!(
            segment_size = layout.size(),
            max_segments = config.max_segments,
            card_size = config.card_size,
            "created heap"
        );

        Ok(Self {
            config,
            layout,
            registry,
            provider,
            segments: Vec::new(),
            segment_index: FxHashMap::default(),
            alloc_cursor: 0,
            weak_refs: WeakRefMutex::default(),
            roots: RootSet::new(),
            finalizables: Vec::new(),
            stats: GcStats::new(),
            next_alloc_id: 0,
            collector: MarkCompactCollector::default(),
        })
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a cell of `kind` and write its header.
    ///
    /// The body is zeroed. `size` is rounded up to the heap alignment and
    /// must equal the vtable size for fixed-size kinds.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is unregistered or `size` cannot hold a header.
    pub fn alloc_cell(&mut self, kind: CellKind, size: u32) -> Result<NonNull<GcCell>, HeapError> {
        let vtable = self.registry.vtable(kind);
        debug_assert!(
            vtable.is_variable_size() || vtable.size == size,
            "{kind} is fixed at {} bytes, requested {size}",
            vtable.size
        );
        let aligned = heap_align_size(size as usize);
        assert!(
            aligned >= GcCell::SIZE,
            "{kind} cell of {size} bytes cannot hold a header"
        );
        if aligned > self.layout.size() || aligned > KindAndSize::max_size() as usize {
            return Err(HeapError::CellTooLarge {
                kind,
                size: aligned,
                capacity: self.layout.size(),
            });
        }
        let aligned = aligned as u32;

        let cell = self.bump(aligned)?;
        let alloc_id = if self.config.track_allocation_ids {
            self.next_alloc_id = self.next_alloc_id.wrapping_add(1).max(1);
            self.next_alloc_id
        } else {
            0
        };
        // SAFETY: `bump` returned `aligned` zeroed bytes inside a segment.
        unsafe { GcCell::init_header(cell, kind, aligned, alloc_id) };

        if vtable.has_finalizer() {
            self.finalizables.push(cell);
        }
        self.stats
            .record_allocation(aligned, vtable.is_variable_size());
        tracing::trace!(%kind, size = aligned, alloc_id, "allocated cell");
        Ok(cell)
    }

    /// Allocate a fixed-size cell holding `value`.
    pub fn alloc_fixed<T: CellLayout>(&mut self, value: T) -> Result<CellRef<T>, HeapError> {
        let vtable = T::VTABLE;
        debug_assert!(!vtable.is_variable_size(), "{} is variable-size", vtable.kind);
        debug_assert_eq!(vtable.size as usize, heap_align_size(std::mem::size_of::<T>()));
        debug_assert!(
            !std::mem::needs_drop::<T>() || vtable.has_finalizer(),
            "{} owns resources but has no finalizer",
            vtable.kind
        );
        let cell = self.alloc_cell(vtable.kind, vtable.size)?;
        // SAFETY: the cell was sized for T.
        unsafe {
            Self::place(cell, value);
            Ok(CellRef::from_cell_unchecked(cell))
        }
    }

    /// Allocate a variable-size cell of `size` bytes starting with `head`.
    ///
    /// The bytes past `size_of::<T>()` are zeroed, which reads as empty
    /// values and null pointers. Weak array elements must be initialized by
    /// the caller before the next collection.
    pub fn alloc_variable<T: CellLayout>(&mut self, size: u32, head: T) -> Result<CellRef<T>, HeapError> {
        let vtable = T::VTABLE;
        debug_assert!(vtable.is_variable_size(), "{} is fixed-size", vtable.kind);
        debug_assert!(
            !std::mem::needs_drop::<T>() || vtable.has_finalizer(),
            "{} owns resources but has no finalizer",
            vtable.kind
        );
        assert!(
            size as usize >= std::mem::size_of::<T>(),
            "{} needs at least {} bytes, requested {size}",
            vtable.kind,
            std::mem::size_of::<T>()
        );
        let cell = self.alloc_cell(vtable.kind, size)?;
        // SAFETY: the cell is at least size_of::<T>() bytes.
        unsafe {
            Self::place(cell, head);
            Ok(CellRef::from_cell_unchecked(cell))
        }
    }

    /// Move `value` into a freshly allocated cell, keeping the header.
    unsafe fn place<T: CellLayout>(cell: NonNull<GcCell>, value: T) {
        unsafe {
            let header = cell.as_ptr().read();
            cell.cast::<T>().as_ptr().write(value);
            cell.as_ptr().write(header);
        }
    }

    fn bump(&mut self, size: u32) -> Result<NonNull<GcCell>, HeapError> {
        while self.alloc_cursor < self.segments.len() {
            if let Some(cell) = self.segments[self.alloc_cursor].alloc(size) {
                return Ok(cell);
            }
            self.alloc_cursor += 1;
        }

        let exhausted = HeapError::OutOfMemory {
            segments: self.segments.len(),
            requested: size,
        };
        if self.segments.len() >= self.config.max_segments {
            tracing::warn!(
                segments = self.segments.len(),
                requested = size,
                "heap exhausted"
            );
            return Err(exhausted);
        }
        self.add_segment()?;
        self.alloc_cursor = self.segments.len() - 1;
        self.segments[self.alloc_cursor].alloc(size).ok_or(exhausted)
    }

    fn add_segment(&mut self) -> Result<(), HeapError> {
        let segment = AlignedHeapSegment::create(
            self.provider.as_ref(),
            self.layout,
            self.config.card_size,
        )?;
        let start = segment.low_lim();
        self.segment_index.insert(start as usize, self.segments.len());
        self.segments.push(segment);
        self.stats.record_segment();
        tracing::debug!(
            index = self.segments.len() - 1,
            start = ?start,
            "added heap segment"
        );
        Ok(())
    }

    // =========================================================================
    // Roots
    // =========================================================================

    /// Register `cell` as a root.
    pub fn add_root(&mut self, cell: NonNull<GcCell>) -> RootId {
        self.roots.add(cell)
    }

    /// Current location of a rooted cell.
    #[inline]
    pub fn root(&self, id: RootId) -> Option<NonNull<GcCell>> {
        self.roots.get(id)
    }

    /// Current location of a rooted cell, typed.
    ///
    /// Returns `None` if the root is cleared or holds a different kind.
    pub fn root_as<T: CellLayout>(&self, id: RootId) -> Option<CellRef<T>> {
        // SAFETY: roots always reference live cells.
        self.roots
            .get(id)
            .and_then(|cell| unsafe { CellRef::try_from_cell(cell) })
    }

    /// Retarget a root.
    pub fn set_root(&mut self, id: RootId, cell: Option<NonNull<GcCell>>) {
        self.roots.set(id, cell);
    }

    /// Unregister a root.
    pub fn remove_root(&mut self, id: RootId) {
        self.roots.remove(id);
    }

    /// Pin a value for the heap's lifetime.
    pub fn add_global(&mut self, value: Value) {
        self.roots.add_global(value);
    }

    /// The heap's root set.
    #[inline]
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    // =========================================================================
    // Weak references
    // =========================================================================

    /// The weak reference table's lock.
    #[inline]
    pub fn weak_refs(&self) -> &WeakRefMutex {
        &self.weak_refs
    }

    /// Acquire the weak reference lock.
    #[inline]
    pub fn weak_ref_lock(&self) -> WeakRefLock<'_> {
        self.weak_refs.lock()
    }

    // =========================================================================
    // Addresses and barriers
    // =========================================================================

    /// The segment owning `ptr`, if any.
    #[inline]
    pub fn find_segment(&self, ptr: *const u8) -> Option<&AlignedHeapSegment> {
        let start = self.layout.storage_start(ptr as usize);
        self.segment_index.get(&start).map(|&i| &self.segments[i])
    }

    /// Whether `ptr` lies inside any segment's storage.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.find_segment(ptr).is_some()
    }

    /// Whether `cell` addresses a valid header below its segment's level.
    pub fn is_cell(&self, cell: NonNull<GcCell>) -> bool {
        let ptr = cell.as_ptr() as *const u8;
        match self.find_segment(ptr) {
            Some(segment) if ptr < segment.level() as *const u8 => {
                // SAFETY: the address is inside allocated segment memory.
                unsafe { cell.as_ref() }.is_valid()
            }
            _ => false,
        }
    }

    /// Record a store into the slot at `slot`.
    #[inline]
    pub fn write_barrier(&self, slot: *const u8) {
        barrier::write_barrier(self, slot);
    }

    /// Visit every slot lying in a dirty card, then clean all cards.
    ///
    /// Returns the number of cells visited.
    pub fn scan_dirty_cards<A: SlotAcceptor + ?Sized>(&mut self, acceptor: &mut A) -> usize {
        let registry = &self.registry;
        let mut visited = 0;
        for segment in &self.segments {
            let level = segment.level() as usize;
            let mut ranges: SmallVec<[(usize, usize); 8]> = SmallVec::new();
            segment.card_table().for_each_dirty_range(|start, end| {
                if start < level {
                    ranges.push((start, end.min(level)));
                }
            });
            for (lo, hi) in ranges {
                let (lo, hi) = (lo as *const u8, hi as *const u8);
                segment.for_objs_in_range(lo, hi, |cell| {
                    // SAFETY: cells below the level are well formed.
                    let kind = unsafe { cell.as_ref() }.get_kind();
                    unsafe {
                        SlotVisitor::visit_within_range(
                            acceptor,
                            cell.cast(),
                            registry.metadata(kind),
                            lo,
                            hi,
                        );
                    }
                    visited += 1;
                });
            }
            segment.card_table().clear_all();
        }
        visited
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Collect garbage using only the heap's own roots.
    pub fn collect(&mut self) -> CollectionResult {
        self.collect_with(&mut NoRoots)
    }

    /// Collect garbage with additional roots from `provider`.
    ///
    /// Every `CellRef` not reachable through a root is invalidated.
    pub fn collect_with(&mut self, provider: &mut dyn RootProvider) -> CollectionResult {
        let mut collector = std::mem::take(&mut self.collector);
        let result = collector.collect(self, provider);
        self.collector = collector;
        result
    }

    /// Run every pending finalizer. Used on teardown.
    fn finalize_all(&mut self) {
        let mut ctx = FinalizeContext::default();
        for cell in std::mem::take(&mut self.finalizables) {
            // SAFETY: finalizable cells are live until finalized.
            unsafe {
                let kind = cell.as_ref().get_kind();
                self.registry
                    .vtable(kind)
                    .finalize_if_exists(cell, &mut ctx);
            }
        }
        if ctx.finalized() > 0 {
            tracing::debug!(
                finalized = ctx.finalized(),
                native_bytes = ctx.native_bytes_released(),
                "finalized remaining cells"
            );
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Call `f` on every allocated cell, segment by segment.
    pub fn for_all_objs(&self, mut f: impl FnMut(NonNull<GcCell>)) {
        for segment in &self.segments {
            segment.for_all_objs(&mut f);
        }
    }

    /// Sum of every cell's native memory estimate.
    pub fn count_malloc_size(&self) -> usize {
        let mut total = 0;
        self.for_all_objs(|cell| {
            // SAFETY: allocated cells are well formed outside collection.
            unsafe {
                let kind = cell.as_ref().get_kind();
                total += self.registry.vtable(kind).get_malloc_size(cell);
            }
        });
        total
    }

    /// Verify every cell header and every strong reference.
    pub fn check_well_formed(&self) -> Result<(), HeapError> {
        fn corrupt(addr: usize, reason: &'static str) -> HeapError {
            HeapError::Corrupted { addr, reason }
        }

        let mut verifier = Verifier {
            heap: self,
            error: None,
        };
        for segment in &self.segments {
            let level = segment.level() as usize;
            for cell in segment.cells() {
                let addr = cell.as_ptr() as usize;
                // SAFETY: the address is below the level.
                let header = unsafe { cell.as_ref() };
                if !header.is_valid() {
                    return Err(corrupt(addr, "invalid cell header"));
                }
                let kind = header.get_kind();
                if !self.registry.is_registered(kind) {
                    return Err(corrupt(addr, "unregistered cell kind"));
                }
                if addr + header.get_allocated_size() as usize > level {
                    return Err(corrupt(addr, "cell extends past the segment level"));
                }
                unsafe { SlotVisitor::visit(&mut verifier, cell.cast(), self.registry.metadata(kind)) };
                if let Some(err) = verifier.error.take() {
                    return Err(err);
                }
            }
        }
        for root in self.roots.iter() {
            if !self.is_cell(root) {
                return Err(corrupt(root.as_ptr() as usize, "root references a non-cell"));
            }
        }
        for &cell in &self.finalizables {
            if !self.is_cell(cell) {
                return Err(corrupt(cell.as_ptr() as usize, "finalizable list holds a non-cell"));
            }
        }
        Ok(())
    }

    /// Snapshot of heap occupancy.
    pub fn heap_info(&self) -> HeapInfo {
        let mut cells = 0;
        self.for_all_objs(|_| cells += 1);
        HeapInfo {
            segments: self.segments.len(),
            heap_size: self.segments.len() * self.layout.size(),
            allocated_bytes: self.used_bytes(),
            cells,
            malloc_size: self.count_malloc_size(),
            finalizable_cells: self.finalizables.len(),
            weak_slots: self.weak_refs.lock().used_slots(),
            roots: self.roots.len(),
        }
    }

    /// Bytes allocated across all segments.
    pub fn used_bytes(&self) -> usize {
        self.segments.iter().map(AlignedHeapSegment::used).sum()
    }

    /// The configuration in use.
    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The kind registry.
    #[inline]
    pub fn registry(&self) -> &Arc<CellRegistry> {
        &self.registry
    }

    /// Accumulated statistics.
    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Segments in allocation order.
    #[inline]
    pub fn segments(&self) -> &[AlignedHeapSegment] {
        &self.segments
    }

    /// Segment geometry.
    #[inline]
    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.finalize_all();
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("segments", &self.segments.len())
            .field("used_bytes", &self.used_bytes())
            .field("roots", &self.roots.len())
            .finish()
    }
}

/// Heap occupancy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapInfo {
    /// Segments owned by the heap.
    pub segments: usize,
    /// Total segment storage in bytes.
    pub heap_size: usize,
    /// Bytes allocated to cells.
    pub allocated_bytes: usize,
    /// Number of allocated cells.
    pub cells: usize,
    /// Estimated native memory owned by cells.
    pub malloc_size: usize,
    /// Cells awaiting finalization.
    pub finalizable_cells: usize,
    /// Allocated weak slots.
    pub weak_slots: usize,
    /// Registered pointer roots.
    pub roots: usize,
}

/// Checks that every strong slot references a valid cell.
struct Verifier<'h> {
    heap: &'h Heap,
    error: Option<HeapError>,
}

impl Verifier<'_> {
    fn check<T>(&mut self, slot: &mut T, target: NonNull<GcCell>) {
        if self.error.is_none() && !self.heap.is_cell(target) {
            self.error = Some(HeapError::Corrupted {
                addr: slot as *mut T as usize,
                reason: "slot references a non-cell",
            });
        }
    }
}

impl SlotAcceptor for Verifier<'_> {
    fn accept_pointer(&mut self, slot: &mut crate::cell::GcPointer, _name: Option<&'static str>) {
        if let Some(target) = slot.get() {
            self.check(slot, target);
        }
    }

    fn accept_value(&mut self, slot: &mut Value, _name: Option<&'static str>) {
        if let Some(target) = slot.as_object() {
            self.check(slot, target);
        }
    }

    fn accept_weak(&mut self, _slot: &mut crate::weak::WeakSlotId, _name: Option<&'static str>) {}
}
