//! Garbage collection.
//!
//! The heap is collected by a stop-the-world, sliding mark-compact
//! collector:
//!
//! ```text
//! 1. Mark       trace from roots, set side mark bits, mark reported weak slots
//! 2. Weak sweep free unreported weak slots, clear slots with dead targets
//! 3. Finalize   run finalizers of unmarked finalizable cells
//! 4. Forward    compute new addresses, install marked forwarding pointers
//! 5. Update     rewrite every slot, root and weak target through the forwarding
//! 6. Move       slide cells down, restore headers, shrink compactable cells
//! ```
//!
//! Live cells keep their address order, so allocation after a collection
//! resumes from one contiguous free region per segment.

mod mark_compact;

pub use mark_compact::MarkCompactCollector;

/// Result of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionResult {
    /// Cells reached from the roots.
    pub cells_marked: usize,
    /// Dead cells reclaimed.
    pub cells_freed: usize,
    /// Bytes held by dead cells.
    pub bytes_freed: usize,
    /// Bytes reclaimed by shrinking live cells.
    pub bytes_compacted: usize,
    /// Finalizers run.
    pub cells_finalized: usize,
    /// Native bytes finalizers reported releasing.
    pub native_bytes_released: usize,
    /// Weak slots cleared because their target died.
    pub weak_slots_cleared: usize,
    /// Weak slots no holder reported, returned to the free list.
    pub weak_slots_freed: usize,
    /// Bytes occupied by cells after the collection.
    pub live_bytes: usize,
}

impl CollectionResult {
    /// Total bytes returned to the segments.
    #[inline]
    pub fn bytes_reclaimed(&self) -> usize {
        self.bytes_freed + self.bytes_compacted
    }
}
