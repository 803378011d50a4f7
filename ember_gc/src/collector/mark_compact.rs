//! Sliding mark-compact collection.

use std::ptr::{self, NonNull};

use rustc_hash::FxHashMap;

use super::CollectionResult;
use crate::cell::{FinalizeContext, GcCell, GcPointer, KindAndSize};
use crate::heap::{AlignedHeapSegment, Heap, SegmentLayout};
use crate::roots::RootProvider;
use crate::stats::GcTimer;
use crate::trace::{SlotAcceptor, SlotVisitor, WeakRefAcceptor};
use crate::value::Value;
use crate::weak::{WeakRefTable, WeakSlotId};

/// A live cell's planned move.
#[derive(Clone, Copy)]
struct Relocation {
    from: NonNull<GcCell>,
    to: NonNull<GcCell>,
    header: KindAndSize,
    new_size: u32,
}

/// Stop-the-world mark-compact collector.
///
/// Holds its scratch buffers between collections so steady-state
/// collections do not allocate.
#[derive(Debug, Default)]
pub struct MarkCompactCollector {
    worklist: Vec<NonNull<GcCell>>,
    relocations: Vec<Relocation>,
}

impl MarkCompactCollector {
    /// Create a collector with empty scratch buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `heap`, treating the heap's roots and `provider`'s roots as live.
    ///
    /// Finalizers run while the weak reference lock is held and must not
    /// take it.
    ///
    /// # Panics
    ///
    /// Panics if heap verification is enabled and fails.
    pub fn collect(&mut self, heap: &mut Heap, provider: &mut dyn RootProvider) -> CollectionResult {
        let total = GcTimer::start("collection");
        if heap.config.verify_heap {
            verify(heap, "before");
        }

        let Heap {
            config,
            layout,
            registry,
            segments,
            segment_index,
            alloc_cursor,
            weak_refs,
            roots,
            finalizables,
            stats,
            ..
        } = &mut *heap;
        let layout = *layout;
        let mut weak = weak_refs.lock();
        let mut result = CollectionResult::default();

        // =====================================================================
        // Mark
        // =====================================================================
        let timer = GcTimer::start("mark");
        weak.unmark_all();
        for segment in segments.iter_mut() {
            segment.mark_bits_mut().clear_all();
        }
        {
            let mut marker = MarkAcceptor {
                segments: segments.as_mut_slice(),
                index: segment_index,
                layout,
                worklist: &mut self.worklist,
                weak: &mut *weak,
            };
            roots.mark_roots(&mut marker);
            provider.mark_roots(&mut marker);
            provider.mark_weak_roots(&mut marker);

            while let Some(cell) = marker.worklist.pop() {
                // SAFETY: only live, well-formed cells are pushed.
                let kind = unsafe { cell.as_ref() }.get_kind();
                unsafe {
                    SlotVisitor::visit(&mut marker, cell.cast(), registry.metadata(kind));
                    registry
                        .vtable(kind)
                        .mark_weak_if_exists(cell, &mut *marker.weak);
                }
                result.cells_marked += 1;
            }
        }
        timer.stop();

        // =====================================================================
        // Weak sweep
        // =====================================================================
        let swept = weak.sweep(|cell| is_marked(segments, segment_index, layout, cell));
        result.weak_slots_cleared = swept.cleared;
        result.weak_slots_freed = swept.freed;

        // =====================================================================
        // Finalize
        // =====================================================================
        let timer = GcTimer::start("finalize");
        let mut ctx = FinalizeContext::default();
        finalizables.retain(|&cell| {
            if is_marked(segments, segment_index, layout, cell) {
                return true;
            }
            // SAFETY: the cell is dead and this is its only finalization.
            unsafe {
                let kind = cell.as_ref().get_kind();
                tracing::trace!(%kind, cell = ?cell, "finalizing cell");
                registry.vtable(kind).finalize_if_exists(cell, &mut ctx);
            }
            false
        });
        result.cells_finalized = ctx.finalized();
        result.native_bytes_released = ctx.native_bytes_released();
        timer.stop();

        // =====================================================================
        // Forward
        // =====================================================================
        let timer = GcTimer::start("forward");
        self.relocations.clear();
        let mut new_levels = vec![0usize; segments.len()];
        let mut to_segment = 0;
        for segment in segments.iter() {
            for cell in segment.cells() {
                // SAFETY: headers in [start, level) are intact until forwarded.
                let header = unsafe { cell.as_ref() }.kind_and_size();
                let size = header.size();
                if !segment.mark_bits().is_marked(cell.as_ptr() as usize) {
                    result.cells_freed += 1;
                    result.bytes_freed += size as usize;
                    continue;
                }

                let new_size = unsafe {
                    registry
                        .vtable(header.kind())
                        .get_compacted_size(cell)
                };
                debug_assert!(new_size <= size, "compaction never grows a cell");
                result.bytes_compacted += (size - new_size) as usize;

                while new_levels[to_segment] + new_size as usize > segments[to_segment].size() {
                    to_segment += 1;
                }
                // SAFETY: the destination lies within segment `to_segment`.
                let to = unsafe {
                    NonNull::new_unchecked(segments[to_segment].start().add(new_levels[to_segment]))
                        .cast::<GcCell>()
                };
                new_levels[to_segment] += new_size as usize;

                self.relocations.push(Relocation {
                    from: cell,
                    to,
                    header,
                    new_size,
                });
                unsafe { cell.as_ref() }.set_marked_forwarding_pointer(to);
            }
        }
        timer.stop();

        // =====================================================================
        // Update
        // =====================================================================
        let timer = GcTimer::start("update");
        {
            let mut updater = UpdateAcceptor {
                index: segment_index,
                layout,
            };
            for relocation in &self.relocations {
                // SAFETY: the body is still at `from`; only the header changed.
                unsafe {
                    SlotVisitor::visit(
                        &mut updater,
                        relocation.from.cast(),
                        registry.metadata(relocation.header.kind()),
                    );
                }
            }
            roots.mark_roots(&mut updater);
            provider.mark_roots(&mut updater);
            weak.relocate(|cell| updater.forward(cell));
            for cell in finalizables.iter_mut() {
                *cell = updater.forward(*cell);
            }
        }
        timer.stop();

        // =====================================================================
        // Move
        // =====================================================================
        let timer = GcTimer::start("move");
        for relocation in &self.relocations {
            let Relocation {
                from,
                to,
                header,
                new_size,
            } = *relocation;
            // SAFETY: destinations never pass unmoved live cells, so the
            // copy only overwrites dead or already-moved bytes.
            unsafe {
                if from != to {
                    ptr::copy(
                        from.as_ptr().cast::<u8>(),
                        to.as_ptr().cast::<u8>(),
                        new_size as usize,
                    );
                }
                let kind = header.kind();
                to.as_ref().restore_header(KindAndSize::new(kind, new_size));
                if new_size < header.size() {
                    registry.vtable(kind).compact(to, new_size);
                }
            }
        }
        for (segment, &level) in segments.iter_mut().zip(&new_levels) {
            // SAFETY: level <= segment size.
            segment.set_level(unsafe { segment.start().add(level) });
            segment.rebuild_cell_index();
            segment.card_table().clear_all();
            segment.mark_bits_mut().clear_all();
        }
        *alloc_cursor = 0;
        result.live_bytes = new_levels.iter().sum();
        timer.stop();

        drop(weak);
        let elapsed = total.stop();
        stats.record_collection(&result, elapsed);
        if result.bytes_reclaimed() == 0 && segments.len() >= config.max_segments {
            tracing::warn!(
                segments = segments.len(),
                live_bytes = result.live_bytes,
                "collection reclaimed nothing at the segment limit"
            );
        }
        tracing::info!(
            marked = result.cells_marked,
            freed = result.cells_freed,
            bytes_freed = result.bytes_freed,
            bytes_compacted = result.bytes_compacted,
            finalized = result.cells_finalized,
            weak_cleared = result.weak_slots_cleared,
            live_bytes = result.live_bytes,
            ?elapsed,
            "collection finished"
        );

        if config.verify_heap {
            verify(heap, "after");
        }
        result
    }
}

fn verify(heap: &Heap, when: &str) {
    if let Err(err) = heap.check_well_formed() {
        panic!("heap verification failed {when} collection: {err}");
    }
}

/// Whether `cell` was reached by the last mark phase.
///
/// Addresses outside the heap are treated as live.
fn is_marked(
    segments: &[AlignedHeapSegment],
    index: &FxHashMap<usize, usize>,
    layout: SegmentLayout,
    cell: NonNull<GcCell>,
) -> bool {
    let addr = cell.as_ptr() as usize;
    match index.get(&layout.storage_start(addr)) {
        Some(&i) => segments[i].mark_bits().is_marked(addr),
        None => true,
    }
}

// =============================================================================
// Acceptors
// =============================================================================

/// Sets mark bits and queues newly reached cells.
struct MarkAcceptor<'a> {
    segments: &'a mut [AlignedHeapSegment],
    index: &'a FxHashMap<usize, usize>,
    layout: SegmentLayout,
    worklist: &'a mut Vec<NonNull<GcCell>>,
    weak: &'a mut WeakRefTable,
}

impl MarkAcceptor<'_> {
    #[inline]
    fn mark(&mut self, cell: NonNull<GcCell>) {
        let addr = cell.as_ptr() as usize;
        let Some(&i) = self.index.get(&self.layout.storage_start(addr)) else {
            return;
        };
        if self.segments[i].mark_bits_mut().mark(addr) {
            debug_assert!(
                unsafe { cell.as_ref() }.is_valid(),
                "marking a malformed cell at {:p}",
                cell.as_ptr()
            );
            self.worklist.push(cell);
        }
    }
}

impl SlotAcceptor for MarkAcceptor<'_> {
    #[inline]
    fn accept_pointer(&mut self, slot: &mut GcPointer, _name: Option<&'static str>) {
        if let Some(cell) = slot.get() {
            self.mark(cell);
        }
    }

    #[inline]
    fn accept_value(&mut self, slot: &mut Value, _name: Option<&'static str>) {
        if let Some(cell) = slot.as_object() {
            self.mark(cell);
        }
    }

    #[inline]
    fn accept_weak(&mut self, slot: &mut WeakSlotId, _name: Option<&'static str>) {
        self.weak.mark(*slot);
    }
}

impl WeakRefAcceptor for MarkAcceptor<'_> {
    #[inline]
    fn accept_weak_slot(&mut self, slot: &mut WeakSlotId) {
        self.weak.mark(*slot);
    }
}

/// Rewrites references to forwarded cells.
struct UpdateAcceptor<'a> {
    index: &'a FxHashMap<usize, usize>,
    layout: SegmentLayout,
}

impl UpdateAcceptor<'_> {
    #[inline]
    fn forward(&self, cell: NonNull<GcCell>) -> NonNull<GcCell> {
        let addr = cell.as_ptr() as usize;
        if !self.index.contains_key(&self.layout.storage_start(addr)) {
            return cell;
        }
        // SAFETY: the address is a cell inside the heap; live cells carry a
        // marked forwarding pointer and dead ones their original header.
        unsafe { cell.as_ref() }
            .get_marked_forwarding_pointer()
            .unwrap_or(cell)
    }
}

impl SlotAcceptor for UpdateAcceptor<'_> {
    #[inline]
    fn accept_pointer(&mut self, slot: &mut GcPointer, _name: Option<&'static str>) {
        if let Some(cell) = slot.get() {
            slot.set(Some(self.forward(cell)));
        }
    }

    #[inline]
    fn accept_value(&mut self, slot: &mut Value, _name: Option<&'static str>) {
        if let Some(cell) = slot.as_object() {
            *slot = slot.update_pointer(self.forward(cell));
        }
    }

    #[inline]
    fn accept_weak(&mut self, _slot: &mut WeakSlotId, _name: Option<&'static str>) {}
}

impl std::fmt::Debug for Relocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relocation")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("kind", &self.header.kind())
            .field("new_size", &self.new_size)
            .finish()
    }
}
