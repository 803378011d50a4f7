//! Per-kind behavior tables.
//!
//! Each [`CellKind`] has exactly one static [`VTable`]. Hooks are optional:
//! the collector only calls what a kind declares, and the `*_if_exists`
//! wrappers make that check in one place.

use std::ptr::NonNull;

use super::{CellKind, GcCell};
use crate::trace::WeakRefAcceptor;

/// Releases native resources owned by a dead cell.
pub type FinalizeFn = unsafe fn(cell: NonNull<GcCell>, ctx: &mut FinalizeContext);

/// Reports the weak slots held by a live cell's native state.
pub type MarkWeakFn = unsafe fn(cell: NonNull<GcCell>, acceptor: &mut dyn WeakRefAcceptor);

/// Estimates native memory owned by a cell, in bytes.
pub type MallocSizeFn = unsafe fn(cell: NonNull<GcCell>) -> usize;

/// Size a cell can shrink to during compaction.
pub type CompactSizeFn = unsafe fn(cell: NonNull<GcCell>) -> u32;

/// Adjusts a moved cell's bookkeeping to its compacted size.
pub type CompactFn = unsafe fn(cell: NonNull<GcCell>, new_size: u32);

/// Accumulates what finalizers release during one pass.
#[derive(Debug, Default)]
pub struct FinalizeContext {
    native_bytes_released: usize,
    finalized: usize,
}

impl FinalizeContext {
    /// Record native memory released by the current finalizer.
    #[inline]
    pub fn release_native(&mut self, bytes: usize) {
        self.native_bytes_released += bytes;
    }

    /// Total native bytes released so far.
    #[inline]
    pub fn native_bytes_released(&self) -> usize {
        self.native_bytes_released
    }

    /// Number of finalizers run so far.
    #[inline]
    pub fn finalized(&self) -> usize {
        self.finalized
    }
}

/// Static description of a cell kind.
///
/// # Example
///
/// ```ignore
/// static VTABLE: VTable = VTable::new(CellKind::HostObject, 32)
///     .with_finalizer(finalize_host)
///     .with_malloc_size(host_malloc_size);
/// ```
#[derive(Debug)]
pub struct VTable {
    /// Kind described by this table.
    pub kind: CellKind,
    /// Fixed allocation size, or 0 for variable-size kinds.
    pub size: u32,
    /// Native cleanup for dead cells.
    pub finalize: Option<FinalizeFn>,
    /// Weak slot reporting for native state.
    pub mark_weak: Option<MarkWeakFn>,
    /// Native memory estimate.
    pub malloc_size: Option<MallocSizeFn>,
    /// Compacted size query; paired with `compact`.
    pub compact_size: Option<CompactSizeFn>,
    /// Post-move shrink hook; paired with `compact_size`.
    pub compact: Option<CompactFn>,
}

impl VTable {
    /// A vtable with no hooks. Pass `size == 0` for variable-size kinds.
    pub const fn new(kind: CellKind, size: u32) -> Self {
        Self {
            kind,
            size,
            finalize: None,
            mark_weak: None,
            malloc_size: None,
            compact_size: None,
            compact: None,
        }
    }

    /// Attach a finalizer.
    pub const fn with_finalizer(mut self, finalize: FinalizeFn) -> Self {
        self.finalize = Some(finalize);
        self
    }

    /// Attach a weak-marking hook.
    pub const fn with_mark_weak(mut self, mark_weak: MarkWeakFn) -> Self {
        self.mark_weak = Some(mark_weak);
        self
    }

    /// Attach a native memory estimator.
    pub const fn with_malloc_size(mut self, malloc_size: MallocSizeFn) -> Self {
        self.malloc_size = Some(malloc_size);
        self
    }

    /// Make the kind shrinkable during compaction.
    pub const fn with_compaction(mut self, compact_size: CompactSizeFn, compact: CompactFn) -> Self {
        self.compact_size = Some(compact_size);
        self.compact = Some(compact);
        self
    }

    /// Whether cells of this kind choose their own size at allocation.
    #[inline]
    pub const fn is_variable_size(&self) -> bool {
        self.size == 0
    }

    /// Whether dead cells of this kind need finalization.
    #[inline]
    pub const fn has_finalizer(&self) -> bool {
        self.finalize.is_some()
    }

    /// Whether the collector may shrink cells of this kind.
    #[inline]
    pub const fn can_be_compacted(&self) -> bool {
        self.compact_size.is_some()
    }

    /// Run the finalizer.
    ///
    /// # Panics
    ///
    /// Panics if the kind has no finalizer.
    ///
    /// # Safety
    ///
    /// `cell` must be a dead cell of this kind that has not been finalized.
    pub unsafe fn finalize(&self, cell: NonNull<GcCell>, ctx: &mut FinalizeContext) {
        let Some(finalize) = self.finalize else {
            panic!("{} has no finalizer", self.kind);
        };
        unsafe { finalize(cell, ctx) };
        ctx.finalized += 1;
    }

    /// Run the finalizer if the kind has one. Returns whether it ran.
    ///
    /// # Safety
    ///
    /// As for [`finalize`](Self::finalize).
    #[inline]
    pub unsafe fn finalize_if_exists(&self, cell: NonNull<GcCell>, ctx: &mut FinalizeContext) -> bool {
        if self.finalize.is_none() {
            return false;
        }
        unsafe { self.finalize(cell, ctx) };
        true
    }

    /// Report the cell's weak slots if the kind holds any.
    ///
    /// # Safety
    ///
    /// `cell` must be a live cell of this kind.
    #[inline]
    pub unsafe fn mark_weak_if_exists(&self, cell: NonNull<GcCell>, acceptor: &mut dyn WeakRefAcceptor) {
        if let Some(mark_weak) = self.mark_weak {
            unsafe { mark_weak(cell, acceptor) };
        }
    }

    /// Native memory owned by the cell, or 0 if the kind owns none.
    ///
    /// # Safety
    ///
    /// `cell` must be a live cell of this kind.
    #[inline]
    pub unsafe fn get_malloc_size(&self, cell: NonNull<GcCell>) -> usize {
        match self.malloc_size {
            Some(malloc_size) => unsafe { malloc_size(cell) },
            None => 0,
        }
    }

    /// Size the cell will occupy after compaction.
    ///
    /// Non-compactable kinds keep their allocated size.
    ///
    /// # Safety
    ///
    /// `cell` must be a live cell of this kind with an intact header.
    #[inline]
    pub unsafe fn get_compacted_size(&self, cell: NonNull<GcCell>) -> u32 {
        match self.compact_size {
            Some(compact_size) => unsafe { compact_size(cell) },
            None => unsafe { cell.as_ref() }.get_allocated_size(),
        }
    }

    /// Shrink a moved cell to `new_size`.
    ///
    /// # Safety
    ///
    /// `cell` must be a relocated cell of this kind whose header already
    /// records `new_size`.
    #[inline]
    pub unsafe fn compact(&self, cell: NonNull<GcCell>, new_size: u32) {
        if let Some(compact) = self.compact {
            unsafe { compact(cell, new_size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_finalize(_cell: NonNull<GcCell>, ctx: &mut FinalizeContext) {
        FINALIZED.fetch_add(1, Ordering::SeqCst);
        ctx.release_native(100);
    }

    unsafe fn fixed_malloc(_cell: NonNull<GcCell>) -> usize {
        64
    }

    static PLAIN: VTable = VTable::new(CellKind::PlainObject, 32);
    static HOOKED: VTable = VTable::new(CellKind::HostObject, 32)
        .with_finalizer(count_finalize)
        .with_malloc_size(fixed_malloc);

    #[repr(C, align(8))]
    struct Buffer([u64; 4]);

    #[test]
    fn test_builder_sets_hooks() {
        assert!(!PLAIN.has_finalizer());
        assert!(!PLAIN.can_be_compacted());
        assert!(!PLAIN.is_variable_size());
        assert!(HOOKED.has_finalizer());
        assert!(VTable::new(CellKind::ArrayStorage, 0).is_variable_size());
    }

    #[test]
    fn test_optional_hooks_are_skipped() {
        let mut buf = Buffer([0; 4]);
        let cell = NonNull::from(&mut buf).cast::<GcCell>();
        unsafe { GcCell::init_header(cell, CellKind::PlainObject, 32, 0) };

        let mut ctx = FinalizeContext::default();
        assert!(!unsafe { PLAIN.finalize_if_exists(cell, &mut ctx) });
        assert_eq!(unsafe { PLAIN.get_malloc_size(cell) }, 0);
        assert_eq!(unsafe { PLAIN.get_compacted_size(cell) }, 32);
        assert_eq!(ctx.finalized(), 0);
    }

    #[test]
    fn test_hooks_run() {
        let mut buf = Buffer([0; 4]);
        let cell = NonNull::from(&mut buf).cast::<GcCell>();
        unsafe { GcCell::init_header(cell, CellKind::HostObject, 32, 0) };

        let before = FINALIZED.load(Ordering::SeqCst);
        let mut ctx = FinalizeContext::default();
        assert!(unsafe { HOOKED.finalize_if_exists(cell, &mut ctx) });
        assert_eq!(FINALIZED.load(Ordering::SeqCst), before + 1);
        assert_eq!(ctx.native_bytes_released(), 100);
        assert_eq!(ctx.finalized(), 1);
        assert_eq!(unsafe { HOOKED.get_malloc_size(cell) }, 64);
    }

    #[test]
    #[should_panic(expected = "has no finalizer")]
    fn test_finalize_without_hook_panics() {
        let mut buf = Buffer([0; 4]);
        let cell = NonNull::from(&mut buf).cast::<GcCell>();
        let mut ctx = FinalizeContext::default();
        unsafe { PLAIN.finalize(cell, &mut ctx) };
    }
}
