//! Heap cells: header, kinds, vtables and the kind registry.
//!
//! A cell is a contiguous, 8-byte aligned block inside a heap segment:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ GcCell (16B) │ kind-specific fields (described by Metadata) │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Behavior is dispatched through the [`CellRegistry`], indexed by the
//! [`CellKind`] stored in the header.

mod cell_ref;
mod header;
mod kind;
mod pointer;
mod registry;
mod vtable;

pub use cell_ref::{CellLayout, CellRef};
pub use header::{
    heap_align_size, is_size_heap_aligned, CellDebugInfo, GcCell, KindAndSize, CELL_MAGIC,
    HEAP_ALIGN,
};
pub use kind::CellKind;
pub use pointer::GcPointer;
pub use registry::{BuildMetadataFn, CellRegistry, CellRegistryBuilder};
pub use vtable::{
    CompactFn, CompactSizeFn, FinalizeContext, FinalizeFn, MallocSizeFn, MarkWeakFn, VTable,
};
