//! Ember Garbage Collector
//!
//! The cell model and segmented, compacting heap underneath the Ember
//! JavaScript runtime.
//!
//! # Architecture
//!
//! - **Cells**: every heap object starts with a 16-byte [`GcCell`] header
//!   packing its [`CellKind`] and allocated size. Per-kind behavior
//!   (finalization, weak marking, native size, compaction) lives in a
//!   static [`VTable`] looked up through the [`CellRegistry`].
//!
//! - **Metadata**: each kind declares the offsets of its pointer, value and
//!   weak slots, plus at most one trailing array. The [`SlotVisitor`] walks
//!   those slots for marking, pointer updating, verification and card
//!   scanning, so cells never implement tracing themselves.
//!
//! - **Segments**: the heap is a list of power-of-two segments aligned to
//!   their own size, filled by bump allocation. The owning segment of any
//!   interior pointer is found by masking.
//!
//! - **Weak references**: weak slots indirect through a locked
//!   [`WeakRefTable`]; the collector clears slots whose target died.
//!
//! # Write Barriers
//!
//! Stores into slots of existing cells must be followed by
//! [`Heap::write_barrier`], which dirties the card covering the slot.
//!
//! # Usage
//!
//! ```ignore
//! use ember_gc::{CellRegistry, Heap, HeapConfig};
//!
//! let registry = CellRegistry::builder()
//!     .register_layout::<MyObject>()
//!     .build()?;
//! let mut heap = Heap::new(HeapConfig::default(), Arc::new(registry))?;
//!
//! let obj = heap.alloc_fixed(MyObject::new())?;
//! let root = heap.add_root(obj.as_cell());
//! heap.collect();
//! let obj = heap.root_as::<MyObject>(root);
//! ```
//!
//! # Safety
//!
//! The heap requires that:
//! - Every cell type is `#[repr(C)]`, starts with a `GcCell`, and declares
//!   all of its slots in `build_metadata`
//! - Typed references are not held across a collection unless rooted
//! - Write barriers are executed after slot stores into existing cells

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod cell;
pub mod collector;
pub mod config;
pub mod error;
pub mod heap;
pub mod metadata;
pub mod roots;
pub mod trace;
pub mod value;
pub mod weak;

mod stats;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use cell::{CellKind, CellLayout, CellRef, CellRegistry, GcCell, GcPointer, KindAndSize, VTable};
pub use collector::CollectionResult;
pub use config::HeapConfig;
pub use error::{HeapError, RegistryError};
pub use heap::{Heap, HeapInfo};
pub use metadata::{ArrayData, Metadata, MetadataBuilder, SlotKind, SlotOffsets};
pub use roots::{RootId, RootProvider};
pub use stats::{format_bytes, GcStats, GcTimer};
pub use trace::{SlotAcceptor, SlotVisitor, WeakRefAcceptor};
pub use value::Value;
pub use weak::{WeakRef, WeakRefLock, WeakRefTable, WeakSlotId, WeakValueMap};
