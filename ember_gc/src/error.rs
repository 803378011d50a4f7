//! Error types surfaced by the heap.

use crate::cell::CellKind;
use crate::config::ConfigError;

/// Errors produced by heap construction, allocation and verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// The supplied configuration failed validation.
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The storage provider could not supply another segment.
    #[error("storage provider could not supply a {size}-byte segment")]
    StorageExhausted {
        /// Requested segment size.
        size: usize,
    },

    /// Every segment is full and the segment limit has been reached.
    #[error("heap exhausted with {segments} segments while allocating {requested} bytes")]
    OutOfMemory {
        /// Segments currently owned by the heap.
        segments: usize,
        /// Size of the failed allocation.
        requested: u32,
    },

    /// A single cell would not fit in an empty segment.
    #[error("{kind:?} cell of {size} bytes exceeds the segment capacity of {capacity} bytes")]
    CellTooLarge {
        /// Kind of the rejected cell.
        kind: CellKind,
        /// Requested size.
        size: usize,
        /// Usable bytes in one segment.
        capacity: usize,
    },

    /// Heap verification found a malformed cell or a dangling reference.
    #[error("heap corrupted at {addr:#x}: {reason}")]
    Corrupted {
        /// Address of the offending cell or slot.
        addr: usize,
        /// What the verifier found.
        reason: &'static str,
    },
}

/// Errors produced while assembling a [`CellRegistry`](crate::cell::CellRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two vtables claimed the same kind.
    #[error("cell kind {0:?} registered twice")]
    DuplicateKind(CellKind),

    /// A fixed-size kind declared a slot outside its allocation.
    #[error("{kind:?} declares a slot at offset {offset} beyond its {size}-byte cell")]
    SlotOutOfBounds {
        /// Offending kind.
        kind: CellKind,
        /// Offset of the slot.
        offset: u32,
        /// Fixed cell size from the vtable.
        size: u32,
    },
}
