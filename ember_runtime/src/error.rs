//! Errors surfaced by runtime cell operations.

use ember_gc::HeapError;

/// Errors produced while creating or mutating runtime cells.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The heap could not satisfy an allocation.
    #[error(transparent)]
    Heap(#[from] HeapError),

    /// A push would exceed the storage's fixed capacity.
    #[error("array storage is full at capacity {capacity}")]
    ArrayFull {
        /// Capacity of the full storage.
        capacity: u32,
    },

    /// An index past the current length.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index.
        index: u32,
        /// Current length.
        len: u32,
    },

    /// A request for more slots than the kind supports.
    #[error("requested {requested} slots but at most {max} are supported")]
    TooManySlots {
        /// Requested slot count.
        requested: u64,
        /// Supported maximum.
        max: u64,
    },

    /// A runtime module index that the domain does not own.
    #[error("domain has no runtime module {0}")]
    UnknownRuntimeModule(u32),
}

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
