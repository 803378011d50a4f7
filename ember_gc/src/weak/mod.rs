//! Weak references.
//!
//! Weak references are indirect: a cell or native structure stores a
//! [`WeakSlotId`], and the slot in the heap's [`WeakRefTable`] holds the
//! actual target. The collector clears slots whose target died and
//! rewrites slots whose target moved, so holders never see a dangling
//! pointer. All access to the table goes through the [`WeakRefMutex`].

mod slot;
mod value_map;

pub use slot::{
    WeakRef, WeakRefLock, WeakRefMutex, WeakRefTable, WeakSlotId, WeakSlotState, WeakSweepResult,
};
pub use value_map::{WeakValueMap, MIN_PRUNE_LIMIT};
