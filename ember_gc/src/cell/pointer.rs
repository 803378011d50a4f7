//! Nullable pointer slot stored inside cells.

use std::fmt;
use std::ptr::NonNull;

use super::GcCell;

/// A nullable reference to a heap cell, as laid out inside another cell.
///
/// Pointer slots are declared in a kind's metadata and rewritten by the
/// collector when the referent moves. Stores into a pointer slot of an
/// existing cell must be followed by a write barrier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct GcPointer(Option<NonNull<GcCell>>);

const _: () = assert!(std::mem::size_of::<GcPointer>() == std::mem::size_of::<usize>());

impl GcPointer {
    /// The null pointer.
    pub const NULL: GcPointer = GcPointer(None);

    /// Wrap a cell address.
    #[inline]
    pub const fn new(cell: NonNull<GcCell>) -> Self {
        Self(Some(cell))
    }

    /// Wrap an optional cell address.
    #[inline]
    pub const fn from_option(cell: Option<NonNull<GcCell>>) -> Self {
        Self(cell)
    }

    /// The referenced cell, if any.
    #[inline]
    pub const fn get(self) -> Option<NonNull<GcCell>> {
        self.0
    }

    /// Replace the referent.
    #[inline]
    pub fn set(&mut self, cell: Option<NonNull<GcCell>>) {
        self.0 = cell;
    }

    /// Whether the slot is null.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Debug for GcPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(p) => write!(f, "GcPointer({:p})", p.as_ptr()),
            None => f.write_str("GcPointer(null)"),
        }
    }
}
