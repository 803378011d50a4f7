//! Typed references to heap cells.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use super::{GcCell, VTable};
use crate::metadata::MetadataBuilder;

/// A Rust type laid out as a heap cell.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with a [`GcCell`] as their first
/// field, and `build_metadata` must declare every pointer, value and weak
/// slot at its true offset. Fixed-size kinds must use a vtable whose
/// `size` is `heap_align_size(size_of::<Self>())`; variable-size kinds
/// use 0 and describe their tail with an array.
pub unsafe trait CellLayout: Sized {
    /// The kind's vtable.
    const VTABLE: &'static VTable;

    /// Declare the kind's slots.
    fn build_metadata(builder: &mut MetadataBuilder);
}

/// A typed reference to a heap cell.
///
/// Like a raw pointer, a `CellRef` does not keep its target alive. Every
/// handle is invalid once [`Heap::collect`](crate::Heap::collect) or
/// [`Heap::collect_with`](crate::Heap::collect_with) returns, whether or not
/// its target moved; dereferencing it afterwards is undefined behavior.
/// Hold a root or a weak reference across collections and re-read the
/// handle from it.
///
/// Handles are `Copy` and dereference mutably, so two copies can produce
/// aliasing `&mut` borrows of one cell. Keep at most one mutable borrow
/// of a cell alive at a time.
pub struct CellRef<T: CellLayout> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

impl<T: CellLayout> CellRef<T> {
    /// Create a CellRef from a typed pointer.
    ///
    /// # Safety
    ///
    /// The pointer must address a live cell of `T`'s kind.
    #[inline]
    pub unsafe fn from_non_null(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Create a CellRef from an untyped cell without checking its kind.
    ///
    /// # Safety
    ///
    /// The cell must be a live cell of `T`'s kind.
    #[inline]
    pub unsafe fn from_cell_unchecked(cell: NonNull<GcCell>) -> Self {
        debug_assert!(unsafe { cell.as_ref() }.is_valid_kind(T::VTABLE.kind));
        unsafe { Self::from_non_null(cell.cast()) }
    }

    /// Downcast an untyped cell, returning `None` if its kind differs.
    ///
    /// # Safety
    ///
    /// The cell must be live with an intact header.
    #[inline]
    pub unsafe fn try_from_cell(cell: NonNull<GcCell>) -> Option<Self> {
        if unsafe { cell.as_ref() }.is_valid_kind(T::VTABLE.kind) {
            Some(unsafe { Self::from_non_null(cell.cast()) })
        } else {
            None
        }
    }

    /// The untyped cell.
    #[inline]
    pub fn as_cell(&self) -> NonNull<GcCell> {
        self.ptr.cast()
    }

    /// The cell's header.
    #[inline]
    pub fn header(&self) -> &GcCell {
        // SAFETY: CellLayout guarantees the header is the first field.
        unsafe { self.ptr.cast::<GcCell>().as_ref() }
    }

    /// Get the raw pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Get the NonNull pointer.
    #[inline]
    pub fn as_non_null(&self) -> NonNull<T> {
        self.ptr
    }
}

impl<T: CellLayout> Clone for CellRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: CellLayout> Copy for CellRef<T> {}

impl<T: CellLayout> Deref for CellRef<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: CellLayout> DerefMut for CellRef<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: CellLayout> std::fmt::Debug for CellRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CellRef<{}>({:p})", T::VTABLE.kind, self.ptr.as_ptr())
    }
}

impl<T: CellLayout> PartialEq for CellRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: CellLayout> Eq for CellRef<T> {}

impl<T: CellLayout> std::hash::Hash for CellRef<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}
