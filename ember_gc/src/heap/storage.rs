//! Size-aligned backing storage for heap segments.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::SegmentLayout;
use crate::error::HeapError;

/// A zeroed block of memory aligned to its own size.
///
/// Freed when dropped.
pub struct AlignedStorage {
    ptr: NonNull<u8>,
    layout: SegmentLayout,
}

// SAFETY: the storage is a plain byte buffer owned by exactly one segment.
unsafe impl Send for AlignedStorage {}

impl AlignedStorage {
    /// Allocate zeroed storage of `layout.size()` bytes, aligned to the same.
    pub fn allocate(layout: SegmentLayout) -> Option<Self> {
        let alloc_layout = Layout::from_size_align(layout.size(), layout.size()).ok()?;
        // SAFETY: segment layouts are never zero-sized.
        let ptr = unsafe { std::alloc::alloc_zeroed(alloc_layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, layout })
    }

    /// First byte of the storage.
    #[inline]
    pub fn low_lim(&self) -> NonNull<u8> {
        self.ptr
    }

    /// One past the last byte of the storage.
    #[inline]
    pub fn hi_lim(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the allocation.
        unsafe { self.ptr.as_ptr().add(self.layout.size()) }
    }

    /// Storage size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Geometry of this storage.
    #[inline]
    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }
}

impl Drop for AlignedStorage {
    fn drop(&mut self) {
        let size = self.layout.size();
        // SAFETY: the same layout was validated in `allocate`.
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, size);
            std::alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl std::fmt::Debug for AlignedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedStorage")
            .field("low_lim", &self.ptr)
            .field("size", &self.layout.size())
            .finish()
    }
}

/// Source of segment storage.
pub trait StorageProvider: Send + Sync {
    /// Supply zeroed storage aligned to its own size.
    fn new_storage(&self, layout: SegmentLayout) -> Result<AlignedStorage, HeapError>;
}

/// Takes storage straight from the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct MallocStorageProvider;

impl StorageProvider for MallocStorageProvider {
    fn new_storage(&self, layout: SegmentLayout) -> Result<AlignedStorage, HeapError> {
        AlignedStorage::allocate(layout).ok_or(HeapError::StorageExhausted {
            size: layout.size(),
        })
    }
}

/// Hands out at most a fixed number of storages.
///
/// Useful for exercising exhaustion paths independently of `max_segments`.
#[derive(Debug)]
pub struct LimitedStorageProvider {
    limit: usize,
    handed_out: AtomicUsize,
}

impl LimitedStorageProvider {
    /// Allow at most `limit` storages.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            handed_out: AtomicUsize::new(0),
        }
    }

    /// Storages supplied so far.
    pub fn handed_out(&self) -> usize {
        self.handed_out.load(Ordering::Relaxed)
    }
}

impl StorageProvider for LimitedStorageProvider {
    fn new_storage(&self, layout: SegmentLayout) -> Result<AlignedStorage, HeapError> {
        let exhausted = HeapError::StorageExhausted {
            size: layout.size(),
        };
        self.handed_out
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map_err(|_| exhausted.clone())?;
        AlignedStorage::allocate(layout).ok_or(exhausted)
    }
}
