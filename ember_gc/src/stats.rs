//! GC statistics and metrics.
//!
//! Tracks allocation volume, collection times and reclaimed memory for
//! monitoring and tuning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::collector::CollectionResult;

/// Statistics about heap activity.
#[derive(Debug)]
pub struct GcStats {
    // =========================================================================
    // Allocation Statistics
    // =========================================================================
    /// Total bytes allocated since start.
    pub bytes_allocated: AtomicU64,
    /// Total cells allocated since start.
    pub cells_allocated: AtomicU64,
    /// Cells allocated with a caller-chosen size.
    pub variable_cells_allocated: AtomicU64,
    /// Segments acquired from the storage provider.
    pub segments_created: AtomicU64,

    // =========================================================================
    // Collection Statistics
    // =========================================================================
    /// Number of collections.
    pub collections: AtomicU64,
    /// Total time spent collecting (nanoseconds).
    pub gc_time_ns: AtomicU64,
    /// Live bytes after the last collection.
    pub live_bytes: AtomicU64,
    /// Total bytes reclaimed from dead cells.
    pub bytes_freed: AtomicU64,
    /// Total dead cells reclaimed.
    pub cells_freed: AtomicU64,
    /// Total bytes reclaimed by shrinking live cells.
    pub bytes_compacted: AtomicU64,
    /// Total finalizers run.
    pub cells_finalized: AtomicU64,
    /// Total weak slots returned to the free list.
    pub weak_slots_freed: AtomicU64,
}

impl GcStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            bytes_allocated: AtomicU64::new(0),
            cells_allocated: AtomicU64::new(0),
            variable_cells_allocated: AtomicU64::new(0),
            segments_created: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            gc_time_ns: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            cells_freed: AtomicU64::new(0),
            bytes_compacted: AtomicU64::new(0),
            cells_finalized: AtomicU64::new(0),
            weak_slots_freed: AtomicU64::new(0),
        }
    }

    /// Record an allocation.
    #[inline]
    pub fn record_allocation(&self, size: u32, variable: bool) {
        self.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
        self.cells_allocated.fetch_add(1, Ordering::Relaxed);
        if variable {
            self.variable_cells_allocated.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a new segment.
    #[inline]
    pub fn record_segment(&self) {
        self.segments_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished collection.
    pub fn record_collection(&self, result: &CollectionResult, duration: Duration) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.gc_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.live_bytes
            .store(result.live_bytes as u64, Ordering::Relaxed);
        self.bytes_freed
            .fetch_add(result.bytes_freed as u64, Ordering::Relaxed);
        self.cells_freed
            .fetch_add(result.cells_freed as u64, Ordering::Relaxed);
        self.bytes_compacted
            .fetch_add(result.bytes_compacted as u64, Ordering::Relaxed);
        self.cells_finalized
            .fetch_add(result.cells_finalized as u64, Ordering::Relaxed);
        self.weak_slots_freed
            .fetch_add(result.weak_slots_freed as u64, Ordering::Relaxed);
    }

    /// Get total GC time.
    pub fn total_gc_time(&self) -> Duration {
        Duration::from_nanos(self.gc_time_ns.load(Ordering::Relaxed))
    }

    /// Get average pause time.
    pub fn avg_pause(&self) -> Duration {
        let count = self.collections.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.gc_time_ns.load(Ordering::Relaxed) / count)
    }

    /// Log a summary of GC statistics.
    pub fn log_summary(&self) {
        tracing::info!(
            cells_allocated = self.cells_allocated.load(Ordering::Relaxed),
            bytes_allocated = %format_bytes(self.bytes_allocated.load(Ordering::Relaxed)),
            live = %format_bytes(self.live_bytes.load(Ordering::Relaxed)),
            collections = self.collections.load(Ordering::Relaxed),
            total_gc_time = ?self.total_gc_time(),
            avg_pause = ?self.avg_pause(),
            cells_freed = self.cells_freed.load(Ordering::Relaxed),
            finalized = self.cells_finalized.load(Ordering::Relaxed),
            "gc statistics"
        );
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes in human-readable form.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Times one collection phase and logs it on completion.
pub struct GcTimer {
    phase: &'static str,
    start: Instant,
}

impl GcTimer {
    /// Start timing `phase`.
    pub fn start(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }

    /// Time elapsed so far.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timing and return the elapsed duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::trace!(phase = self.phase, ?elapsed, "gc phase finished");
        elapsed
    }
}
