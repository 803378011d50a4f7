//! Heap configuration parameters.
//!
//! Segment geometry and debugging switches are tunable per embedder.
//! Defaults target a general-purpose engine instance.

use crate::heap::SegmentLayout;

/// Configuration for the segmented heap.
///
/// # Example
///
/// ```ignore
/// use ember_gc::HeapConfig;
///
/// // Small heap for an embedded interpreter
/// let config = HeapConfig {
///     segment_size: 256 * 1024, // 256KB segments
///     max_segments: 8,          // 2MB total
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    // =========================================================================
    // Segments
    // =========================================================================
    /// Size of each aligned heap segment in bytes.
    ///
    /// Segments are aligned to their own size, so the owning segment of
    /// any interior address is found by masking off the low bits.
    /// Must be a power of two.
    ///
    /// Default: 4MB
    pub segment_size: usize,

    /// Maximum number of segments the heap may acquire.
    ///
    /// Allocation fails with `HeapError::OutOfMemory` once every segment
    /// is full and this limit is reached.
    ///
    /// Default: 256 (1GB with default segments)
    pub max_segments: usize,

    /// Card table granularity for write barriers.
    ///
    /// Each card covers this many bytes of a segment.
    ///
    /// Default: 512 bytes
    pub card_size: usize,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Stamp each cell with a monotonically increasing allocation id.
    ///
    /// Default: enabled in debug builds
    pub track_allocation_ids: bool,

    /// Verify heap well-formedness before and after each collection.
    ///
    /// Expensive but useful for debugging GC bugs.
    ///
    /// Default: false
    pub verify_heap: bool,
}

/// Smallest segment the heap accepts.
pub const MIN_SEGMENT_SIZE: usize = 4 * 1024;

/// Smallest card size the heap accepts.
pub const MIN_CARD_SIZE: usize = 64;

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            segment_size: 4 * 1024 * 1024, // 4MB
            max_segments: 256,
            card_size: 512, // 512 bytes per card
            track_allocation_ids: cfg!(debug_assertions),
            verify_heap: false,
        }
    }
}

impl HeapConfig {
    /// Create a configuration optimized for low memory usage.
    pub fn low_memory() -> Self {
        Self {
            segment_size: 1024 * 1024, // 1MB
            max_segments: 32,
            ..Default::default()
        }
    }

    /// Create a small, self-verifying configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            segment_size: 64 * 1024, // 64KB
            max_segments: 16,
            card_size: 256,
            track_allocation_ids: true,
            verify_heap: true,
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.segment_size.is_power_of_two() {
            return Err(ConfigError::SegmentNotPowerOfTwo(self.segment_size));
        }
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(ConfigError::SegmentTooSmall(self.segment_size));
        }
        if self.card_size < MIN_CARD_SIZE || !self.card_size.is_power_of_two() {
            return Err(ConfigError::InvalidCardSize(self.card_size));
        }
        if self.card_size >= self.segment_size {
            return Err(ConfigError::CardLargerThanSegment);
        }
        if self.max_segments == 0 {
            return Err(ConfigError::NoSegments);
        }
        Ok(())
    }

    /// Segment geometry derived from `segment_size`.
    ///
    /// Only meaningful for a configuration that passed [`validate`](Self::validate).
    #[inline]
    pub fn segment_layout(&self) -> Option<SegmentLayout> {
        SegmentLayout::new(self.segment_size)
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Segment size is not a power of two.
    #[error("segment size {0} is not a power of two")]
    SegmentNotPowerOfTwo(usize),
    /// Segment size is below [`MIN_SEGMENT_SIZE`].
    #[error("segment size {0} is below the 4KB minimum")]
    SegmentTooSmall(usize),
    /// Card size must be a power of two, minimum 64.
    #[error("card size {0} must be a power of two, minimum 64")]
    InvalidCardSize(usize),
    /// A card must be smaller than a segment.
    #[error("card size must be smaller than the segment size")]
    CardLargerThanSegment,
    /// The heap needs at least one segment.
    #[error("max_segments must be at least 1")]
    NoSegments,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(HeapConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(HeapConfig::low_memory().validate().is_ok());
        assert!(HeapConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_segment_must_be_power_of_two() {
        let config = HeapConfig {
            segment_size: 96 * 1024,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::SegmentNotPowerOfTwo(96 * 1024))
        );
        assert!(config.segment_layout().is_none());
    }

    #[test]
    fn test_segment_minimum() {
        let config = HeapConfig {
            segment_size: 2048,
            card_size: 64,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::SegmentTooSmall(2048)));
    }

    #[test]
    fn test_invalid_card_size() {
        let config = HeapConfig {
            card_size: 100, // Not power of two
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidCardSize(100)));
    }

    #[test]
    fn test_card_must_fit_in_segment() {
        let config = HeapConfig {
            segment_size: 4096,
            card_size: 4096,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::CardLargerThanSegment));
    }

    #[test]
    fn test_zero_segments_rejected() {
        let config = HeapConfig {
            max_segments: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoSegments));
    }

    #[test]
    fn test_segment_layout_matches_size() {
        let layout = HeapConfig::default().segment_layout().unwrap();
        assert_eq!(layout.size(), 4 * 1024 * 1024);
    }
}
