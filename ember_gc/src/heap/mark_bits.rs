//! Side table of mark bits, one bit per heap-aligned granule.

use crate::cell::HEAP_ALIGN;

const GRANULE_SHIFT: u32 = HEAP_ALIGN.trailing_zeros();

/// Mark bits covering one segment.
///
/// Only the collector touches the bits, and only while the world is
/// stopped, so plain words suffice.
#[derive(Debug)]
pub struct MarkBitArray {
    base: usize,
    words: Box<[u64]>,
}

impl MarkBitArray {
    /// Bits for `size` bytes starting at `base`.
    pub fn new(base: usize, size: usize) -> Self {
        let bits = size >> GRANULE_SHIFT;
        Self {
            base,
            words: vec![0u64; bits.div_ceil(64)].into_boxed_slice(),
        }
    }

    #[inline]
    fn locate(&self, addr: usize) -> (usize, u64) {
        debug_assert!(addr >= self.base, "address below the segment");
        debug_assert_eq!(addr & (HEAP_ALIGN - 1), 0, "address is not heap aligned");
        let bit = (addr - self.base) >> GRANULE_SHIFT;
        (bit / 64, 1u64 << (bit % 64))
    }

    /// Set the bit for `addr`. Returns true if it was previously clear.
    #[inline]
    pub fn mark(&mut self, addr: usize) -> bool {
        let (word, mask) = self.locate(addr);
        let newly = self.words[word] & mask == 0;
        self.words[word] |= mask;
        newly
    }

    /// Whether the bit for `addr` is set.
    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        let (word, mask) = self.locate(addr);
        self.words[word] & mask != 0
    }

    /// Clear every bit.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_query() {
        let mut bits = MarkBitArray::new(0x1000, 4096);
        assert!(!bits.is_marked(0x1008));
        assert!(bits.mark(0x1008));
        assert!(!bits.mark(0x1008));
        assert!(bits.is_marked(0x1008));
        assert!(!bits.is_marked(0x1010));
        assert_eq!(bits.count(), 1);
    }

    #[test]
    fn test_last_granule() {
        let mut bits = MarkBitArray::new(0, 4096);
        assert!(bits.mark(4096 - HEAP_ALIGN));
        assert_eq!(bits.count(), 1);
    }

    #[test]
    fn test_clear_all() {
        let mut bits = MarkBitArray::new(0, 4096);
        bits.mark(0);
        bits.mark(512);
        bits.clear_all();
        assert_eq!(bits.count(), 0);
    }
}
