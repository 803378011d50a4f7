//! Per-segment card table.
//!
//! A segment is divided into fixed-size cards. Each card has one byte that
//! the write barrier sets when a slot inside the card is stored to. A card
//! scan then visits only the slots lying in dirty cards:
//!
//! ```text
//! segment  ┌──────┬──────┬──────┬──────┬──────┬──────┐
//!          │ c0   │ c1   │ c2   │ c3   │ c4   │ c5   │
//!          └──────┴──────┴──────┴──────┴──────┴──────┘
//! cards      0      1      1      0      1      0
//! ranges          [c1 ........ c2]    [c4]
//! ```
//!
//! Beside the dirty bytes the table keeps, per card, the offset of the cell
//! covering the card's first byte. A scan of a dirty range starts from that
//! cell instead of walking the segment from its start.

use std::sync::atomic::{AtomicU8, Ordering};

/// Card state values.
pub const CARD_CLEAN: u8 = 0;
/// A slot in the card was written since the last scan.
pub const CARD_DIRTY: u8 = 1;

/// First-cell entry for a card lying wholly above the allocation level.
const NO_CELL: u32 = u32::MAX;

/// Dirty bits for one segment.
pub struct CardTable {
    cards: Box<[AtomicU8]>,
    /// Offset from `base` of the cell covering each card's first byte.
    first_cells: Box<[u32]>,
    base: usize,
    card_shift: u32,
}

impl CardTable {
    /// Create a clean table covering `size` bytes from `base`.
    ///
    /// # Arguments
    ///
    /// * `base` - Start address of the covered segment
    /// * `size` - Size of the covered segment in bytes
    /// * `card_size` - Size of each card (must be power of 2)
    pub fn new(base: usize, size: usize, card_size: usize) -> Self {
        assert!(card_size.is_power_of_two(), "card size must be a power of 2");
        let num_cards = size.div_ceil(card_size);
        Self {
            cards: (0..num_cards).map(|_| AtomicU8::new(CARD_CLEAN)).collect(),
            first_cells: vec![NO_CELL; num_cards].into_boxed_slice(),
            base,
            card_shift: card_size.trailing_zeros(),
        }
    }

    #[inline]
    fn card_index(&self, addr: usize) -> Option<usize> {
        let index = addr.checked_sub(self.base)? >> self.card_shift;
        (index < self.cards.len()).then_some(index)
    }

    /// Address of the first byte covered by card `index`.
    #[inline]
    pub fn card_start(&self, index: usize) -> usize {
        self.base + (index << self.card_shift)
    }

    /// Mark the card containing `addr` dirty.
    ///
    /// Addresses outside the segment are ignored.
    #[inline]
    pub fn dirty(&self, addr: *const u8) {
        if let Some(index) = self.card_index(addr as usize) {
            self.cards[index].store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    /// Whether the card containing `addr` is dirty.
    #[inline]
    pub fn is_dirty(&self, addr: *const u8) -> bool {
        self.card_index(addr as usize)
            .is_some_and(|i| self.cards[i].load(Ordering::Relaxed) == CARD_DIRTY)
    }

    /// Clear all cards.
    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Call `f(start, end)` for each maximal run of dirty cards.
    pub fn for_each_dirty_range<F>(&self, mut f: F)
    where
        F: FnMut(usize, usize),
    {
        let mut run_start: Option<usize> = None;
        for (i, card) in self.cards.iter().enumerate() {
            let dirty = card.load(Ordering::Relaxed) == CARD_DIRTY;
            match (dirty, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(first)) => {
                    f(self.card_start(first), self.card_start(i));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(first) = run_start {
            f(self.card_start(first), self.card_start(self.cards.len()));
        }
    }

    // =========================================================================
    // First-cell index
    // =========================================================================

    /// Record a cell occupying `[start, end)`, given as offsets from the
    /// segment base.
    ///
    /// Every card whose first byte lies inside the cell now points at it.
    pub fn record_cell(&mut self, start: usize, end: usize) {
        debug_assert!(start < end, "empty cell at offset {start}");
        let first = start.div_ceil(self.card_size());
        let last = ((end - 1) >> self.card_shift).min(self.first_cells.len() - 1);
        for entry in self.first_cells.iter_mut().take(last + 1).skip(first) {
            *entry = start as u32;
        }
    }

    /// Forget the cells at or above `level`, an offset from the segment base.
    pub fn forget_cells_from(&mut self, level: usize) {
        let first = level.div_ceil(self.card_size());
        for entry in self.first_cells.iter_mut().skip(first) {
            *entry = NO_CELL;
        }
    }

    /// Forget every recorded cell.
    pub fn forget_all_cells(&mut self) {
        self.first_cells.fill(NO_CELL);
    }

    /// Offset of the cell covering the first byte of the card holding `addr`.
    ///
    /// `None` when that card starts at or above the allocation level.
    #[inline]
    pub fn first_cell_covering(&self, addr: *const u8) -> Option<usize> {
        let index = self.card_index(addr as usize)?;
        let offset = self.first_cells[index];
        (offset != NO_CELL).then_some(offset as usize)
    }

    /// Count dirty cards.
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CARD_DIRTY)
            .count()
    }

    /// Get total number of cards.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Get card size.
    pub fn card_size(&self) -> usize {
        1 << self.card_shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10000;

    fn addr(offset: usize) -> *const u8 {
        (BASE + offset) as *const u8
    }

    #[test]
    fn test_card_table_creation() {
        let table = CardTable::new(BASE, 0x10000, 512);
        assert_eq!(table.len(), 0x10000 / 512);
        assert_eq!(table.card_size(), 512);
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_dirty_and_clear() {
        let table = CardTable::new(BASE, 0x10000, 512);
        assert!(!table.is_dirty(addr(100)));
        table.dirty(addr(100));
        assert!(table.is_dirty(addr(200))); // Same card
        assert!(!table.is_dirty(addr(600))); // Next card
        table.clear_all();
        assert!(!table.is_dirty(addr(100)));
    }

    #[test]
    fn test_out_of_range_ignored() {
        let table = CardTable::new(BASE, 0x1000, 512);
        table.dirty((BASE - 8) as *const u8);
        table.dirty(addr(0x1000));
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_dirty_ranges_coalesce() {
        let table = CardTable::new(BASE, 6 * 512, 512);
        table.dirty(addr(512));
        table.dirty(addr(2 * 512 + 8));
        table.dirty(addr(4 * 512));

        let mut ranges = Vec::new();
        table.for_each_dirty_range(|start, end| ranges.push((start - BASE, end - BASE)));
        assert_eq!(ranges, vec![(512, 3 * 512), (4 * 512, 5 * 512)]);
    }

    #[test]
    fn test_dirty_range_at_end() {
        let table = CardTable::new(BASE, 4 * 512, 512);
        table.dirty(addr(3 * 512 + 1));
        let mut ranges = Vec::new();
        table.for_each_dirty_range(|start, end| ranges.push((start - BASE, end - BASE)));
        assert_eq!(ranges, vec![(3 * 512, 4 * 512)]);
    }

    #[test]
    fn test_first_cell_tracks_spanning_cells() {
        let mut table = CardTable::new(BASE, 4 * 512, 512);
        assert_eq!(table.first_cell_covering(addr(0)), None);

        table.record_cell(0, 480);
        // Spans cards 0..=2.
        table.record_cell(480, 1100);
        // Starts exactly on card 3.
        table.record_cell(1536, 1560);

        assert_eq!(table.first_cell_covering(addr(10)), Some(0));
        assert_eq!(table.first_cell_covering(addr(512)), Some(480));
        assert_eq!(table.first_cell_covering(addr(1024 + 300)), Some(480));
        assert_eq!(table.first_cell_covering(addr(1536)), Some(1536));
    }

    #[test]
    fn test_forget_cells_above_level() {
        let mut table = CardTable::new(BASE, 4 * 512, 512);
        table.record_cell(0, 600);
        table.record_cell(600, 2048);
        table.forget_cells_from(600);
        assert_eq!(table.first_cell_covering(addr(512)), Some(0));
        assert_eq!(table.first_cell_covering(addr(1024)), None);
        assert_eq!(table.first_cell_covering(addr(1536)), None);

        table.forget_all_cells();
        assert_eq!(table.first_cell_covering(addr(0)), None);
    }
}
