//! A hash map whose values are weak references.

use std::collections::hash_map::Entry;
use std::hash::Hash;

use rustc_hash::FxHashMap;

use super::{WeakRef, WeakRefLock};
use crate::cell::{CellLayout, CellRef};
use crate::trace::WeakRefAcceptor;

/// Floor for the automatic pruning threshold.
pub const MIN_PRUNE_LIMIT: usize = 16;

/// Maps keys to cells without keeping the cells alive.
///
/// Entries whose target died linger until they are overwritten or pruned.
/// Pruning runs automatically once the map grows past its prune limit,
/// after which the limit is reset to `max(2 * len + 1, MIN_PRUNE_LIMIT)`,
/// so repeated inserts cost amortized O(1).
///
/// The owning cell must report the map's slots from its `mark_weak` hook
/// through [`mark_weak_refs`](Self::mark_weak_refs).
pub struct WeakValueMap<K, V> {
    map: FxHashMap<K, WeakRef<V>>,
    prune_limit: usize,
}

impl<K: Hash + Eq, V: CellLayout> WeakValueMap<K, V> {
    /// An empty map.
    pub fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            prune_limit: MIN_PRUNE_LIMIT,
        }
    }

    /// The live value for `key`.
    pub fn lookup(&self, lock: &WeakRefLock<'_>, key: &K) -> Option<CellRef<V>> {
        self.map.get(key).and_then(|weak| weak.get(lock))
    }

    /// Whether `key` maps to a live value.
    pub fn contains_key(&self, lock: &WeakRefLock<'_>, key: &K) -> bool {
        self.map.get(key).is_some_and(|weak| weak.is_valid(lock))
    }

    /// Insert `value` unless `key` already maps to a live value.
    ///
    /// A dead entry for `key` is replaced. Returns whether the map changed.
    pub fn insert_new(&mut self, lock: &mut WeakRefLock<'_>, key: K, value: CellRef<V>) -> bool {
        match self.map.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_valid(lock) {
                    return false;
                }
                // The old slot is no longer reported and is freed by the
                // next collection.
                *entry.get_mut() = WeakRef::new(lock, value);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(WeakRef::new(lock, value));
                if self.map.len() > self.prune_limit {
                    self.prune_invalid(lock);
                }
                true
            }
        }
    }

    /// Remove `key`. Returns whether an entry, live or dead, was removed.
    ///
    /// The lock is not consulted; requiring it keeps map mutation ordered
    /// with collections that read the weak table.
    pub fn erase(&mut self, _lock: &WeakRefLock<'_>, key: &K) -> bool {
        let removed = self.map.remove(key).is_some();
        if removed {
            self.recalc_prune_limit();
        }
        removed
    }

    /// Visit every entry, including dead ones.
    pub fn for_each_entry(&self, mut f: impl FnMut(&K, &WeakRef<V>)) {
        for (key, weak) in &self.map {
            f(key, weak);
        }
    }

    /// Report every slot so the collector keeps them allocated.
    pub fn mark_weak_refs<A: WeakRefAcceptor + ?Sized>(&mut self, acceptor: &mut A) {
        for weak in self.map.values_mut() {
            acceptor.accept_weak_slot(weak.slot_mut());
        }
    }

    /// Remove every entry whose value died. Returns how many were removed.
    pub fn prune_invalid(&mut self, lock: &WeakRefLock<'_>) -> usize {
        let before = self.map.len();
        self.map.retain(|_, weak| weak.is_valid(lock));
        self.recalc_prune_limit();
        let pruned = before - self.map.len();
        if pruned > 0 {
            tracing::trace!(pruned, remaining = self.map.len(), "pruned weak value map");
        }
        pruned
    }

    fn recalc_prune_limit(&mut self) {
        self.prune_limit = (2 * self.map.len() + 1).max(MIN_PRUNE_LIMIT);
    }

    /// Entries, including dead ones.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map has no entries at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Size at which the next insert prunes.
    #[inline]
    pub fn prune_limit(&self) -> usize {
        self.prune_limit
    }

    /// Native memory held by the map's table, in bytes.
    pub fn native_size(&self) -> usize {
        self.map.capacity() * std::mem::size_of::<(K, WeakRef<V>)>()
    }
}

impl<K: Hash + Eq, V: CellLayout> Default for WeakValueMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: std::fmt::Debug, V> std::fmt::Debug for WeakValueMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakValueMap")
            .field("len", &self.map.len())
            .field("prune_limit", &self.prune_limit)
            .finish()
    }
}
