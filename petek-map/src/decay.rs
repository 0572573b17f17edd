//! A retired table draining toward empty.
//!
//! Decaying tables accept no new keys: they expose lookups, tombstoning and
//! an emptiness check, and the migration machinery moves their remaining
//! live entries into the active table. Nodes form an intrusive
//! youngest-to-oldest chain; only the migration-flag holder mutates the
//! chain, readers traverse it under a `petek` guard.

use crate::table::Table;
use crate::traits::{Key, Value};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use petek::Atomic;

pub(crate) struct DecayingTable<K, V> {
    /// Owned; freed when the node is dropped (after safe reclamation).
    table: *mut Table<K, V>,
    /// Set once the table has been unpublished and its writers quiesced.
    /// Until then the held-key count may still rise, so emptiness must not
    /// be cached.
    sealed: AtomicBool,
    /// Cleared once the table has been observed empty; an inactive table
    /// holds no live entry and is eligible for unlinking.
    active: AtomicBool,
    /// Next cell index the drain scan will look at. Only the migration-flag
    /// holder advances it.
    pub(crate) drain_cursor: AtomicUsize,
    /// Next-older decaying table.
    pub(crate) next: Atomic<DecayingTable<K, V>>,
}

// SAFETY: the raw table pointer is owned by this node, and all access to the
// pointee goes through atomics.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for DecayingTable<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for DecayingTable<K, V> {}

impl<K, V> Drop for DecayingTable<K, V> {
    fn drop(&mut self) {
        // SAFETY: the node owns the table; drop runs only through map drop
        // or deferred reclamation, after readers are gone.
        unsafe { drop(Box::from_raw(self.table)) };
    }
}

impl<K: Key, V: Value> DecayingTable<K, V> {
    pub(crate) fn new(table: *mut Table<K, V>) -> Self {
        Self {
            table,
            sealed: AtomicBool::new(false),
            active: AtomicBool::new(true),
            drain_cursor: AtomicUsize::new(0),
            next: Atomic::null(),
        }
    }

    /// Marks the table as fully retired: unpublished and writer-quiesced.
    /// From here on its held-key count only falls.
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn table(&self) -> &Table<K, V> {
        // SAFETY: valid until this node is dropped, and `&self` proves the
        // node is alive.
        unsafe { &*self.table }
    }

    /// Looks up `key`, returning its value word or the absent word.
    ///
    /// Draining un-claims keys, so the probe scans the full window; tables
    /// already observed empty are skipped outright.
    pub(crate) fn get(&self, hash: u64, key: u64) -> u64 {
        let absent = V::absent().into_word();
        if self.is_empty() {
            return absent;
        }
        match self.table().find_cell_slow(hash, key) {
            Some(cell) => cell.value(Ordering::Acquire),
            None => absent,
        }
    }

    /// Tombstones `key`, returning the previous value word.
    pub(crate) fn remove(&self, hash: u64, key: u64) -> u64 {
        let absent = V::absent().into_word();
        if self.is_empty() {
            return absent;
        }
        match self.table().find_cell_slow(hash, key) {
            Some(cell) => {
                let previous = cell.take(absent);
                if previous != absent {
                    self.table().held_keys.fetch_sub(1, Ordering::Relaxed);
                }
                previous
            }
            None => absent,
        }
    }

    /// Whether the table holds no live entry. Caches the answer: once a
    /// sealed table's held-key count reaches zero it can never rise again,
    /// since sealed tables accept no publications.
    pub(crate) fn is_empty(&self) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return true;
        }
        if !self.sealed.load(Ordering::Acquire) {
            // The table is still published or its writers have not
            // quiesced; it must stay visible to fallback reads.
            return false;
        }
        if self.table().held_keys.load(Ordering::Relaxed) <= 0 {
            self.active.store(false, Ordering::Release);
            return true;
        }
        false
    }
}
