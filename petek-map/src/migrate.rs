//! Migration coordination: growth, entry transfer, and chain maintenance.
//!
//! At most one migration runs at a time, guarded by the map's `migrating`
//! flag. The flag holder is the only thread that pushes, drains or unlinks
//! decaying tables; everyone else either skips (opportunistic triggers) or
//! waits for the flag (growth-forced triggers). Promotions move entries with
//! copy-then-drain order so a value is always discoverable in at least one
//! table while it travels.

use crate::cell::Cell;
use crate::decay::DecayingTable;
use crate::map::FlatMap;
use crate::table::{Claim, Table};
use crate::traits::{Key, Value};
use crate::util::Backoff;
use core::sync::atomic::Ordering;
use petek::{Guard, Shared};
use std::hash::BuildHasher;

/// Entries moved per insert-piggybacked drain attempt.
const OPPORTUNISTIC_BATCH: usize = 64;

/// Entries moved right after a forced growth, before the flag is released.
const INITIAL_TRANSFER: usize = 1024;

/// Outcome of a drain pass over one decaying table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainStatus {
    /// The source has no more transferable entries.
    Drained,
    /// The pass stopped because its entry budget ran out.
    BudgetExhausted,
    /// The active table could not accept another key; growth must intervene
    /// before draining continues.
    TargetFull,
}

/// Outcome of promoting one entry into the active table.
enum Promote {
    /// The value now lives in the active table and the source was drained.
    Moved,
    /// A later user insert already owned the target cell; the stale source
    /// copy was dropped.
    Superseded,
    /// A concurrent remove took the source copy mid-promotion; the
    /// transferred value was withdrawn again.
    Healed,
    /// No cell could be claimed in the active table.
    TargetFull,
}

impl<K: Key, V: Value, S: BuildHasher> FlatMap<K, V, S> {
    #[inline]
    pub(crate) fn try_start_migration(&self) -> bool {
        self.migrating
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn end_migration(&self) {
        self.migrating.store(false, Ordering::Release);
    }

    /// Growth-forced migration trigger.
    ///
    /// `observed` is the table the caller found saturated. Losers of the
    /// migration flag wait until either the flag frees up or the active
    /// table has already been replaced.
    pub(crate) fn grow(&self, observed: Shared<'_, Table<K, V>>, guard: &Guard) {
        let mut backoff = Backoff::new();
        while !self.try_start_migration() {
            if self.active.load(Ordering::SeqCst, guard) != observed {
                return;
            }
            backoff.wait();
        }

        if self.active.load(Ordering::SeqCst, guard) != observed {
            // Replaced while we raced for the flag; nothing left to do.
            self.end_migration();
            return;
        }

        // SAFETY: `observed` is still the published active table and the
        // guard protects it.
        let old = unsafe { observed.deref() };
        let live = old.held_keys.load(Ordering::Relaxed).max(0) as usize;
        let target = old.capacity().max(live);
        let new_capacity = ((target as f64) * self.growth_factor).ceil() as usize;
        let new_capacity = new_capacity.max(old.capacity() + 1);
        let budget =
            ((new_capacity as f64 * self.max_load_factor) as usize).clamp(1, new_capacity);

        // Keep the retired chain within its bound before adding to it.
        while self.old_count.load(Ordering::Relaxed) >= self.old_chain_capacity {
            if !self.drain_oldest(guard) {
                break;
            }
        }

        // Enqueue the saturated table as the youngest decaying node FIRST,
        // still unsealed. A fallback read therefore always finds the table
        // either through the active pointer or through the chain; there is
        // no window where it is reachable through neither.
        let node = Box::into_raw(Box::new(DecayingTable::<K, V>::new(observed.as_raw())));
        // SAFETY: `node` is unshared until the store below publishes it.
        unsafe {
            (*node)
                .next
                .store(self.old_head.load(Ordering::Acquire, guard), Ordering::Relaxed);
        }
        self.old_head
            .store(unsafe { Shared::from_raw(node) }, Ordering::Release);
        self.old_count.fetch_add(1, Ordering::Relaxed);

        let fresh = Box::into_raw(Box::new(Table::<K, V>::with_geometry(new_capacity, budget)));
        // From this store on, every new operation lands in the fresh table.
        // SAFETY: freshly allocated, unshared pointer.
        self.active
            .store(unsafe { Shared::from_raw(fresh) }, Ordering::SeqCst);

        // Writers that loaded the old pointer before the swap may still be
        // publishing into it; transfer must not start under them.
        old.quiesce_writers();

        // SAFETY: the node was just published and the guard protects it.
        let node = unsafe { &*node };
        // Quiesced and unpublished: the held-key count only falls from here,
        // so emptiness may be cached.
        node.seal();

        // Move an initial batch so small maps converge immediately; the
        // remainder drains opportunistically and through fallback reads.
        let active = unsafe { self.active.load(Ordering::Acquire, guard).deref() };
        let _ = self.drain_batch(node, active, INITIAL_TRANSFER);
        self.sweep_chain(guard);

        self.end_migration();
    }

    /// Insert-piggybacked incremental drain. Skips when another migration
    /// holds the flag.
    pub(crate) fn try_opportunistic_drain(&self, guard: &Guard) {
        if self.old_count.load(Ordering::Relaxed) == 0 {
            return;
        }
        if !self.try_start_migration() {
            return;
        }

        if let Some(oldest) = self.oldest_live_node(guard) {
            // SAFETY: flag held; the active table cannot be retired under us.
            let active = unsafe { self.active.load(Ordering::Acquire, guard).deref() };
            let _ = self.drain_batch(oldest, active, OPPORTUNISTIC_BATCH);
        }
        self.sweep_chain(guard);

        self.end_migration();
    }

    /// Read-side rehydration: after a fallback read found `key` in `node`,
    /// try to move it into the active table. Skips when another migration
    /// holds the flag; reads stay wait-free.
    pub(crate) fn try_rehydrate(
        &self,
        node: &DecayingTable<K, V>,
        hash: u64,
        key: u64,
        guard: &Guard,
    ) {
        if !self.try_start_migration() {
            return;
        }

        let absent = V::absent().into_word();
        if let Some(cell) = node.table().find_cell_slow(hash, key) {
            let value = cell.value(Ordering::Acquire);
            if value != absent {
                // SAFETY: flag held, guard-protected active table.
                let active = unsafe { self.active.load(Ordering::Acquire, guard).deref() };
                if !matches!(self.promote(active, node, cell, key, value), Promote::TargetFull) {
                    cell.reset_key(K::empty().into_word());
                }
            }
        }
        self.sweep_chain(guard);

        self.end_migration();
    }

    /// Fully drains the oldest live decaying table. Returns false when there
    /// was nothing to drain or the active table filled up.
    ///
    /// Must hold the migration flag.
    fn drain_oldest(&self, guard: &Guard) -> bool {
        let Some(oldest) = self.oldest_live_node(guard) else {
            self.sweep_chain(guard);
            return false;
        };
        // SAFETY: flag held.
        let active = unsafe { self.active.load(Ordering::Acquire, guard).deref() };
        let status = self.drain_from(oldest, active);
        self.sweep_chain(guard);
        status == DrainStatus::Drained
    }

    /// Walks the chain and returns the oldest node still holding entries.
    fn oldest_live_node<'g>(&self, guard: &'g Guard) -> Option<&'g DecayingTable<K, V>> {
        let mut oldest = None;
        let mut current = self.old_head.load(Ordering::Acquire, guard);
        while !current.is_null() {
            // SAFETY: guard-protected chain traversal.
            let node = unsafe { current.deref() };
            if !node.is_empty() {
                oldest = Some(node);
            }
            current = node.next.load(Ordering::Acquire, guard);
        }
        oldest
    }

    /// Drains `source` into `active` until it is exhausted.
    fn drain_from(&self, source: &DecayingTable<K, V>, active: &Table<K, V>) -> DrainStatus {
        self.drain_batch(source, active, usize::MAX)
    }

    /// Moves up to `budget` live entries from `source` into `active`.
    ///
    /// Returns [`DrainStatus::Drained`] when the source has no more
    /// transferable entries and [`DrainStatus::BudgetExhausted`] when the
    /// budget ran out first.
    ///
    /// Must hold the migration flag: the drain cursor has a single writer.
    fn drain_batch(
        &self,
        source: &DecayingTable<K, V>,
        active: &Table<K, V>,
        budget: usize,
    ) -> DrainStatus {
        let src = source.table();
        let empty = K::empty().into_word();
        let absent = V::absent().into_word();
        let mut moved = 0;

        loop {
            let index = source.drain_cursor.load(Ordering::Relaxed);
            if index >= src.capacity() {
                return DrainStatus::Drained;
            }
            if moved >= budget {
                return DrainStatus::BudgetExhausted;
            }
            source.drain_cursor.store(index + 1, Ordering::Relaxed);

            let cell = src.cell(index);
            let key = cell.key();
            if key == empty {
                continue;
            }
            let value = cell.value(Ordering::Acquire);
            if value == absent {
                // Tombstone: nothing to move, drain the key eagerly.
                cell.reset_key(empty);
                continue;
            }

            match self.promote(active, source, cell, key, value) {
                Promote::Moved | Promote::Superseded | Promote::Healed => {
                    cell.reset_key(empty);
                    moved += 1;
                }
                Promote::TargetFull => {
                    // Rewind so the entry is revisited after growth.
                    source.drain_cursor.store(index, Ordering::Relaxed);
                    return DrainStatus::TargetFull;
                }
            }
        }
    }

    /// Moves one entry into the active table, copy first, drain second.
    ///
    /// The value CAS into the target only fills an absent slot, so a later
    /// user insert is never undone. The source drain afterwards detects a
    /// remove that raced the copy (the source is already absent) and heals
    /// by withdrawing the copied value again.
    fn promote(
        &self,
        active: &Table<K, V>,
        source: &DecayingTable<K, V>,
        source_cell: &Cell,
        key: u64,
        value: u64,
    ) -> Promote {
        let absent = V::absent().into_word();
        let hash = self.hash_word(key);

        let target = match active.claim_cell_for(hash, key) {
            Claim::Existing(cell) => cell,
            Claim::Fresh { cell, .. } => cell,
            Claim::Exhausted => return Promote::TargetFull,
        };

        match target.publish_if_absent(absent, value) {
            Ok(()) => {
                active.held_keys.fetch_add(1, Ordering::Relaxed);
                let previous = source_cell.take(absent);
                if previous == absent {
                    // A remove won the source; take the copy back out unless
                    // an even newer insert already replaced it.
                    if target.withdraw(value, absent) {
                        active.held_keys.fetch_sub(1, Ordering::Relaxed);
                    }
                    Promote::Healed
                } else {
                    source.table().held_keys.fetch_sub(1, Ordering::Relaxed);
                    Promote::Moved
                }
            }
            Err(_) => {
                // A later insert owns the target; the source copy is stale.
                let previous = source_cell.take(absent);
                if previous != absent {
                    source.table().held_keys.fetch_sub(1, Ordering::Relaxed);
                }
                Promote::Superseded
            }
        }
    }

    /// Unlinks fully drained nodes and hands them to deferred reclamation.
    ///
    /// Must hold the migration flag: the chain has a single mutator, readers
    /// traverse concurrently under guards and may keep following the `next`
    /// link of an unlinked node until it is reclaimed.
    pub(crate) fn sweep_chain(&self, guard: &Guard) {
        let mut link = &self.old_head;
        let mut current = link.load(Ordering::Acquire, guard);

        while !current.is_null() {
            // SAFETY: guard-protected; unlinked nodes stay alive until the
            // epoch advances past every reader.
            let node = unsafe { current.deref() };
            let next = node.next.load(Ordering::Acquire, guard);

            if node.is_empty() {
                link.store(next, Ordering::Release);
                self.old_count.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: unlinked by the single chain mutator, retired once.
                unsafe { petek::retire(current.as_raw()) };
            } else {
                link = &node.next;
            }
            current = next;
        }
    }
}
