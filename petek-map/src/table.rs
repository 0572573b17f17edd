//! Fixed-capacity open-addressed table with atomic cell reservation.
//!
//! A table never resizes; growth replaces the whole table (see `migrate`).
//! Keys are claimed with a compare-and-swap on the cell's key word and are
//! never un-claimed while the table is active, which is what makes the
//! empty-cell stop in [`Table::find_cell_for`] sound: a concurrent claim for
//! the probed key would have taken an earlier cell of the same probe
//! sequence.

use crate::cell::Cell;
use crate::traits::{Key, Value};
use crate::util::{Backoff, Isolated};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::error::Error;
use std::fmt;

/// Table construction failures, reported synchronously by [`Table::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableError {
    /// A table must hold at least one cell.
    ZeroCapacity,
    /// The initial free budget cannot exceed the cell count.
    FreeBudgetExceedsCapacity { capacity: usize, free_cells: usize },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::ZeroCapacity => write!(f, "table capacity must be non-zero"),
            TableError::FreeBudgetExceedsCapacity {
                capacity,
                free_cells,
            } => {
                write!(
                    f,
                    "free budget {} exceeds table capacity {}",
                    free_cells, capacity
                )
            }
        }
    }
}

impl Error for TableError {}

/// Outcome of a cell claim.
pub(crate) enum Claim<'t> {
    /// The key already owned a cell (live or tombstoned).
    Existing(&'t Cell),
    /// A previously empty cell was claimed; `budget_left` is the free-cell
    /// budget remaining after this claim.
    Fresh {
        cell: &'t Cell,
        budget_left: isize,
    },
    /// The probe visited every cell without finding the key or an empty
    /// cell; the table is full for this key.
    Exhausted,
}

/// Decrements the table's `active_writers` count when dropped.
///
/// Bind it to a named local for the whole critical region:
/// `let _writer = table.register_writer();`. A bare `let _ = …` drops the
/// guard immediately and leaves the write unprotected against migration
/// quiescence.
pub(crate) struct WriterGuard<'t> {
    writers: &'t AtomicUsize,
}

impl Drop for WriterGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.writers.fetch_sub(1, Ordering::Release);
    }
}

pub(crate) struct Table<K, V> {
    cells: Box<[Cell]>,
    capacity: usize,
    /// Remaining first-time key claims before migration must trigger.
    /// Decremented on every fresh claim, never incremented; may transiently
    /// run negative under concurrent claims.
    pub(crate) free_cells: Isolated<AtomicIsize>,
    /// Advisory count of cells holding a live value.
    pub(crate) held_keys: Isolated<AtomicIsize>,
    /// Writers currently inside a mutating operation against this table.
    active_writers: Isolated<AtomicUsize>,
    _marker: PhantomData<(K, V)>,
}

impl<K: Key, V: Value> Table<K, V> {
    pub(crate) fn new(capacity: usize, free_cells: usize) -> Result<Self, TableError> {
        if capacity == 0 {
            return Err(TableError::ZeroCapacity);
        }
        if free_cells > capacity {
            return Err(TableError::FreeBudgetExceedsCapacity {
                capacity,
                free_cells,
            });
        }
        Ok(Self::with_geometry(capacity, free_cells))
    }

    /// Builds a table from pre-validated geometry.
    pub(crate) fn with_geometry(capacity: usize, free_cells: usize) -> Self {
        debug_assert!(capacity > 0 && free_cells <= capacity);
        let empty = K::empty().into_word();
        let absent = V::absent().into_word();
        let cells = (0..capacity).map(|_| Cell::new(empty, absent)).collect();

        Self {
            cells,
            capacity,
            free_cells: Isolated::new(AtomicIsize::new(free_cells as isize)),
            held_keys: Isolated::new(AtomicIsize::new(0)),
            active_writers: Isolated::new(AtomicUsize::new(0)),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn cell(&self, index: usize) -> &Cell {
        &self.cells[index]
    }

    /// Claims or finds the cell owning `key`, linear-probing from
    /// `hash mod capacity`.
    ///
    /// A lost claim CAS is re-examined: another thread may have claimed the
    /// very same key, in which case that cell is the owner.
    pub(crate) fn claim_cell_for(&self, hash: u64, key: u64) -> Claim<'_> {
        let empty = K::empty().into_word();
        let mut index = (hash as usize) % self.capacity;
        let mut remaining = self.capacity;

        while remaining > 0 {
            let cell = &self.cells[index];
            let observed = cell.key();

            if observed == key {
                return Claim::Existing(cell);
            }
            if observed == empty {
                match cell.try_claim(empty, key) {
                    Ok(()) => {
                        let budget_left = self.free_cells.fetch_sub(1, Ordering::Relaxed) - 1;
                        return Claim::Fresh { cell, budget_left };
                    }
                    Err(now) if now == key => return Claim::Existing(cell),
                    Err(_) => {}
                }
            }

            index += 1;
            if index == self.capacity {
                index = 0;
            }
            remaining -= 1;
        }

        Claim::Exhausted
    }

    /// Finds the cell owning `key` without writing.
    ///
    /// Stops at the first empty cell: the key cannot live beyond it, because
    /// claimers probe in the same order and keys are never un-claimed in an
    /// active table.
    pub(crate) fn find_cell_for(&self, hash: u64, key: u64) -> Option<&Cell> {
        let empty = K::empty().into_word();
        let mut index = (hash as usize) % self.capacity;
        let mut remaining = self.capacity;

        while remaining > 0 {
            let cell = &self.cells[index];
            let observed = cell.key();

            if observed == key {
                return Some(cell);
            }
            if observed == empty {
                return None;
            }

            index += 1;
            if index == self.capacity {
                index = 0;
            }
            remaining -= 1;
        }

        None
    }

    /// Finds the cell owning `key`, scanning the full probe window.
    ///
    /// Decaying tables un-claim keys as they drain, so an empty cell there
    /// proves nothing; this variant never stops early.
    pub(crate) fn find_cell_slow(&self, hash: u64, key: u64) -> Option<&Cell> {
        let mut index = (hash as usize) % self.capacity;
        let mut remaining = self.capacity;

        while remaining > 0 {
            let cell = &self.cells[index];
            if cell.key() == key {
                return Some(cell);
            }

            index += 1;
            if index == self.capacity {
                index = 0;
            }
            remaining -= 1;
        }

        None
    }

    /// Registers the caller as an in-flight writer.
    ///
    /// The increment is sequentially consistent and the caller re-loads the
    /// active-table pointer afterwards; paired with the migrator's
    /// publish-then-quiesce order, either the writer sees the replacement
    /// table and backs off, or the migrator sees the writer and waits.
    #[inline]
    pub(crate) fn register_writer(&self) -> WriterGuard<'_> {
        self.active_writers.fetch_add(1, Ordering::SeqCst);
        WriterGuard {
            writers: &self.active_writers,
        }
    }

    /// Spins until no writer is inside this table. Bounded by the longest
    /// in-flight operation.
    pub(crate) fn quiesce_writers(&self) {
        let mut backoff = Backoff::new();
        while self.active_writers.load(Ordering::SeqCst) != 0 {
            backoff.wait();
        }
    }
}
