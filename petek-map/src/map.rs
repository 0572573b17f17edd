//! The public map facade.

use crate::decay::DecayingTable;
use crate::table::{Claim, Table};
use crate::traits::{Key, Value};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use foldhash::fast::FixedState;
use petek::{pin, Atomic};
use std::error::Error;
use std::fmt;
use std::hash::BuildHasher;

/// Map construction parameters.
///
/// The defaults match a general-purpose map: half-full tables before growth,
/// four-fold growth per migration, and a generous bound on concurrently
/// retired tables.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Cell count of the first table. Must be non-zero.
    pub initial_capacity: usize,
    /// Fraction of a table that may hold keys before growth triggers.
    /// Must lie in `(0, 1]`.
    pub max_load_factor: f64,
    /// Capacity multiplier applied at each migration. Must exceed 1.
    pub growth_factor: f64,
    /// Bound on retired tables awaiting drain. Must be non-zero; when the
    /// chain is full the migrator drains the oldest table before retiring
    /// another.
    pub old_tables_chain_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            initial_capacity: 64,
            max_load_factor: 0.5,
            growth_factor: 4.0,
            old_tables_chain_capacity: 100,
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<(), MapError> {
        if self.initial_capacity == 0 {
            return Err(MapError::InvalidCapacity(self.initial_capacity));
        }
        if !(self.max_load_factor > 0.0 && self.max_load_factor <= 1.0) {
            return Err(MapError::InvalidLoadFactor(self.max_load_factor));
        }
        if !(self.growth_factor > 1.0) {
            return Err(MapError::InvalidGrowthFactor(self.growth_factor));
        }
        if self.old_tables_chain_capacity == 0 {
            return Err(MapError::InvalidChainCapacity(
                self.old_tables_chain_capacity,
            ));
        }
        Ok(())
    }
}

/// Invalid [`Options`], reported synchronously at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MapError {
    /// `initial_capacity` was zero.
    InvalidCapacity(usize),
    /// `max_load_factor` was outside `(0, 1]`.
    InvalidLoadFactor(f64),
    /// `growth_factor` was not greater than 1.
    InvalidGrowthFactor(f64),
    /// `old_tables_chain_capacity` was zero.
    InvalidChainCapacity(usize),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::InvalidCapacity(capacity) => {
                write!(f, "initial capacity must be non-zero, got {}", capacity)
            }
            MapError::InvalidLoadFactor(factor) => {
                write!(f, "max load factor must lie in (0, 1], got {}", factor)
            }
            MapError::InvalidGrowthFactor(factor) => {
                write!(f, "growth factor must exceed 1, got {}", factor)
            }
            MapError::InvalidChainCapacity(capacity) => {
                write!(f, "old-tables chain capacity must be non-zero, got {}", capacity)
            }
        }
    }
}

impl Error for MapError {}

/// A concurrent, lock-free, open-addressed hash map with online resizing.
///
/// Insert, lookup and remove take `&self` and may be called from any number
/// of threads; no operation blocks on a mutex. When the active table
/// saturates, a larger table is published and live entries migrate over
/// while readers and writers keep running.
///
/// Keys and values are single-word scalars; the [`Key::empty`] key and the
/// [`Value::absent`] value are reserved by the map and must never be
/// inserted. Operations return [`Value::absent`] where a `HashMap` would
/// return `None`.
///
/// # Examples
///
/// ```
/// use petek_map::FlatMap;
///
/// let map: FlatMap<u64, u64> = FlatMap::with_capacity(64);
/// assert_eq!(map.insert(1, 10), 10);
/// assert_eq!(map.get(1), 10);
/// assert_eq!(map.remove(1), 10);
/// assert_eq!(map.get(1), 0);
/// ```
pub struct FlatMap<K, V, S = FixedState> {
    /// The table receiving new inserts.
    pub(crate) active: Atomic<Table<K, V>>,
    /// Youngest-to-oldest chain of retired tables still draining.
    pub(crate) old_head: Atomic<DecayingTable<K, V>>,
    pub(crate) old_count: AtomicUsize,
    /// Single-winner migration flag; the holder is the only chain mutator.
    pub(crate) migrating: AtomicBool,
    pub(crate) hasher: S,
    pub(crate) max_load_factor: f64,
    pub(crate) growth_factor: f64,
    pub(crate) old_chain_capacity: usize,
}

impl<K: Key, V: Value> FlatMap<K, V, FixedState> {
    /// Creates a map with the default [`Options`].
    pub fn new() -> Self {
        Self::with_capacity(Options::default().initial_capacity)
    }

    /// Creates a map with the given starting capacity (clamped to at least
    /// one cell) and default tuning.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, FixedState::default())
    }
}

impl<K: Key, V: Value, S: BuildHasher> FlatMap<K, V, S> {
    /// Creates a map using `hasher` for key hashing.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(Options::default().initial_capacity, hasher)
    }

    /// Creates a map with the given starting capacity (clamped to at least
    /// one cell) and hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        let options = Options {
            initial_capacity: capacity.max(1),
            ..Options::default()
        };
        Self::build(options, hasher)
    }

    /// Creates a map from validated [`Options`].
    pub fn with_options(options: Options) -> Result<Self, MapError>
    where
        S: Default,
    {
        Self::with_options_and_hasher(options, S::default())
    }

    /// Creates a map from validated [`Options`] and a hasher.
    pub fn with_options_and_hasher(options: Options, hasher: S) -> Result<Self, MapError> {
        options.validate()?;
        Ok(Self::build(options, hasher))
    }

    fn build(options: Options, hasher: S) -> Self {
        let capacity = options.initial_capacity;
        let budget = ((capacity as f64 * options.max_load_factor) as usize).clamp(1, capacity);
        let table = match Table::<K, V>::new(capacity, budget) {
            Ok(table) => Box::into_raw(Box::new(table)),
            // validate() and the clamp above guarantee the geometry.
            Err(error) => unreachable!("table geometry rejected: {error}"),
        };

        Self {
            active: Atomic::new(table),
            old_head: Atomic::null(),
            old_count: AtomicUsize::new(0),
            migrating: AtomicBool::new(false),
            hasher,
            max_load_factor: options.max_load_factor,
            growth_factor: options.growth_factor,
            old_chain_capacity: options.old_tables_chain_capacity,
        }
    }

    #[inline]
    pub(crate) fn hash_key(&self, key: K) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    pub(crate) fn hash_word(&self, word: u64) -> u64 {
        self.hasher.hash_one(K::from_word(word))
    }

    /// Inserts or updates `key`, returning `value` on success and
    /// [`Value::absent`] only if the map could not place the key at all.
    ///
    /// A first-time insertion that exhausts the free-cell budget, or a probe
    /// that finds the table full, triggers a migration to a larger table.
    pub fn insert(&self, key: K, value: V) -> V {
        let k = key.into_word();
        let v = value.into_word();
        let absent = V::absent().into_word();
        debug_assert_ne!(
            k,
            K::empty().into_word(),
            "the reserved empty key cannot be inserted"
        );
        debug_assert_ne!(v, absent, "the reserved absent value cannot be stored");

        let hash = self.hash_key(key);
        let guard = pin();

        loop {
            let observed = self.active.load(Ordering::Acquire, &guard);
            // SAFETY: the active table is freed only through deferred
            // reclamation; the guard keeps it alive.
            let table = unsafe { observed.deref() };

            let _writer = table.register_writer();
            if self.active.load(Ordering::SeqCst, &guard) != observed {
                // Retired between the load and the registration; the guard
                // drops here and the migrator stops waiting on us.
                continue;
            }

            match table.claim_cell_for(hash, k) {
                Claim::Existing(cell) => {
                    if cell.publish(v) == absent {
                        table.held_keys.fetch_add(1, Ordering::Relaxed);
                    }
                    drop(_writer);
                    self.try_opportunistic_drain(&guard);
                    return value;
                }
                Claim::Fresh { cell, budget_left } => {
                    if cell.publish(v) == absent {
                        table.held_keys.fetch_add(1, Ordering::Relaxed);
                    }
                    drop(_writer);
                    if budget_left <= 0 {
                        self.grow(observed, &guard);
                    } else {
                        self.try_opportunistic_drain(&guard);
                    }
                    return value;
                }
                Claim::Exhausted => {
                    // Full for this key; escape through growth and retry on
                    // the replacement table.
                    drop(_writer);
                    self.grow(observed, &guard);
                }
            }
        }
    }

    /// Looks up `key`, returning its value or [`Value::absent`].
    ///
    /// Misses in the active table fall back to the retiring-table chain,
    /// youngest first; a hit there re-inserts the entry into the active
    /// table so the working set converges under read load.
    pub fn get(&self, key: K) -> V {
        let k = key.into_word();
        let absent = V::absent().into_word();
        let hash = self.hash_key(key);
        let guard = pin();

        loop {
            let observed = self.active.load(Ordering::Acquire, &guard);
            // SAFETY: guard-protected, as in insert.
            let table = unsafe { observed.deref() };

            if let Some(cell) = table.find_cell_for(hash, k) {
                let value = cell.value(Ordering::Acquire);
                if value != absent {
                    return V::from_word(value);
                }
            }

            let head = self.old_head.load(Ordering::Acquire, &guard);
            if head.is_null() {
                if self.active.load(Ordering::Acquire, &guard) == observed {
                    return V::absent();
                }
                continue;
            }

            let mut current = head;
            while !current.is_null() {
                // SAFETY: chain nodes are retired through `petek` after
                // unlinking; the guard keeps them alive during traversal.
                let node = unsafe { current.deref() };
                let found = node.get(hash, k);
                if found != absent {
                    self.try_rehydrate(node, hash, k, &guard);
                    return V::from_word(found);
                }
                current = node.next.load(Ordering::Acquire, &guard);
            }

            // A promotion may have moved the entry into the active table
            // between the two probes; look once more.
            if let Some(cell) = table.find_cell_for(hash, k) {
                let value = cell.value(Ordering::Acquire);
                if value != absent {
                    return V::from_word(value);
                }
            }

            if self.active.load(Ordering::Acquire, &guard) == observed {
                return V::absent();
            }
            // The active table was replaced mid-lookup; run it again.
        }
    }

    /// Removes `key`, returning the removed value or [`Value::absent`].
    pub fn remove(&self, key: K) -> V {
        let k = key.into_word();
        let absent = V::absent().into_word();
        let hash = self.hash_key(key);
        let guard = pin();

        loop {
            let observed = self.active.load(Ordering::Acquire, &guard);
            // SAFETY: guard-protected, as in insert.
            let table = unsafe { observed.deref() };

            let mut taken = absent;
            {
                let _writer = table.register_writer();
                if self.active.load(Ordering::SeqCst, &guard) != observed {
                    continue;
                }
                if let Some(cell) = table.find_cell_for(hash, k) {
                    let previous = cell.take(absent);
                    if previous != absent {
                        table.held_keys.fetch_sub(1, Ordering::Relaxed);
                        taken = previous;
                    }
                }
            }

            // Sweep every copy out of the retiring chain so a superseded
            // entry can never resurface through a later fallback read.
            let mut current = self.old_head.load(Ordering::Acquire, &guard);
            let chain_was_empty = current.is_null();
            while !current.is_null() {
                // SAFETY: guard-protected chain traversal, as in get.
                let node = unsafe { current.deref() };
                let previous = node.remove(hash, k);
                if previous != absent && taken == absent {
                    taken = previous;
                }
                current = node.next.load(Ordering::Acquire, &guard);
            }

            if taken == absent && !chain_was_empty {
                // A promotion may have carried the entry into the active
                // table while we swept the chain.
                let _writer = table.register_writer();
                if self.active.load(Ordering::SeqCst, &guard) == observed {
                    if let Some(cell) = table.find_cell_for(hash, k) {
                        let previous = cell.take(absent);
                        if previous != absent {
                            table.held_keys.fetch_sub(1, Ordering::Relaxed);
                            taken = previous;
                        }
                    }
                }
            }

            if taken != absent || self.active.load(Ordering::Acquire, &guard) == observed {
                return V::from_word(taken);
            }
            // Nothing found but the active table changed under us; retry.
        }
    }

    /// Whether `key` currently maps to a live value.
    pub fn contains_key(&self, key: K) -> bool {
        self.get(key) != V::absent()
    }

    /// Advisory count of live entries. Maintained with relaxed counters;
    /// exact only at quiescent points.
    pub fn len(&self) -> usize {
        let guard = pin();
        // SAFETY: guard-protected table and chain access.
        let table = unsafe { self.active.load(Ordering::Acquire, &guard).deref() };
        let mut total = table.held_keys.load(Ordering::Relaxed).max(0);

        let mut current = self.old_head.load(Ordering::Acquire, &guard);
        while !current.is_null() {
            let node = unsafe { current.deref() };
            total += node.table().held_keys.load(Ordering::Relaxed).max(0);
            current = node.next.load(Ordering::Acquire, &guard);
        }
        total as usize
    }

    /// Whether the map holds no live entries (advisory, like [`len`](Self::len)).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell count of the active table.
    pub fn capacity(&self) -> usize {
        let guard = pin();
        // SAFETY: guard-protected.
        unsafe { self.active.load(Ordering::Acquire, &guard).deref() }.capacity()
    }
}

impl<K: Key, V: Value> Default for FlatMap<K, V, FixedState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Drop for FlatMap<K, V, S> {
    fn drop(&mut self) {
        let guard = pin();
        let active = self.active.load(Ordering::Acquire, &guard).as_raw();
        // SAFETY: `&mut self` proves no concurrent user remains; tables and
        // chain nodes not yet handed to the reclaimer are freed directly.
        unsafe { drop(Box::from_raw(active)) };

        let mut current = self.old_head.load(Ordering::Acquire, &guard).as_raw();
        while !current.is_null() {
            // SAFETY: exclusive access, as above.
            let next = unsafe { (*current).next.load(Ordering::Acquire, &guard).as_raw() };
            unsafe { drop(Box::from_raw(current)) };
            current = next;
        }
        drop(guard);

        // Drain whatever this thread retired during migrations.
        petek::flush();
    }
}
