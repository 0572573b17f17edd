//! One table slot: an atomic key word and an atomic value word.
//!
//! Ordering contract: key loads are relaxed and the key claim CAS is relaxed
//! (key words carry no payload of their own); value publication is a release
//! so that a reader which observes the value with an acquire load also
//! observes every write that preceded the publication.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Cell {
    key: AtomicU64,
    value: AtomicU64,
}

impl Cell {
    pub(crate) fn new(empty_key: u64, absent_value: u64) -> Self {
        Self {
            key: AtomicU64::new(empty_key),
            value: AtomicU64::new(absent_value),
        }
    }

    /// Current key word.
    #[inline]
    pub(crate) fn key(&self) -> u64 {
        self.key.load(Ordering::Relaxed)
    }

    /// One-shot claim of an empty cell for `key`. On failure returns the key
    /// word observed instead, which the probe loop re-examines.
    #[inline]
    pub(crate) fn try_claim(&self, empty_key: u64, key: u64) -> Result<(), u64> {
        match self
            .key
            .compare_exchange(empty_key, key, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => Ok(()),
            Err(observed) => Err(observed),
        }
    }

    /// Un-claims the key. Only legal in a decaying table, where the drain
    /// protocol owns the cell; active tables never reset keys.
    #[inline]
    pub(crate) fn reset_key(&self, empty_key: u64) {
        self.key.store(empty_key, Ordering::Relaxed);
    }

    /// Current value word.
    #[inline]
    pub(crate) fn value(&self, order: Ordering) -> u64 {
        self.value.load(order)
    }

    /// Publishes a value, returning the previous word. Release on the store
    /// side; the returned load is what insert uses to detect first-time
    /// publication.
    #[inline]
    pub(crate) fn publish(&self, value: u64) -> u64 {
        self.value.swap(value, Ordering::AcqRel)
    }

    /// Tombstones the cell, returning the previous value word.
    #[inline]
    pub(crate) fn take(&self, absent_value: u64) -> u64 {
        self.value.swap(absent_value, Ordering::AcqRel)
    }

    /// Publishes `value` only into an absent slot. Used by migration so a
    /// later user write is never undone.
    #[inline]
    pub(crate) fn publish_if_absent(&self, absent_value: u64, value: u64) -> Result<(), u64> {
        match self.value.compare_exchange(
            absent_value,
            value,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(observed) => Err(observed),
        }
    }

    /// Takes back a previously published `value` unless something newer has
    /// already overwritten it. Used to heal a transfer that raced a remove.
    #[inline]
    pub(crate) fn withdraw(&self, value: u64, absent_value: u64) -> bool {
        self.value
            .compare_exchange(value, absent_value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
