//! Global epoch registry: participant slots, the epoch counter, and the
//! orphaned-garbage list.
//!
//! The registry is a fixed array of slots rather than a dynamic list of
//! per-thread records. A thread claims one slot the first time it pins and
//! keeps it until the thread exits; the epoch can only advance when every
//! claimed slot that is inside a critical section has observed the current
//! epoch. Garbage retired in epoch `e` is destroyed once the global epoch
//! reaches `e + 2`: by then every critical section that could have loaded
//! the pointer has ended.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Maximum number of threads that may participate at the same time.
/// A slot is recycled when its owning thread exits.
pub(crate) const MAX_SLOTS: usize = 256;

/// Epochs a retired object must age before destruction.
pub(crate) const GRACE: u64 = 2;

const ACTIVE: u64 = 1;

/// One participant slot. `state` packs the last observed epoch in the upper
/// bits and an in-critical-section bit in bit 0.
pub(crate) struct Slot {
    state: AtomicU64,
    claimed: AtomicBool,
}

impl Slot {
    const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            claimed: AtomicBool::new(false),
        }
    }

    /// Announce entry into a critical section at `epoch`.
    ///
    /// The store is relaxed; `pin` issues the sequentially consistent fence
    /// that orders it against the retirement scan.
    #[inline]
    pub(crate) fn activate(&self, epoch: u64) {
        self.state.store((epoch << 1) | ACTIVE, Ordering::Relaxed);
    }

    /// Announce that the critical section has ended.
    #[inline]
    pub(crate) fn deactivate(&self) {
        self.state.store(0, Ordering::Release);
    }
}

/// A deferred destruction request: a type-erased pointer, its destructor,
/// and the epoch it was retired in.
pub(crate) struct Garbage {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
    epoch: u64,
}

// SAFETY: the pointee is inaccessible to its previous owners once retired;
// the garbage record is just a pointer plus a function pointer.
unsafe impl Send for Garbage {}

unsafe fn drop_box<T>(ptr: *mut ()) {
    // SAFETY: `ptr` originated from `Box::into_raw` of a `T` (retire's
    // contract) and is destroyed exactly once.
    unsafe { drop(Box::from_raw(ptr as *mut T)) }
}

impl Garbage {
    pub(crate) fn new<T: 'static>(ptr: *mut T, epoch: u64) -> Self {
        Self {
            ptr: ptr as *mut (),
            drop_fn: drop_box::<T>,
            epoch,
        }
    }

    /// Old enough to destroy at `epoch`?
    #[inline]
    pub(crate) fn ripe(&self, epoch: u64) -> bool {
        self.epoch + GRACE <= epoch
    }

    /// Run the deferred destructor.
    ///
    /// # Safety
    ///
    /// No thread may still hold a reference into the pointee; callers ensure
    /// this by only releasing ripe garbage.
    pub(crate) unsafe fn release(self) {
        unsafe { (self.drop_fn)(self.ptr) }
    }
}

pub(crate) struct Registry {
    epoch: AtomicU64,
    slots: [Slot; MAX_SLOTS],
    /// Garbage abandoned by exited threads, destroyed by whichever thread
    /// collects next. Never touched on the operation fast path.
    orphans: Mutex<Vec<Garbage>>,
}

pub(crate) static REGISTRY: Registry = Registry::new();

impl Registry {
    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            slots: [const { Slot::new() }; MAX_SLOTS],
            orphans: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// Claim a free slot for the calling thread.
    pub(crate) fn claim_slot(&self) -> usize {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return index;
            }
        }
        panic!("petek: more than {MAX_SLOTS} threads participating in reclamation");
    }

    /// Return a slot to the free pool on thread exit.
    pub(crate) fn release_slot(&self, index: usize) {
        self.slots[index].deactivate();
        self.slots[index].claimed.store(false, Ordering::Release);
    }

    /// Try to move the global epoch forward by one.
    ///
    /// Succeeds only when every claimed slot that is inside a critical
    /// section has observed the current epoch; a lagging pinned thread
    /// blocks the advance, which is what keeps its loaded pointers alive.
    /// Returns the epoch observed after the attempt.
    pub(crate) fn try_advance(&self) -> u64 {
        let epoch = self.epoch.load(Ordering::Relaxed);
        fence(Ordering::SeqCst);
        for slot in &self.slots {
            if !slot.claimed.load(Ordering::Acquire) {
                continue;
            }
            let state = slot.state.load(Ordering::Relaxed);
            if state & ACTIVE == ACTIVE && state >> 1 != epoch {
                return epoch;
            }
        }
        match self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => epoch + 1,
            Err(current) => current,
        }
    }

    /// Park garbage from an exiting thread.
    pub(crate) fn adopt(&self, garbage: Vec<Garbage>) {
        if let Ok(mut orphans) = self.orphans.lock() {
            orphans.extend(garbage);
        }
    }

    /// Destroy ripe orphaned garbage. Skips entirely when another thread
    /// holds the orphan lock.
    pub(crate) fn reap_orphans(&self, epoch: u64) {
        let Ok(mut orphans) = self.orphans.try_lock() else {
            return;
        };
        let mut index = 0;
        while index < orphans.len() {
            if orphans[index].ripe(epoch) {
                let garbage = orphans.swap_remove(index);
                // SAFETY: ripe garbage has aged past every critical section
                // that could reference it.
                unsafe { garbage.release() };
            } else {
                index += 1;
            }
        }
    }
}
