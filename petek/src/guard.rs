//! Guard and thread-local handle for critical section management.

use crate::epoch::{Garbage, GRACE, REGISTRY};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{fence, Ordering};

/// Attempt an epoch advance and a collection every this many retires.
const COLLECT_EVERY: usize = 64;

/// RAII guard representing an active critical section.
///
/// While a Guard exists, the thread's slot is marked active, which blocks the
/// global epoch from advancing past it; any `Shared<'g, T>` loaded during the
/// critical section stays valid until the guard is dropped.
///
/// Nested `pin()` calls are cheap: only the outermost call touches the slot,
/// inner guards share its protection.
pub struct Guard {
    _private: (),
    // Guards are tied to the pinning thread's slot.
    _marker: PhantomData<*mut ()>,
}

impl Drop for Guard {
    #[inline]
    fn drop(&mut self) {
        // try_with: during process teardown TLS may already be gone, and
        // panicking in a destructor aborts.
        let _ = HANDLE.try_with(|handle| handle.unpin());
    }
}

/// Thread-local participant state: claimed slot, pin depth, and the list of
/// garbage this thread has retired but not yet destroyed.
struct Handle {
    slot: Cell<Option<usize>>,
    depth: Cell<usize>,
    garbage: RefCell<Vec<Garbage>>,
    retired: Cell<usize>,
}

impl Handle {
    const fn new() -> Self {
        Self {
            slot: Cell::new(None),
            depth: Cell::new(0),
            garbage: RefCell::new(Vec::new()),
            retired: Cell::new(0),
        }
    }

    #[inline]
    fn slot_index(&self) -> usize {
        match self.slot.get() {
            Some(index) => index,
            None => {
                let index = REGISTRY.claim_slot();
                self.slot.set(Some(index));
                index
            }
        }
    }

    fn pin(&self) -> Guard {
        let depth = self.depth.get();
        self.depth.set(depth + 1);

        if depth == 0 {
            let slot = REGISTRY.slot(self.slot_index());
            slot.activate(REGISTRY.epoch());
            // Order the slot activation before any subsequent pointer load.
            // Pairs with the fence in `Registry::try_advance`: either the
            // advancing thread sees this slot active, or this thread's loads
            // see the unlink that preceded the retirement.
            fence(Ordering::SeqCst);
        }

        Guard {
            _private: (),
            _marker: PhantomData,
        }
    }

    fn unpin(&self) {
        let depth = self.depth.get();
        self.depth.set(depth.saturating_sub(1));
        if depth == 1 {
            if let Some(index) = self.slot.get() {
                REGISTRY.slot(index).deactivate();
            }
        }
    }

    /// # Safety
    ///
    /// See [`retire`].
    unsafe fn retire<T: 'static>(&self, ptr: *mut T) {
        debug_assert!(
            self.depth.get() > 0,
            "retire must be called inside a pin() critical section"
        );
        self.garbage
            .borrow_mut()
            .push(Garbage::new(ptr, REGISTRY.epoch()));

        let retired = self.retired.get() + 1;
        self.retired.set(retired);
        if retired % COLLECT_EVERY == 0 {
            self.collect();
        }
    }

    /// Advance the epoch if possible and destroy everything that has aged
    /// out, both local and orphaned.
    fn collect(&self) {
        let epoch = REGISTRY.try_advance();

        let mut garbage = self.garbage.borrow_mut();
        let mut index = 0;
        while index < garbage.len() {
            if garbage[index].ripe(epoch) {
                let ripe = garbage.swap_remove(index);
                // SAFETY: `ripe` has aged two epochs past its retirement, so
                // no critical section from back then is still running.
                unsafe { ripe.release() };
            } else {
                index += 1;
            }
        }
        drop(garbage);

        REGISTRY.reap_orphans(epoch);
    }

    fn flush(&self) {
        // One advance per grace epoch, plus one for the in-flight epoch.
        // Each attempt stalls against currently pinned threads, which is
        // exactly the safety condition.
        for _ in 0..GRACE + 1 {
            REGISTRY.try_advance();
        }
        self.collect();
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let garbage = mem::take(&mut *self.garbage.borrow_mut());
        if !garbage.is_empty() {
            REGISTRY.adopt(garbage);
        }
        if let Some(index) = self.slot.get() {
            REGISTRY.release_slot(index);
        }
    }
}

thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

/// Enter a critical section.
///
/// Returns a [`Guard`]; while it is alive, pointers loaded through
/// [`Atomic`](crate::Atomic) will not be destroyed by concurrent [`retire`]
/// calls.
#[inline]
pub fn pin() -> Guard {
    // During process teardown TLS may be destroyed; hand out a dummy guard
    // whose drop is equally teardown-safe.
    HANDLE.try_with(|handle| handle.pin()).unwrap_or(Guard {
        _private: (),
        _marker: PhantomData,
    })
}

/// Retire a heap object for deferred destruction.
///
/// The object is dropped via `Box::from_raw` once the global epoch has
/// advanced past every critical section that was active at the time of this
/// call.
///
/// # Safety
///
/// - `ptr` must come from `Box::into_raw` and must not be retired twice.
/// - The object must already be unreachable for new readers (unlinked from
///   the shared structure); existing readers are what the epochs protect.
/// - Must be called while pinned, so the retirement epoch covers the caller.
#[inline]
pub unsafe fn retire<T: 'static>(ptr: *mut T) {
    // Leak during teardown: the OS reclaims process memory anyway.
    let _ = HANDLE.try_with(|handle| unsafe { handle.retire(ptr) });
}

/// Force an advance-and-collect cycle on the calling thread.
///
/// Destroys everything this thread has retired whose grace period can be
/// satisfied right now. Other threads' garbage is only destroyed if they
/// have exited (orphans); live threads flush themselves.
pub fn flush() {
    let _ = HANDLE.try_with(|handle| handle.flush());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_pins_share_one_slot() {
        let outer = pin();
        let inner = pin();
        HANDLE.with(|handle| assert_eq!(handle.depth.get(), 2));
        drop(inner);
        HANDLE.with(|handle| assert_eq!(handle.depth.get(), 1));
        drop(outer);
        HANDLE.with(|handle| assert_eq!(handle.depth.get(), 0));
    }

    #[test]
    fn retire_defers_until_flush() {
        let guard = pin();
        let ptr = Box::into_raw(Box::new(123u64));
        unsafe { retire(ptr) };
        HANDLE.with(|handle| assert!(!handle.garbage.borrow().is_empty()));
        drop(guard);

        // Concurrent tests may be pinned and briefly hold the epoch back.
        for _ in 0..1000 {
            flush();
            if HANDLE.with(|handle| handle.garbage.borrow().is_empty()) {
                return;
            }
            std::thread::yield_now();
        }
        panic!("retired garbage was never reclaimed");
    }
}
