//! Guard-scoped atomic pointer types.

use crate::guard::Guard;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// An atomic pointer to a heap-allocated `T`.
///
/// Loads hand back a [`Shared`] bound to the lifetime of a [`Guard`], which
/// is what makes dereferencing it sound: the pointee cannot be destroyed
/// while the guard is alive, provided writers release it through
/// [`retire`](crate::retire).
pub struct Atomic<T> {
    ptr: AtomicPtr<T>,
}

// SAFETY: an Atomic is a shared handle to T; moving or sharing the handle is
// safe exactly when sharing T across threads is.
unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Creates an atomic holding `raw`.
    #[inline]
    pub fn new(raw: *mut T) -> Self {
        Self {
            ptr: AtomicPtr::new(raw),
        }
    }

    /// Creates a null atomic pointer.
    #[inline]
    pub fn null() -> Self {
        Self::new(ptr::null_mut())
    }

    /// Loads the pointer. The result borrows the guard and stays valid for
    /// as long as the guard does.
    #[inline]
    pub fn load<'g>(&self, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared {
            raw: self.ptr.load(order),
            _marker: PhantomData,
        }
    }

    /// Stores a pointer.
    #[inline]
    pub fn store(&self, new: Shared<'_, T>, order: Ordering) {
        self.ptr.store(new.raw, order);
    }

    /// Swaps in a pointer, returning the previous one.
    #[inline]
    pub fn swap<'g>(&self, new: Shared<'_, T>, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared {
            raw: self.ptr.swap(new.raw, order),
            _marker: PhantomData,
        }
    }

    /// Compares and exchanges the pointer.
    #[inline]
    pub fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'_, T>,
        success: Ordering,
        failure: Ordering,
        _guard: &'g Guard,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        match self
            .ptr
            .compare_exchange(current.raw, new.raw, success, failure)
        {
            Ok(previous) => Ok(Shared {
                raw: previous,
                _marker: PhantomData,
            }),
            Err(observed) => Err(Shared {
                raw: observed,
                _marker: PhantomData,
            }),
        }
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Self::null()
    }
}

/// A pointer loaded from an [`Atomic`], valid for the lifetime of the guard
/// it was loaded under.
pub struct Shared<'g, T> {
    raw: *mut T,
    _marker: PhantomData<&'g Guard>,
}

impl<'g, T> Shared<'g, T> {
    /// A null shared pointer.
    #[inline]
    pub fn null() -> Self {
        Self {
            raw: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    /// Wraps a raw pointer.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the pointer is valid for the guard lifetime
    /// it gets used under (freshly allocated and not yet shared, or already
    /// protected by the current guard).
    #[inline]
    pub unsafe fn from_raw(raw: *mut T) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// The raw pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut T {
        self.raw
    }

    /// Whether the pointer is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }

    /// Dereferences without a null check.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and point to a live `T`.
    #[inline]
    pub unsafe fn deref(&self) -> &'g T {
        unsafe { &*self.raw }
    }

    /// Converts to a reference, or `None` when null.
    ///
    /// # Safety
    ///
    /// A non-null pointer must point to a live `T`.
    #[inline]
    pub unsafe fn as_ref(&self) -> Option<&'g T> {
        if self.raw.is_null() {
            None
        } else {
            unsafe { Some(&*self.raw) }
        }
    }
}

impl<'g, T> Clone for Shared<'g, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, T> Copy for Shared<'g, T> {}

impl<'g, T> PartialEq for Shared<'g, T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<'g, T> Eq for Shared<'g, T> {}

impl<'g, T> std::fmt::Debug for Shared<'g, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Shared({:p})", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin;

    #[test]
    fn load_store_roundtrip() {
        let guard = pin();
        let atomic = Atomic::new(Box::into_raw(Box::new(5u32)));
        let loaded = atomic.load(Ordering::Acquire, &guard);
        assert_eq!(unsafe { *loaded.deref() }, 5);

        let replacement = Box::into_raw(Box::new(6u32));
        let old = atomic.swap(
            unsafe { Shared::from_raw(replacement) },
            Ordering::AcqRel,
            &guard,
        );
        assert_eq!(old, loaded);
        unsafe { drop(Box::from_raw(old.as_raw())) };

        let now = atomic.load(Ordering::Acquire, &guard);
        assert_eq!(unsafe { *now.deref() }, 6);
        unsafe { drop(Box::from_raw(now.as_raw())) };
    }

    #[test]
    fn compare_exchange_observes_current() {
        let guard = pin();
        let first = Box::into_raw(Box::new(1u32));
        let atomic = Atomic::new(first);

        let stale = Shared::null();
        let fresh = Box::into_raw(Box::new(2u32));
        let result = atomic.compare_exchange(
            stale,
            unsafe { Shared::from_raw(fresh) },
            Ordering::AcqRel,
            Ordering::Acquire,
            &guard,
        );
        let observed = result.unwrap_err();
        assert_eq!(observed.as_raw(), first);

        unsafe { drop(Box::from_raw(fresh)) };
        unsafe { drop(Box::from_raw(first)) };
    }
}
