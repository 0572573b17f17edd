//! Petek: epoch-based memory reclamation for lock-free data structures.
//!
//! Petek lets lock-free structures free shared heap objects safely: a thread
//! that unlinks an object hands it to [`retire`] instead of dropping it, and
//! the object is destroyed only once every thread that could still hold a
//! reference has left its critical section.
//!
//! # Protocol
//!
//! - Wrap every access to shared pointers in a critical section obtained from
//!   [`pin`]. Pointers loaded through [`Atomic`] while the [`Guard`] is alive
//!   stay valid until the guard is dropped.
//! - After unlinking an object from the structure, pass it to [`retire`]
//!   while still pinned. Destruction is deferred until the global epoch has
//!   advanced past every critical section that was active at retirement.
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::Ordering;
//! use petek::{pin, retire, Atomic, Shared};
//!
//! let atomic = Atomic::new(Box::into_raw(Box::new(42)));
//!
//! let guard = pin();
//! let ptr = atomic.load(Ordering::Acquire, &guard);
//! if let Some(value) = unsafe { ptr.as_ref() } {
//!     assert_eq!(*value, 42);
//! }
//!
//! // Unlink, then retire. The allocation is freed after all guards
//! // from the retirement epoch are gone.
//! let old = atomic.swap(Shared::null(), Ordering::AcqRel, &guard);
//! unsafe { retire(old.as_raw()) };
//! drop(guard);
//! ```

#![warn(missing_docs)]

mod atomic;
mod epoch;
mod guard;

pub use atomic::{Atomic, Shared};
pub use guard::{flush, pin, retire, Guard};
