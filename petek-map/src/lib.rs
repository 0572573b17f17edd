//! Concurrent lock-free open-addressed hash map with online resizing.
//!
//! # Architecture
//!
//! - **Cells**: flat array of atomic `(key, value)` word pairs; linear
//!   probing with CAS cell reservation, no per-entry allocation.
//! - **Online growth**: when the active table saturates, a larger table is
//!   published atomically and live entries migrate over while readers and
//!   writers keep running; retired tables drain through a
//!   youngest-to-oldest chain consulted by fallback reads.
//! - **Memory reclamation**: retired tables are freed through `petek`
//!   epochs, so a reader mid-probe never touches freed memory.
//! - **Hashing**: `foldhash::fast::FixedState` by default, any
//!   `BuildHasher` via the `S` parameter.
//!
//! Keys and values are single-word scalars; one key bit pattern
//! ([`Key::empty`]) and one value bit pattern ([`Value::absent`]) are
//! reserved by the map. Wrap domains that need those patterns in a tagged
//! encoding before storing.
//!
//! # Example
//!
//! ```
//! use petek_map::FlatMap;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let map: Arc<FlatMap<u64, u64>> = Arc::new(FlatMap::with_capacity(1024));
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|t| {
//!         let map = Arc::clone(&map);
//!         thread::spawn(move || {
//!             for i in 1..=1000u64 {
//!                 map.insert(t * 1000 + i, i);
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(map.get(1), 1);
//! ```

#![warn(missing_docs)]

mod cell;
mod decay;
mod map;
mod migrate;
mod table;
mod traits;
mod util;

pub use map::{FlatMap, MapError, Options};
pub use traits::{Key, Value, Word};
