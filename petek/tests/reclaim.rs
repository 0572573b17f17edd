//! Reclamation safety tests.
//!
//! Verifies the two core guarantees:
//! 1. No premature free: an object is never destroyed while a guard that
//!    could reference it is still alive.
//! 2. Eventual reclamation: retired objects are destroyed once all guards
//!    from their retirement epoch are gone.

use petek::{flush, pin, retire, Atomic, Shared};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct TestNode {
    value: usize,
    freed: Arc<AtomicBool>,
}

impl TestNode {
    fn alloc(value: usize, freed: Arc<AtomicBool>) -> *mut Self {
        Box::into_raw(Box::new(Self { value, freed }))
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.freed.store(true, Ordering::Release);
    }
}

/// Flush repeatedly until the predicate holds or a deadline passes.
fn flush_until(predicate: impl Fn() -> bool) -> bool {
    for _ in 0..1000 {
        flush();
        if predicate() {
            return true;
        }
        thread::yield_now();
    }
    false
}

#[test]
#[cfg_attr(miri, ignore)]
fn no_premature_free() {
    let freed = Arc::new(AtomicBool::new(false));
    let atomic = Arc::new(Atomic::new(TestNode::alloc(42, freed.clone())));
    let reader_in = Arc::new(AtomicBool::new(false));
    let may_exit = Arc::new(AtomicBool::new(false));

    // Reader: hold a guard over the node and keep checking its value.
    let reader = {
        let atomic = atomic.clone();
        let reader_in = reader_in.clone();
        let may_exit = may_exit.clone();
        thread::spawn(move || {
            let guard = pin();
            let ptr = atomic.load(Ordering::Acquire, &guard);
            let node = unsafe { ptr.deref() };
            reader_in.store(true, Ordering::Release);

            while !may_exit.load(Ordering::Acquire) {
                // The read must stay valid the whole time the guard lives.
                assert_eq!(node.value, 42);
                thread::yield_now();
            }
            drop(guard);
        })
    };

    while !reader_in.load(Ordering::Acquire) {
        thread::yield_now();
    }

    // Writer: unlink and retire the node while the reader is pinned.
    {
        let guard = pin();
        let old = atomic.swap(Shared::null(), Ordering::AcqRel, &guard);
        unsafe { retire(old.as_raw()) };
    }

    // Aggressively try to reclaim; the reader's guard must hold it back.
    for _ in 0..50 {
        flush();
        assert!(
            !freed.load(Ordering::Acquire),
            "node freed while a guard still referenced it"
        );
        thread::sleep(Duration::from_millis(1));
    }

    may_exit.store(true, Ordering::Release);
    reader.join().unwrap();

    // With the reader gone the node must eventually be destroyed.
    assert!(
        flush_until(|| freed.load(Ordering::Acquire)),
        "node was never reclaimed after all guards dropped"
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn eventual_reclamation_of_many_nodes() {
    const NODES: usize = 1000;

    let flags: Vec<Arc<AtomicBool>> = (0..NODES)
        .map(|_| Arc::new(AtomicBool::new(false)))
        .collect();

    {
        let guard = pin();
        for (index, flag) in flags.iter().enumerate() {
            let node = TestNode::alloc(index, flag.clone());
            unsafe { retire(node) };
        }
        drop(guard);
    }

    assert!(
        flush_until(|| flags.iter().all(|flag| flag.load(Ordering::Acquire))),
        "some retired nodes were never destroyed"
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn randomized_pin_retire_interleavings() {
    // Threads mix reads, swaps and retires with randomized critical-section
    // lengths and randomized pauses, so guard lifetimes straddle epoch
    // advances in ways the fixed-schedule tests above never produce. Broken
    // reclamation shows up as a crash or a read of a destroyed node.
    let atomic = Arc::new(Atomic::new(TestNode::alloc(
        0,
        Arc::new(AtomicBool::new(false)),
    )));

    let handles: Vec<_> = (0..6u64)
        .map(|seed| {
            let atomic = atomic.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xEB0C + seed);
                for round in 0..2_000usize {
                    let guard = pin();
                    let ptr = atomic.load(Ordering::Acquire, &guard);
                    if let Some(node) = unsafe { ptr.as_ref() } {
                        assert!(node.value < 10_000, "read a destroyed node");
                    }

                    if rng.gen_bool(0.3) {
                        let fresh =
                            TestNode::alloc(round % 128, Arc::new(AtomicBool::new(false)));
                        let old = atomic.swap(
                            unsafe { Shared::from_raw(fresh) },
                            Ordering::AcqRel,
                            &guard,
                        );
                        // Swap hands each previous node to exactly one thread.
                        unsafe { retire(old.as_raw()) };
                    }

                    // Occasionally hold the guard across a long pause so the
                    // epoch has to wait on this thread.
                    if rng.gen_bool(0.05) {
                        for _ in 0..rng.gen_range(1..64) {
                            thread::yield_now();
                        }
                    }
                    drop(guard);

                    if rng.gen_bool(0.01) {
                        flush();
                    }
                }
                flush();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Tear down the survivor; it was never retired.
    let guard = pin();
    let last = atomic.load(Ordering::Acquire, &guard);
    unsafe { drop(Box::from_raw(last.as_raw())) };
    drop(guard);
    flush();
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_readers_and_swappers() {
    // Churn a single atomic from several threads while readers continuously
    // dereference it. Failure mode under broken reclamation is a crash or
    // torn read, so the assertion is simply that values stay well-formed.
    let atomic = Arc::new(Atomic::new(TestNode::alloc(
        0,
        Arc::new(AtomicBool::new(false)),
    )));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let atomic = atomic.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let guard = pin();
                let ptr = atomic.load(Ordering::Acquire, &guard);
                if let Some(node) = unsafe { ptr.as_ref() } {
                    assert!(node.value < 10_000);
                }
            }
        }));
    }

    for round in 1..200 {
        let guard = pin();
        let fresh = TestNode::alloc(round, Arc::new(AtomicBool::new(false)));
        let old = atomic.swap(unsafe { Shared::from_raw(fresh) }, Ordering::AcqRel, &guard);
        unsafe { retire(old.as_raw()) };
        drop(guard);
    }

    stop.store(true, Ordering::Release);
    for handle in handles {
        handle.join().unwrap();
    }

    // Tear down the final node by hand; it was never retired.
    let guard = pin();
    let last = atomic.load(Ordering::Acquire, &guard);
    unsafe { drop(Box::from_raw(last.as_raw())) };
    drop(guard);
    flush();
}
