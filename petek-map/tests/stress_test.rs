use petek_map::FlatMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn parallel_disjoint_inserts_with_growth() {
    const THREADS: u64 = 10;
    const PER_THREAD: u64 = 33_000;

    let map: Arc<FlatMap<u64, u64>> = Arc::new(FlatMap::with_capacity(100_000));
    let successes = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let map = Arc::clone(&map);
            let successes = Arc::clone(&successes);
            thread::spawn(move || {
                let base = id * id * 100_000;
                let mut local = 0;
                for i in 1..=PER_THREAD {
                    if map.insert(base + i, i) != 0 {
                        local += 1;
                    }
                }
                successes.fetch_add(local, Ordering::Relaxed);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(successes.load(Ordering::Relaxed), THREADS * PER_THREAD);
    for id in 0..THREADS {
        let base = id * id * 100_000;
        for i in 1..=PER_THREAD {
            assert_eq!(map.get(base + i), i, "thread {id} lost key {}", base + i);
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn random_mixed_operations_stay_consistent() {
    const THREADS: u64 = 10;
    const OPS: u64 = 40_000;
    const KEY_SPACE: u64 = 5_000;

    let map: Arc<FlatMap<u64, u64>> = Arc::new(FlatMap::with_capacity(1_024));

    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xDECAF + id);
                for i in 1..=OPS {
                    let key = rng.gen_range(1..=KEY_SPACE);

                    // ~1% removes, like the original workload.
                    if i % 100 == 0 {
                        let removed = map.remove(key);
                        if removed != 0 {
                            assert_eq!(removed % 1_000_000, key);
                        }
                        continue;
                    }

                    // Values encode their key, so any read can be checked
                    // against *some* earlier insert of that key.
                    map.insert(key, key + i * 1_000_000);
                    let seen = map.get(key);
                    if seen != 0 {
                        assert_eq!(
                            seen % 1_000_000,
                            key,
                            "get({key}) observed a value from another key"
                        );
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for key in 1..=KEY_SPACE {
        let value = map.get(key);
        if value != 0 {
            assert_eq!(value % 1_000_000, key);
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn heavy_contention_on_one_key() {
    let map: Arc<FlatMap<u64, u64>> = Arc::new(FlatMap::with_capacity(64));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 1..=5_000 {
                    map.insert(7, t * 5_000 + i);
                    let seen = map.get(7);
                    assert_ne!(seen, 0, "a hammered key must never read as absent");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_ne!(map.get(7), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_insert_remove_cycles() {
    let map: Arc<FlatMap<u64, u64>> = Arc::new(FlatMap::with_capacity(256));

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 1..=2_000 {
                    let key = t * 2_000 + i;
                    map.insert(key, key);
                    if i % 2 == 0 {
                        assert_eq!(map.remove(key), key);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..4u64 {
        for i in 1..=2_000 {
            let key = t * 2_000 + i;
            let expected = if i % 2 == 0 { 0 } else { key };
            assert_eq!(map.get(key), expected);
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn read_heavy_workload_during_growth() {
    let map: Arc<FlatMap<u64, u64>> = Arc::new(FlatMap::with_capacity(64));
    for key in 1..=1_000 {
        map.insert(key, key * 2);
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..10_000u64 {
                let key = i % 1_000 + 1;
                assert_eq!(map.get(key), key * 2);
            }
        }));
    }
    // One writer forcing migrations underneath the readers.
    {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for key in 1_001..=4_000 {
                map.insert(key, key * 2);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for key in 1..=4_000 {
        assert_eq!(map.get(key), key * 2);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn growth_storm_from_a_tiny_table() {
    let map: Arc<FlatMap<u64, u64>> = Arc::new(FlatMap::with_capacity(2));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 1..=5_000 {
                    let key = t * 5_000 + i;
                    map.insert(key, key + 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..8u64 {
        for i in 1..=5_000 {
            let key = t * 5_000 + i;
            assert_eq!(map.get(key), key + 1);
        }
    }
}
