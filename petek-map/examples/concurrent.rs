//! Example demonstrating concurrent operations on the lock-free FlatMap.
//!
//! Multiple threads insert, read and remove concurrently while the map grows
//! online; no operation takes a lock.

use petek_map::FlatMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn main() {
    println!("=== Lock-Free FlatMap Demo ===\n");

    // Start deliberately small so the demo exercises online growth.
    let map: Arc<FlatMap<u64, u64>> = Arc::new(FlatMap::with_capacity(256));

    println!("Benchmarking concurrent inserts (with online growth)...");
    let start = Instant::now();
    let mut handles = Vec::new();

    // 8 threads, 10,000 disjoint keys each.
    for thread_id in 0..8u64 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 1..=10_000 {
                let key = thread_id * 10_000 + i;
                map.insert(key, key * 2);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Inserted 80,000 entries from 8 threads in {:?} ({:.2} ops/sec)",
        duration,
        80_000.0 / duration.as_secs_f64()
    );
    println!(
        "Map now holds {} entries in a table of {} cells\n",
        map.len(),
        map.capacity()
    );

    println!("Benchmarking concurrent reads...");
    let start = Instant::now();
    let mut handles = Vec::new();

    for thread_id in 0..8u64 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let mut found = 0;
            for i in 1..=10_000 {
                let key = thread_id * 10_000 + i;
                if map.get(key) != 0 {
                    found += 1;
                }
            }
            found
        }));
    }
    let mut total_found = 0;
    for handle in handles {
        total_found += handle.join().unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Read back {} entries in {:?} ({:.2} ops/sec)",
        total_found,
        duration,
        80_000.0 / duration.as_secs_f64()
    );

    println!("\nRemoving every other key...");
    for key in (2..=80_000u64).step_by(2) {
        map.remove(key);
    }
    println!("Map now holds {} entries", map.len());

    assert_eq!(map.get(1), 2);
    assert_eq!(map.get(2), 0);
    println!("\nDone.");
}
