use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use perfstore::common::exception::PoolError;
use perfstore::storage::disk::async_disk::BufferPool;
use rand::Rng;

use crate::common::logger::init_test_logger;

#[test]
fn single_buffer_pool_exhausts_on_second_acquire() {
    init_test_logger();
    let pool = BufferPool::new(128, 0, 1);
    let first = assert_ok!(pool.acquire());
    assert!(matches!(pool.acquire(), Err(PoolError::Exhausted { max: 1 })));

    drop(first);
    assert_ok!(pool.acquire(), "released buffer is acquirable again");
}

#[test]
fn random_acquire_release_sequences_stay_within_bounds() {
    init_test_logger();
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let min = rng.gen_range(0..8);
        let max = rng.gen_range(min.max(1)..32);
        let pool = BufferPool::new(64, min, max);
        let mut held = Vec::new();

        for _ in 0..500 {
            if rng.gen_bool(0.55) {
                match pool.acquire() {
                    Ok(buffer) => held.push(buffer),
                    Err(PoolError::Exhausted { .. }) => assert_eq!(held.len(), max),
                }
            } else if !held.is_empty() {
                let index = rng.gen_range(0..held.len());
                held.swap_remove(index);
            }
            let stats = pool.stats();
            assert!(stats.created <= max, "created {} exceeds max {}", stats.created, max);
            assert_eq!(stats.outstanding, held.len());
        }

        // Burst of releases: anything above the floor is dropped.
        held.clear();
        let stats = pool.stats();
        assert!(stats.available <= min, "available {} exceeds min {}", stats.available, min);
        assert_eq!(stats.created, stats.available);
    }
}

#[test]
fn concurrent_acquire_release_respects_capacity() {
    init_test_logger();
    const THREADS: usize = 5;
    const CYCLES: usize = 100_000;
    const MAX: usize = 8;

    let pool = BufferPool::new(32, 2, MAX);
    let exhausted = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            let exhausted = Arc::clone(&exhausted);
            thread::spawn(move || {
                for cycle in 0..CYCLES {
                    match pool.acquire() {
                        Ok(mut buffer) => {
                            buffer.as_mut_slice()[0] = cycle as u8;
                            assert!(pool.stats().created <= MAX);
                        }
                        Err(PoolError::Exhausted { .. }) => {
                            exhausted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert!(stats.created <= MAX);
    assert!(stats.available <= pool.min_capacity());
    assert_eq!(stats.created, stats.available);
    log::info!("{} acquires hit exhaustion", exhausted.load(Ordering::Relaxed));
}

#[test]
fn multi_buffer_lease_is_all_or_nothing() {
    init_test_logger();
    let pool = BufferPool::new(10, 0, 3);
    let _held = assert_ok!(pool.acquire());
    assert_err!(pool.acquire_filled(&[1u8; 25]));
    assert_eq!(pool.stats().outstanding, 1);

    let buffers = assert_ok!(pool.acquire_filled(&[1u8; 20]));
    assert_eq!(buffers.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![10, 10]);
}
