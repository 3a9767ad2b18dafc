//! Common test utilities for pegaflow-regcache tests.

#![allow(dead_code)]

use std::sync::{Arc, Barrier};

use pegaflow_regcache::{LoopbackRegion, RegCacheConfig, RegistrationCache};

/// Base of the address window the tests register in. Nothing is ever
/// dereferenced, so the addresses need not be backed by memory.
pub const TEST_BASE: u64 = 0x7f00_0000_0000;

/// Page-sized stride between test ranges.
pub const PAGE: u64 = 4096;

pub fn init_test_logging() {
    pegaflow_regcache::init_logging_with("warn");
}

/// Cache with `copies` index copies and a short spin before yielding, so
/// writers waiting on readers give up the CPU quickly on small CI machines.
pub fn test_cache(copies: usize) -> RegistrationCache<LoopbackRegion> {
    let config = RegCacheConfig::new(copies, 64).expect("valid config");
    RegistrationCache::new(config).expect("cache")
}

/// Start address of the `index`-th page-aligned test range.
pub fn page_addr(index: u64) -> u64 {
    TEST_BASE + index * PAGE
}

pub type SharedBarrier = Arc<Barrier>;

pub fn shared_barrier(n: usize) -> SharedBarrier {
    Arc::new(Barrier::new(n))
}

/// Helper to run concurrent operations with a barrier for synchronization.
pub fn run_concurrent_with_barrier<T, F>(num_threads: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, &Barrier) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let barrier = shared_barrier(num_threads);

    let handles: Vec<_> = (0..num_threads)
        .map(|i| {
            let f = Arc::clone(&f);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || f(i, &barrier))
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("test thread panicked"))
        .collect()
}
