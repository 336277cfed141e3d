//! Shared fixtures for the qalloc benchmarks.

use qalloc_core::{Heap, HeapConfig, RegionError, VecRegion};

pub const BENCH_PAGE: usize = 4096;

/// Ceiling for bench regions; generous enough that no bench runs out.
pub const BENCH_CAPACITY: usize = 64 << 20;

/// A heap over an in-process region with `initial_pages` already mapped.
pub fn bench_heap(initial_pages: usize) -> Result<Heap<VecRegion>, RegionError> {
    let config = HeapConfig::new().with_initial_pages(initial_pages);
    Heap::new(VecRegion::new(BENCH_PAGE, BENCH_CAPACITY), config)
}
