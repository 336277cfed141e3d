//! Process-wide allocator instance.
//!
//! One guard serializes every heap operation. The heap itself is created
//! lazily by the first request that needs it, inside the guard, so racing
//! first callers initialize it exactly once.
//!
//! The guard is generic over [`RawMutex`]. Hosted code uses
//! `parking_lot`'s mutex; the C boundary supplies a futex lock that never
//! allocates, since the heap being built is the one that would serve the
//! allocation.

use parking_lot::lock_api::{Mutex, RawMutex};

use super::check::{HeapCorruption, HeapStats};
use super::error::{AllocError, RegionError};
use super::heap::Heap;
use super::log::HeapLogRecord;
use super::region::HeapRegion;

/// Builds the heap on first use.
pub type Bootstrap<R> = fn() -> Result<Heap<R>, RegionError>;

/// Locked, lazily initialized heap.
///
/// Addresses are plain `usize` values with zero standing in for null.
pub struct Allocator<R: HeapRegion, L: RawMutex = parking_lot::RawMutex> {
    heap: Mutex<L, Option<Heap<R>>>,
    bootstrap: Bootstrap<R>,
}

impl<R: HeapRegion, L: RawMutex> Allocator<R, L> {
    /// Creates an allocator whose heap is built by `bootstrap` on first use.
    /// Usable in a `static`.
    #[must_use]
    pub const fn new(bootstrap: Bootstrap<R>) -> Self {
        Self {
            heap: Mutex::const_new(L::INIT, None),
            bootstrap,
        }
    }

    /// Wraps an already constructed heap.
    #[must_use]
    pub fn from_heap(heap: Heap<R>) -> Self {
        Self {
            heap: Mutex::new(Some(heap)),
            bootstrap: || Err(RegionError::Exhausted { requested: 0 }),
        }
    }

    /// Returns true once the heap exists.
    pub fn is_initialized(&self) -> bool {
        self.heap.lock().is_some()
    }

    /// Runs `f` on the heap under the guard, creating the heap first if
    /// needed. `f` must not allocate through this allocator.
    pub fn with_heap<T>(&self, f: impl FnOnce(&mut Heap<R>) -> T) -> Result<T, AllocError> {
        let mut guard = self.heap.lock();
        let heap = match &mut *guard {
            Some(heap) => heap,
            slot => slot.insert((self.bootstrap)().map_err(AllocError::HeapInit)?),
        };
        Ok(f(heap))
    }

    /// Runs `f` on the heap if it exists, without creating it.
    pub fn with_existing<T>(&self, f: impl FnOnce(&mut Heap<R>) -> T) -> Option<T> {
        self.heap.lock().as_mut().map(f)
    }

    fn run<T>(
        &self,
        f: impl FnOnce(&mut Heap<R>) -> Result<T, AllocError>,
    ) -> Result<T, AllocError> {
        self.with_heap(f)?
    }

    pub fn malloc(&self, size: usize) -> Result<usize, AllocError> {
        self.run(|heap| heap.malloc(size))
    }

    /// Frees `addr`. Zero, and any address before the heap exists, is a
    /// no-op.
    pub fn free(&self, addr: usize) {
        if addr == 0 {
            return;
        }
        self.with_existing(|heap| heap.free(addr));
    }

    pub fn calloc(&self, count: usize, size: usize) -> Result<usize, AllocError> {
        self.run(|heap| heap.calloc(count, size))
    }

    /// See [`Heap::realloc`]. `Ok(None)` means the allocation was freed.
    pub fn realloc(&self, addr: usize, size: usize) -> Result<Option<usize>, AllocError> {
        self.run(|heap| heap.realloc(addr, size))
    }

    pub fn reallocarray(
        &self,
        addr: usize,
        count: usize,
        size: usize,
    ) -> Result<Option<usize>, AllocError> {
        self.run(|heap| heap.reallocarray(addr, count, size))
    }

    #[must_use]
    pub fn usable_size(&self, addr: usize) -> usize {
        if addr == 0 {
            return 0;
        }
        self.with_existing(|heap| heap.usable_size(addr))
            .unwrap_or(0)
    }

    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> Result<usize, AllocError> {
        self.run(|heap| heap.aligned_alloc(alignment, size))
    }

    pub fn posix_memalign(&self, alignment: usize, size: usize) -> Result<usize, AllocError> {
        self.run(|heap| heap.posix_memalign(alignment, size))
    }

    pub fn memalign(&self, alignment: usize, size: usize) -> Result<usize, AllocError> {
        self.run(|heap| heap.memalign(alignment, size))
    }

    pub fn valloc(&self, size: usize) -> Result<usize, AllocError> {
        self.run(|heap| heap.valloc(size))
    }

    /// Verifies the chunk list. A heap that does not exist yet is consistent.
    pub fn check_integrity(&self) -> Result<(), HeapCorruption> {
        self.with_existing(|heap| heap.check_integrity())
            .unwrap_or(Ok(()))
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.with_existing(|heap| heap.stats()).unwrap_or_default()
    }

    /// Hands every pending lifecycle record to `sink`, oldest first.
    ///
    /// `sink` runs under the guard and must not allocate.
    pub fn drain_logs(&self, mut sink: impl FnMut(HeapLogRecord)) {
        self.with_existing(|heap| {
            while let Some(record) = heap.pop_log() {
                sink(record);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::malloc::HeapLogLevel;
    use crate::malloc::region::VecRegion;

    const PAGE: usize = 4096;

    fn bootstrap() -> Result<Heap<VecRegion>, RegionError> {
        let config = HeapConfig::new()
            .with_initial_pages(1)
            .with_extend_pages(1)
            .with_log_threshold(Some(HeapLogLevel::Info));
        Heap::new(VecRegion::new(PAGE, 1 << 22), config)
    }

    fn failing_bootstrap() -> Result<Heap<VecRegion>, RegionError> {
        Heap::new(VecRegion::new(PAGE, 0), HeapConfig::new())
    }

    #[test]
    fn heap_is_created_on_first_allocation() {
        let allocator: Allocator<VecRegion> = Allocator::new(bootstrap);
        assert!(!allocator.is_initialized());
        allocator.free(0);
        allocator.free(0x1234);
        assert_eq!(allocator.usable_size(0x1234), 0);
        allocator.check_integrity().unwrap();
        assert_eq!(allocator.stats(), HeapStats::default());
        assert!(!allocator.is_initialized());

        let addr = allocator.malloc(10).unwrap();
        assert!(allocator.is_initialized());
        assert_eq!(allocator.usable_size(addr), 16);
    }

    #[test]
    fn init_failure_is_reported_as_fatal() {
        let allocator: Allocator<VecRegion> = Allocator::new(failing_bootstrap);
        let err = allocator.malloc(16).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, AllocError::HeapInit(RegionError::Exhausted { .. })));
        assert!(!allocator.is_initialized());
    }

    #[test]
    fn from_heap_is_ready_immediately() {
        let allocator: Allocator<VecRegion> = Allocator::from_heap(bootstrap().unwrap());
        assert!(allocator.is_initialized());
        let addr = allocator.calloc(4, 4).unwrap();
        assert_eq!(allocator.realloc(addr, 0), Ok(None));
    }

    #[test]
    fn drain_logs_empties_the_ring() {
        let allocator: Allocator<VecRegion> = Allocator::new(bootstrap);
        allocator.malloc(8 * PAGE).unwrap();
        let mut events = Vec::new();
        allocator.drain_logs(|record| events.push(record.event));
        assert_eq!(events, ["heap_init", "extend"]);
        let mut again = 0;
        allocator.drain_logs(|_| again += 1);
        assert_eq!(again, 0);
    }

    #[test]
    fn concurrent_callers_share_one_heap() {
        let allocator: Allocator<VecRegion> = Allocator::new(bootstrap);
        std::thread::scope(|scope| {
            for t in 0..8usize {
                let allocator = &allocator;
                scope.spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..200usize {
                        let size = 16 + (t * 37 + i * 13) % 700;
                        let addr = allocator.malloc(size).unwrap();
                        let tag = [t as u8; 1];
                        allocator
                            .with_heap(|heap| heap.write_bytes(addr, &tag))
                            .unwrap();
                        live.push(addr);
                        if i % 3 == 0 {
                            allocator.free(live.swap_remove(0));
                        }
                    }
                    for addr in &live {
                        let mut tag = [0u8; 1];
                        allocator
                            .with_heap(|heap| heap.read_bytes(*addr, &mut tag))
                            .unwrap();
                        assert_eq!(tag[0], t as u8);
                    }
                    for addr in live {
                        allocator.free(addr);
                    }
                });
            }
        });
        allocator.check_integrity().unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.used_chunks, 0);
        assert_eq!(stats.free_chunks, 1);
    }
}
