//! Chunk-list heap.
//!
//! The heap partitions its region into an address-ordered, doubly linked list
//! of chunks that ends in a zero-size sentinel:
//!
//! ```text
//!  first                                                      last
//!  ┌────┬──────────┐┌────┬───────┐┌────┬────────────────────┐┌────┐
//!  │hdr │ in use   ││hdr │ free  ││hdr │ in use             ││hdr │ size 0
//!  └────┴──────────┘└────┴───────┘└────┴────────────────────┘└────┘
//! ```
//!
//! Invariants after every public method returns:
//! 1. Links are consistent in both directions and strictly increasing.
//! 2. No two neighbouring chunks are both free.
//! 3. Every in-use chunk has a size that is a multiple of [`ALIGNMENT`] and
//!    a data address aligned to at least [`ALIGNMENT`].
//! 4. The sentinel exists, has size zero and is never free.
//!
//! [`Heap::check_integrity`] verifies all four.

use super::chunk::{ALIGNMENT, ChunkHeader, HEADER_SIZE, align_up, request_size};
use super::error::{AllocError, RegionError};
use super::log::{HeapLogLevel, HeapLogRecord, LogRing};
use super::region::HeapRegion;
use crate::config::HeapConfig;

/// Single-region best-fit heap.
///
/// Not synchronized; wrap it in an [`Allocator`](super::Allocator) to share
/// it between threads.
pub struct Heap<R: HeapRegion> {
    region: R,
    config: HeapConfig,
    first: usize,
    last: usize,
    growth_events: u64,
    log: LogRing,
}

impl<R: HeapRegion> Heap<R> {
    /// Reserves the initial region and lays out one free chunk followed by
    /// the sentinel.
    pub fn new(mut region: R, config: HeapConfig) -> Result<Self, RegionError> {
        let page_size = region.page_size();
        let size = page_size
            .checked_mul(config.initial_pages.max(1))
            .ok_or(RegionError::Overflow)?;
        let first = region.len();
        region.grow(size)?;
        let last = first + size - HEADER_SIZE;

        let mut heap = Self {
            region,
            config,
            first,
            last,
            growth_events: 0,
            log: LogRing::new(config.log_threshold),
        };
        heap.write(
            first,
            &ChunkHeader {
                size: size - 2 * HEADER_SIZE,
                next: Some(last),
                prev: None,
                free: true,
            },
        );
        heap.write(last, &ChunkHeader::sentinel(Some(first)));
        heap.record(
            HeapLogLevel::Info,
            "init",
            "heap_init",
            Some(heap.data_addr(first)),
            Some(size),
            "success",
        );
        Ok(heap)
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub fn region(&self) -> &R {
        &self.region
    }

    /// Number of times the region has been grown since creation.
    #[must_use]
    pub fn growth_events(&self) -> u64 {
        self.growth_events
    }

    /// Offset of the lowest chunk.
    #[must_use]
    pub fn first_offset(&self) -> usize {
        self.first
    }

    /// Offset of the sentinel.
    #[must_use]
    pub fn last_offset(&self) -> usize {
        self.last
    }

    #[must_use]
    pub fn log(&self) -> &LogRing {
        &self.log
    }

    /// Removes and returns the oldest retained lifecycle record.
    pub fn pop_log(&mut self) -> Option<HeapLogRecord> {
        self.log.pop()
    }

    pub fn set_log_threshold(&mut self, threshold: Option<HeapLogLevel>) {
        self.log.set_threshold(threshold);
    }

    // -----------------------------------------------------------------------
    // Public allocation surface
    // -----------------------------------------------------------------------

    /// Allocates at least `size` bytes aligned to [`ALIGNMENT`].
    pub fn malloc(&mut self, size: usize) -> Result<usize, AllocError> {
        self.allocate("malloc", ALIGNMENT, size)
    }

    /// Releases the allocation at `addr`. Zero is a no-op.
    pub fn free(&mut self, addr: usize) {
        self.release("free", addr);
    }

    /// Allocates `count * size` zeroed bytes, failing on overflow.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<usize, AllocError> {
        let Some(total) = count.checked_mul(size) else {
            return Err(self.fail(
                "calloc",
                "calloc_overflow",
                None,
                AllocError::SizeOverflow { requested: size },
            ));
        };
        let addr = self.allocate("calloc", ALIGNMENT, total)?;
        let offset = self.offset_of(addr);
        self.region.fill(offset, total, 0);
        Ok(addr)
    }

    /// Resizes the allocation at `addr`.
    ///
    /// - `addr == 0` allocates.
    /// - `size == 0` frees and returns `Ok(None)`.
    /// - Shrinking, or growing into a free successor, keeps the address.
    /// - Otherwise the contents move to a new chunk; on failure the original
    ///   allocation is left untouched.
    pub fn realloc(&mut self, addr: usize, size: usize) -> Result<Option<usize>, AllocError> {
        if addr == 0 {
            return self.allocate("realloc", ALIGNMENT, size).map(Some);
        }
        if size == 0 {
            self.release("realloc", addr);
            return Ok(None);
        }
        let size = match request_size(size) {
            Ok(size) => size,
            Err(err) => return Err(self.fail("realloc", "realloc_overflow", Some(addr), err)),
        };
        let Some(chunk) = self.chunk_at(addr) else {
            self.record(
                HeapLogLevel::Warn,
                "realloc",
                "realloc_unknown_pointer",
                Some(addr),
                Some(size),
                "fallback_alloc",
            );
            return self.allocate("realloc", ALIGNMENT, size).map(Some);
        };

        let header = self.header(chunk);
        if size <= header.size {
            self.crop(chunk, size);
            self.record(
                HeapLogLevel::Trace,
                "realloc",
                "realloc_shrink",
                Some(addr),
                Some(size),
                "in_place",
            );
            return Ok(Some(addr));
        }

        if let Some(next) = header.next {
            let next_header = self.header(next);
            if next_header.free && size - header.size <= next_header.size + HEADER_SIZE {
                self.absorb_next(chunk);
                self.crop(chunk, size);
                self.record(
                    HeapLogLevel::Trace,
                    "realloc",
                    "realloc_grow",
                    Some(addr),
                    Some(size),
                    "in_place",
                );
                return Ok(Some(addr));
            }
        }

        let moved = self.allocate("realloc", ALIGNMENT, size)?;
        let dst = self.offset_of(moved);
        self.region
            .copy_within(chunk + HEADER_SIZE, dst, header.size);
        self.release("realloc", addr);
        self.record(
            HeapLogLevel::Trace,
            "realloc",
            "realloc_move",
            Some(moved),
            Some(size),
            "moved",
        );
        Ok(Some(moved))
    }

    /// [`realloc`](Self::realloc) for `count` elements of `size` bytes,
    /// failing instead of wrapping on overflow.
    pub fn reallocarray(
        &mut self,
        addr: usize,
        count: usize,
        size: usize,
    ) -> Result<Option<usize>, AllocError> {
        let Some(total) = count.checked_mul(size) else {
            return Err(self.fail(
                "reallocarray",
                "reallocarray_overflow",
                Some(addr),
                AllocError::SizeOverflow { requested: size },
            ));
        };
        self.realloc(addr, total)
    }

    /// Usable bytes behind `addr`; may exceed the size originally requested.
    #[must_use]
    pub fn usable_size(&self, addr: usize) -> usize {
        self.chunk_at(addr)
            .map_or(0, |chunk| self.header(chunk).size)
    }

    /// Allocates `size` bytes aligned to `alignment`.
    pub fn aligned_alloc(&mut self, alignment: usize, size: usize) -> Result<usize, AllocError> {
        self.aligned("aligned_alloc", alignment, size)
    }

    /// Same contract as [`aligned_alloc`](Self::aligned_alloc); kept separate
    /// so lifecycle records name the entry point.
    pub fn posix_memalign(&mut self, alignment: usize, size: usize) -> Result<usize, AllocError> {
        self.aligned("posix_memalign", alignment, size)
    }

    pub fn memalign(&mut self, alignment: usize, size: usize) -> Result<usize, AllocError> {
        self.aligned("memalign", alignment, size)
    }

    /// Page-aligned allocation.
    pub fn valloc(&mut self, size: usize) -> Result<usize, AllocError> {
        let page_size = self.region.page_size();
        self.aligned("valloc", page_size, size)
    }

    /// Validates an alignment request: a non-zero power of two no larger
    /// than the page size.
    fn check_alignment(&self, alignment: usize) -> Result<usize, AllocError> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment { alignment });
        }
        let page_size = self.region.page_size();
        if alignment > page_size {
            return Err(AllocError::UnsupportedAlignment {
                alignment,
                page_size,
            });
        }
        Ok(alignment)
    }

    /// Copies `bytes` into user memory at `addr`.
    pub fn write_bytes(&mut self, addr: usize, bytes: &[u8]) {
        let offset = self.offset_of(addr);
        self.region.write_bytes(offset, bytes);
    }

    /// Copies user memory at `addr` into `out`.
    pub fn read_bytes(&self, addr: usize, out: &mut [u8]) {
        let offset = self.offset_of(addr);
        self.region.read_bytes(offset, out);
    }

    // -----------------------------------------------------------------------
    // Allocation internals
    // -----------------------------------------------------------------------

    fn aligned(
        &mut self,
        symbol: &'static str,
        alignment: usize,
        size: usize,
    ) -> Result<usize, AllocError> {
        let alignment = match self.check_alignment(alignment) {
            Ok(alignment) => alignment,
            Err(err) => return Err(self.fail(symbol, "bad_alignment", None, err)),
        };
        self.allocate(symbol, alignment, size)
    }

    fn allocate(
        &mut self,
        symbol: &'static str,
        alignment: usize,
        size: usize,
    ) -> Result<usize, AllocError> {
        let size = match request_size(size) {
            Ok(size) => size,
            Err(err) => return Err(self.fail(symbol, "size_overflow", None, err)),
        };
        let alignment = alignment.max(ALIGNMENT);

        let (offset, pad, path) = match self.best_fit(alignment, size) {
            Some((offset, pad)) => (offset, pad, "best_fit"),
            None => {
                // Room to carve a leading free chunk if the grown span is
                // not already aligned.
                let slack = if alignment > ALIGNMENT {
                    alignment + HEADER_SIZE + ALIGNMENT
                } else {
                    0
                };
                let Some(wanted) = size.checked_add(slack) else {
                    return Err(self.fail(
                        symbol,
                        "size_overflow",
                        None,
                        AllocError::SizeOverflow { requested: size },
                    ));
                };
                let chunk = self.extend(symbol, wanted)?;
                let header = self.header(chunk);
                let Some(pad) = self.fit(chunk, &header, alignment, size) else {
                    return Err(self.fail(
                        symbol,
                        "oom",
                        Some(size),
                        AllocError::OutOfMemory(RegionError::Exhausted { requested: wanted }),
                    ));
                };
                (chunk, pad, "extend")
            }
        };

        let chunk = self.claim(offset, pad, size);
        let addr = self.data_addr(chunk);
        self.record(
            HeapLogLevel::Trace,
            symbol,
            "alloc",
            Some(addr),
            Some(size),
            path,
        );
        Ok(addr)
    }

    /// Smallest free chunk that can hold `size` bytes at `alignment`.
    /// Ties go to the lowest address. Returns the chunk and the leading pad
    /// needed to reach the alignment.
    fn best_fit(&self, alignment: usize, size: usize) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, usize)> = None;
        let mut cursor = Some(self.first);
        while let Some(offset) = cursor {
            let header = self.header(offset);
            if let Some(pad) = self.fit(offset, &header, alignment, size)
                && best.is_none_or(|(_, _, best_size)| header.size < best_size)
            {
                best = Some((offset, pad, header.size));
            }
            cursor = header.next;
        }
        best.map(|(offset, pad, _)| (offset, pad))
    }

    /// Leading pad needed to serve the request from this chunk, if it can.
    ///
    /// A chunk whose data is already aligned needs no pad. Otherwise the pad
    /// must leave room for a free chunk of at least one alignment unit in
    /// front of the aligned data.
    fn fit(
        &self,
        offset: usize,
        header: &ChunkHeader,
        alignment: usize,
        size: usize,
    ) -> Option<usize> {
        if !header.free {
            return None;
        }
        let data = self.data_addr(offset);
        if data.is_multiple_of(alignment) {
            return (header.size >= size).then_some(0);
        }
        let target = align_up(data.checked_add(HEADER_SIZE + ALIGNMENT)?, alignment)?;
        let pad = target - data;
        (header.size >= pad.checked_add(size)?).then_some(pad)
    }

    /// Marks the chosen chunk in use, carving off the leading pad and any
    /// excess tail.
    fn claim(&mut self, offset: usize, pad: usize, size: usize) -> usize {
        let chunk = if pad == 0 {
            offset
        } else {
            self.split_front(offset, pad)
        };
        self.update(chunk, |header| header.free = false);
        self.crop(chunk, size);
        chunk
    }

    /// Splits a free chunk `pad` bytes in; the front stays free and the back
    /// is returned.
    fn split_front(&mut self, offset: usize, pad: usize) -> usize {
        let header = self.header(offset);
        let back = offset + pad;
        self.write(
            back,
            &ChunkHeader {
                size: header.size - pad,
                next: header.next,
                prev: Some(offset),
                free: header.free,
            },
        );
        if let Some(next) = header.next {
            self.update(next, |h| h.prev = Some(back));
        }
        self.write(
            offset,
            &ChunkHeader {
                size: pad - HEADER_SIZE,
                next: Some(back),
                prev: header.prev,
                free: true,
            },
        );
        back
    }

    /// Trims a chunk to exactly `size` bytes when the leftover can hold a
    /// header plus at least one alignment unit. The leftover becomes a free
    /// chunk, merged with its successor if that one is free too.
    fn crop(&mut self, offset: usize, size: usize) {
        let mut header = self.header(offset);
        let Some(leftover) = header.size.checked_sub(size + HEADER_SIZE) else {
            return;
        };
        if leftover < ALIGNMENT {
            return;
        }

        let rest = offset + HEADER_SIZE + size;
        self.write(
            rest,
            &ChunkHeader {
                size: leftover,
                next: header.next,
                prev: Some(offset),
                free: true,
            },
        );
        if let Some(next) = header.next {
            self.update(next, |h| h.prev = Some(rest));
        }
        header.size = size;
        header.next = Some(rest);
        self.write(offset, &header);

        if let Some(next) = self.header(rest).next
            && self.header(next).free
        {
            self.absorb_next(rest);
        }
    }

    /// Grows the region by at least `max(size, extend floor)` bytes rounded
    /// to whole pages. The old sentinel becomes a free chunk spanning the new
    /// bytes and a fresh sentinel closes the region. A free chunk directly in
    /// front absorbs the new one. Returns the resulting free chunk.
    fn extend(&mut self, symbol: &'static str, size: usize) -> Result<usize, AllocError> {
        let page_size = self.region.page_size();
        let floor = self.config.extend_pages.max(1).saturating_mul(page_size);
        let Some(grow) = size
            .max(floor)
            .checked_add(HEADER_SIZE)
            .and_then(|bytes| align_up(bytes, page_size))
        else {
            return Err(self.fail(
                symbol,
                "extend_overflow",
                Some(size),
                AllocError::OutOfMemory(RegionError::Overflow),
            ));
        };

        if let Err(err) = self.region.grow(grow) {
            return Err(self.fail(
                symbol,
                "extend_refused",
                Some(grow),
                AllocError::OutOfMemory(err),
            ));
        }

        let old = self.last;
        let new_last = old + grow;
        let prev = self.header(old).prev;
        self.write(
            old,
            &ChunkHeader {
                size: grow - HEADER_SIZE,
                next: Some(new_last),
                prev,
                free: true,
            },
        );
        self.write(new_last, &ChunkHeader::sentinel(Some(old)));
        self.last = new_last;
        self.growth_events += 1;

        let mut chunk = old;
        if let Some(prev) = prev
            && self.header(prev).free
        {
            self.absorb_next(prev);
            chunk = prev;
        }
        self.record(
            HeapLogLevel::Info,
            symbol,
            "extend",
            Some(self.data_addr(chunk)),
            Some(grow),
            "grown",
        );
        Ok(chunk)
    }

    // -----------------------------------------------------------------------
    // Deallocation internals
    // -----------------------------------------------------------------------

    fn release(&mut self, symbol: &'static str, addr: usize) {
        if addr == 0 {
            self.record(HeapLogLevel::Trace, symbol, "free_null", None, None, "noop");
            return;
        }
        let Some(mut chunk) = self.chunk_at(addr) else {
            self.record(
                HeapLogLevel::Warn,
                symbol,
                "unknown_free_pointer",
                Some(addr),
                None,
                "ignored",
            );
            return;
        };
        let mut header = self.header(chunk);
        if header.free {
            self.record(
                HeapLogLevel::Warn,
                symbol,
                "double_free_detected",
                Some(addr),
                Some(header.size),
                "ignored",
            );
            return;
        }
        header.free = true;
        self.write(chunk, &header);

        if let Some(prev) = header.prev
            && self.header(prev).free
        {
            self.absorb_next(prev);
            chunk = prev;
        }
        if let Some(next) = self.header(chunk).next
            && self.header(next).free
        {
            self.absorb_next(chunk);
        }
        self.record(
            HeapLogLevel::Trace,
            symbol,
            "free",
            Some(addr),
            Some(self.header(chunk).size),
            "success",
        );
    }

    /// Merges the successor of `left` into `left`.
    fn absorb_next(&mut self, left: usize) {
        let mut header = self.header(left);
        let Some(right) = header.next else {
            return;
        };
        let right_header = self.header(right);
        header.size += HEADER_SIZE + right_header.size;
        header.next = right_header.next;
        self.write(left, &header);
        if let Some(after) = right_header.next {
            self.update(after, |h| h.prev = Some(left));
        }
    }

    // -----------------------------------------------------------------------
    // Addressing and header access
    // -----------------------------------------------------------------------

    pub(super) fn header(&self, offset: usize) -> ChunkHeader {
        ChunkHeader::decode(&self.region.read_header(offset))
    }

    fn write(&mut self, offset: usize, header: &ChunkHeader) {
        self.region.write_header(offset, &header.encode());
    }

    fn update(&mut self, offset: usize, f: impl FnOnce(&mut ChunkHeader)) {
        let mut header = self.header(offset);
        f(&mut header);
        self.write(offset, &header);
    }

    /// Address of the first usable byte of the chunk at `offset`.
    pub(super) fn data_addr(&self, offset: usize) -> usize {
        self.region.base() + offset + HEADER_SIZE
    }

    /// Address of the chunk header at `offset`.
    pub(super) fn header_addr(&self, offset: usize) -> usize {
        self.region.base() + offset
    }

    fn offset_of(&self, addr: usize) -> usize {
        addr - self.region.base()
    }

    /// Chunk owning the user address, if it plausibly came from this heap.
    fn chunk_at(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.region.base() + HEADER_SIZE)?;
        (offset >= self.first && offset < self.last && offset.is_multiple_of(ALIGNMENT))
            .then_some(offset)
    }

    // -----------------------------------------------------------------------
    // Lifecycle log
    // -----------------------------------------------------------------------

    fn record(
        &mut self,
        level: HeapLogLevel,
        symbol: &'static str,
        event: &'static str,
        addr: Option<usize>,
        size: Option<usize>,
        outcome: &'static str,
    ) {
        if !self.log.enabled(level) {
            return;
        }
        self.log.push(HeapLogRecord {
            decision_id: 0,
            level,
            symbol,
            event,
            addr,
            size,
            outcome,
            heap_len: self.region.len(),
            growth_events: self.growth_events,
        });
    }

    fn fail(
        &mut self,
        symbol: &'static str,
        event: &'static str,
        size: Option<usize>,
        err: AllocError,
    ) -> AllocError {
        self.record(HeapLogLevel::Warn, symbol, event, None, size, "denied");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::region::{VEC_REGION_BASE, VecRegion};

    const PAGE: usize = 4096;

    fn heap_with(initial_pages: usize, extend_pages: usize, capacity: usize) -> Heap<VecRegion> {
        let config = HeapConfig::new()
            .with_initial_pages(initial_pages)
            .with_extend_pages(extend_pages)
            .with_log_threshold(Some(HeapLogLevel::Trace));
        Heap::new(VecRegion::new(PAGE, capacity), config).unwrap()
    }

    fn small_heap() -> Heap<VecRegion> {
        heap_with(1, 1, 64 * PAGE)
    }

    fn free_flags(heap: &Heap<VecRegion>) -> Vec<bool> {
        heap.chunks().map(|chunk| chunk.free).collect()
    }

    #[test]
    fn test_new_heap_layout() {
        let heap = small_heap();
        let chunks: Vec<_> = heap.chunks().collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].size, PAGE - 2 * HEADER_SIZE);
        assert!(chunks[0].free);
        assert_eq!(chunks[1].size, 0);
        assert!(!chunks[1].free);
        assert_eq!(chunks[1].offset, PAGE - HEADER_SIZE);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_initial_reservation_failure() {
        let region = VecRegion::new(PAGE, PAGE);
        let config = HeapConfig::new().with_initial_pages(2);
        assert!(matches!(
            Heap::new(region, config),
            Err(RegionError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_malloc_basic() {
        let mut heap = small_heap();
        let addr = heap.malloc(100).unwrap();
        assert_eq!(addr, VEC_REGION_BASE + HEADER_SIZE);
        assert_eq!(heap.usable_size(addr), 112);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_malloc_zero_returns_minimum_chunk() {
        let mut heap = small_heap();
        let a = heap.malloc(0).unwrap();
        let b = heap.malloc(0).unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.usable_size(a), ALIGNMENT);
    }

    #[test]
    fn test_malloc_overflow_is_rejected() {
        let mut heap = small_heap();
        assert!(matches!(
            heap.malloc(usize::MAX - 3),
            Err(AllocError::SizeOverflow { .. })
        ));
        assert_eq!(heap.growth_events(), 0);
    }

    #[test]
    fn test_every_allocation_is_aligned() {
        let mut heap = small_heap();
        for size in [1, 7, 16, 17, 33, 100, 255, 1000, 5000] {
            let addr = heap.malloc(size).unwrap();
            assert_eq!(addr % ALIGNMENT, 0, "size {size}");
            assert_eq!(heap.usable_size(addr) % ALIGNMENT, 0);
            assert!(heap.usable_size(addr) >= size);
        }
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_best_fit_picks_smallest_hole() {
        let mut heap = small_heap();
        let a = heap.malloc(256).unwrap();
        let _guard_a = heap.malloc(16).unwrap();
        let b = heap.malloc(64).unwrap();
        let _guard_b = heap.malloc(16).unwrap();
        let c = heap.malloc(128).unwrap();
        let _guard_c = heap.malloc(16).unwrap();
        heap.free(a);
        heap.free(b);
        heap.free(c);

        assert_eq!(heap.malloc(48).unwrap(), b);
        assert_eq!(heap.malloc(100).unwrap(), c);
        assert_eq!(heap.malloc(200).unwrap(), a);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_best_fit_tie_goes_to_lowest_address() {
        let mut heap = small_heap();
        let a = heap.malloc(64).unwrap();
        let _guard_a = heap.malloc(16).unwrap();
        let b = heap.malloc(64).unwrap();
        let _guard_b = heap.malloc(16).unwrap();
        heap.free(b);
        heap.free(a);
        assert_eq!(heap.malloc(64).unwrap(), a);
    }

    #[test]
    fn test_crop_keeps_small_leftover() {
        let mut heap = small_heap();
        let a = heap.malloc(64).unwrap();
        let _guard = heap.malloc(16).unwrap();
        heap.free(a);
        // A 48-byte request leaves 16 bytes: not enough for a header plus a unit.
        let again = heap.malloc(48).unwrap();
        assert_eq!(again, a);
        assert_eq!(heap.usable_size(again), 64);
    }

    #[test]
    fn test_crop_splits_when_leftover_fits() {
        let mut heap = small_heap();
        let a = heap.malloc(128).unwrap();
        let _guard = heap.malloc(16).unwrap();
        heap.free(a);
        let again = heap.malloc(64).unwrap();
        assert_eq!(again, a);
        assert_eq!(heap.usable_size(again), 64);
        let rest = heap.malloc(128 - 64 - HEADER_SIZE).unwrap();
        assert_eq!(rest, a + 64 + HEADER_SIZE);
    }

    #[test]
    fn test_free_coalesces_both_neighbours() {
        let mut heap = small_heap();
        let a = heap.malloc(32).unwrap();
        let b = heap.malloc(32).unwrap();
        let c = heap.malloc(32).unwrap();
        let _guard = heap.malloc(32).unwrap();
        heap.free(a);
        heap.free(c);
        assert_eq!(free_flags(&heap), [true, false, true, false, true, false]);
        heap.free(b);
        assert_eq!(free_flags(&heap), [true, false, true, false]);
        assert_eq!(heap.usable_size(a), 3 * 32 + 2 * HEADER_SIZE);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_free_everything_restores_single_chunk() {
        let mut heap = small_heap();
        let addrs: Vec<_> = (1..10).map(|i| heap.malloc(i * 24).unwrap()).collect();
        for addr in addrs.iter().rev().step_by(2) {
            heap.free(*addr);
        }
        for addr in addrs.iter().skip(1).step_by(2) {
            heap.free(*addr);
        }
        let chunks: Vec<_> = heap.chunks().collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].size, PAGE - 2 * HEADER_SIZE);
    }

    #[test]
    fn test_free_null_and_foreign_are_noops() {
        let mut heap = small_heap();
        heap.free(0);
        heap.free(0xDEAD_0000);
        heap.free(VEC_REGION_BASE + 3);
        heap.check_integrity().unwrap();
        let events: Vec<_> = heap.log().iter().map(|r| r.event).collect();
        assert!(events.contains(&"free_null"));
        assert!(events.contains(&"unknown_free_pointer"));
    }

    #[test]
    fn test_double_free_is_ignored() {
        let mut heap = small_heap();
        let a = heap.malloc(32).unwrap();
        let _b = heap.malloc(32).unwrap();
        heap.free(a);
        heap.free(a);
        heap.check_integrity().unwrap();
        assert!(
            heap.log()
                .iter()
                .any(|r| r.level == HeapLogLevel::Warn && r.event == "double_free_detected")
        );
    }

    #[test]
    fn test_extend_when_nothing_fits() {
        let mut heap = small_heap();
        let big = heap.malloc(2 * PAGE).unwrap();
        assert_eq!(heap.growth_events(), 1);
        assert!(heap.usable_size(big) >= 2 * PAGE);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_extend_floor_rounds_to_pages() {
        let mut heap = heap_with(1, 4, 64 * PAGE);
        let before = heap.region().len();
        heap.malloc(PAGE).unwrap();
        assert_eq!(heap.region().len() - before, 4 * PAGE + PAGE);
        let mut heap = heap_with(1, 4, 64 * PAGE);
        heap.malloc(8 * PAGE).unwrap();
        assert_eq!(heap.region().len(), PAGE + 9 * PAGE);
    }

    #[test]
    fn test_extend_merges_with_free_tail() {
        let mut heap = small_heap();
        let big = heap.malloc(2 * PAGE).unwrap();
        // The tail of the first page stayed free and was absorbed.
        assert_eq!(big, VEC_REGION_BASE + HEADER_SIZE);
        assert_eq!(heap.chunks().filter(|chunk| chunk.free).count(), 1);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_extend_keeps_existing_addresses() {
        let mut heap = small_heap();
        let a = heap.malloc(1000).unwrap();
        heap.write_bytes(a, &[0x5A; 1000]);
        let _big = heap.malloc(10 * PAGE).unwrap();
        let mut out = [0u8; 1000];
        heap.read_bytes(a, &mut out);
        assert!(out.iter().all(|&b| b == 0x5A));
        assert_eq!(heap.usable_size(a), 1008);
    }

    #[test]
    fn test_region_exhaustion_returns_oom() {
        let mut heap = heap_with(1, 1, 2 * PAGE);
        let err = heap.malloc(4 * PAGE).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory(_)));
        assert_eq!(heap.growth_events(), 0);
        heap.check_integrity().unwrap();
        assert!(heap.malloc(64).is_ok());
    }

    #[test]
    fn test_calloc_zeroes_reused_memory() {
        let mut heap = small_heap();
        let dirty = heap.malloc(256).unwrap();
        heap.write_bytes(dirty, &[0xFF; 256]);
        let _guard = heap.malloc(16).unwrap();
        heap.free(dirty);
        let zeroed = heap.calloc(32, 8).unwrap();
        assert_eq!(zeroed, dirty);
        let mut out = [0xAAu8; 256];
        heap.read_bytes(zeroed, &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_calloc_overflow() {
        let mut heap = small_heap();
        assert!(matches!(
            heap.calloc(usize::MAX, 2),
            Err(AllocError::SizeOverflow { .. })
        ));
        assert!(heap.calloc(0, 16).is_ok());
    }

    #[test]
    fn test_realloc_null_allocates() {
        let mut heap = small_heap();
        let addr = heap.realloc(0, 100).unwrap().unwrap();
        assert_eq!(heap.usable_size(addr), 112);
    }

    #[test]
    fn test_realloc_zero_size_frees() {
        let mut heap = small_heap();
        let addr = heap.malloc(100).unwrap();
        assert_eq!(heap.realloc(addr, 0), Ok(None));
        assert_eq!(heap.chunks().filter(|chunk| chunk.free).count(), 1);
    }

    #[test]
    fn test_realloc_shrink_keeps_address() {
        let mut heap = small_heap();
        let addr = heap.malloc(512).unwrap();
        let _guard = heap.malloc(16).unwrap();
        assert_eq!(heap.realloc(addr, 100), Ok(Some(addr)));
        assert_eq!(heap.usable_size(addr), 112);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_realloc_shrink_next_to_free_chunk_coalesces() {
        let mut heap = small_heap();
        let addr = heap.malloc(512).unwrap();
        // Successor is the free tail of the page.
        assert_eq!(heap.realloc(addr, 64), Ok(Some(addr)));
        assert_eq!(free_flags(&heap), [false, true, false]);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_realloc_grows_into_free_successor() {
        let mut heap = small_heap();
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(256).unwrap();
        let _guard = heap.malloc(16).unwrap();
        heap.free(b);
        assert_eq!(heap.realloc(a, 200), Ok(Some(a)));
        assert_eq!(heap.usable_size(a), 208);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_realloc_absorbs_whole_successor_including_header() {
        let mut heap = small_heap();
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        let _guard = heap.malloc(16).unwrap();
        heap.free(b);
        let target = 64 + HEADER_SIZE + 64;
        assert_eq!(heap.realloc(a, target), Ok(Some(a)));
        assert_eq!(heap.usable_size(a), target);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_realloc_moves_and_preserves_contents() {
        let mut heap = small_heap();
        let a = heap.malloc(40).unwrap();
        let pattern: Vec<u8> = (0..40).collect();
        heap.write_bytes(a, &pattern);
        let _blocker = heap.malloc(16).unwrap();
        let moved = heap.realloc(a, 400).unwrap().unwrap();
        assert_ne!(moved, a);
        let mut out = vec![0u8; 40];
        heap.read_bytes(moved, &mut out);
        assert_eq!(out, pattern);
        heap.check_integrity().unwrap();
        assert!(heap.log().iter().any(|r| r.event == "realloc_move"));
    }

    #[test]
    fn test_realloc_failure_leaves_original() {
        let mut heap = heap_with(1, 1, PAGE);
        let a = heap.malloc(64).unwrap();
        heap.write_bytes(a, &[7; 64]);
        let _blocker = heap.malloc(16).unwrap();
        assert!(matches!(
            heap.realloc(a, 8 * PAGE),
            Err(AllocError::OutOfMemory(_))
        ));
        let mut out = [0u8; 64];
        heap.read_bytes(a, &mut out);
        assert_eq!(out, [7; 64]);
        assert_eq!(heap.usable_size(a), 64);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_reallocarray_overflow() {
        let mut heap = small_heap();
        let a = heap.malloc(16).unwrap();
        assert!(matches!(
            heap.reallocarray(a, usize::MAX, 2),
            Err(AllocError::SizeOverflow { .. })
        ));
        assert_eq!(heap.usable_size(a), 16);
        let grown = heap.reallocarray(a, 10, 8).unwrap().unwrap();
        assert!(heap.usable_size(grown) >= 80);
    }

    #[test]
    fn test_usable_size_of_null_is_zero() {
        let heap = small_heap();
        assert_eq!(heap.usable_size(0), 0);
    }

    #[test]
    fn test_alignment_validation() {
        let mut heap = small_heap();
        assert_eq!(
            heap.posix_memalign(0, 16),
            Err(AllocError::InvalidAlignment { alignment: 0 })
        );
        assert_eq!(
            heap.posix_memalign(24, 16),
            Err(AllocError::InvalidAlignment { alignment: 24 })
        );
        assert_eq!(
            heap.aligned_alloc(2 * PAGE, 16),
            Err(AllocError::UnsupportedAlignment {
                alignment: 2 * PAGE,
                page_size: PAGE
            })
        );
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_aligned_alloc_honours_strict_alignment() {
        let mut heap = small_heap();
        let _skew = heap.malloc(16).unwrap();
        for alignment in [1, 8, 16, 32, 64, 256, 1024, PAGE] {
            let addr = heap.aligned_alloc(alignment, 48).unwrap();
            assert_eq!(addr % alignment, 0, "alignment {alignment}");
            assert!(heap.usable_size(addr) >= 48);
        }
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_aligned_alloc_leading_pad_is_reusable() {
        let mut heap = small_heap();
        let _skew = heap.malloc(16).unwrap();
        let addr = heap.aligned_alloc(1024, 64).unwrap();
        assert_eq!(addr % 1024, 0);
        let chunks: Vec<_> = heap.chunks().collect();
        assert!(chunks[1].free, "leading pad becomes a free chunk");
        let reuse = heap.malloc(chunks[1].size).unwrap();
        assert_eq!(reuse, chunks[1].data);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_aligned_alloc_through_growth() {
        let mut heap = small_heap();
        let filler = heap.malloc(PAGE - 2 * HEADER_SIZE).unwrap();
        assert_eq!(heap.usable_size(filler), PAGE - 2 * HEADER_SIZE);
        let addr = heap.posix_memalign(PAGE, 100).unwrap();
        assert_eq!(addr % PAGE, 0);
        assert_eq!(heap.growth_events(), 1);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn test_lifecycle_logs_cover_alloc_and_extend() {
        let mut heap = small_heap();
        let a = heap.malloc(64).unwrap();
        heap.free(a);
        heap.malloc(4 * PAGE).unwrap();
        let records: Vec<_> = std::iter::from_fn(|| heap.pop_log()).collect();
        assert!(records.iter().all(|r| r.decision_id > 0));
        assert!(records.iter().any(|r| r.event == "heap_init"));
        assert!(
            records
                .iter()
                .any(|r| r.event == "alloc" && r.outcome == "best_fit")
        );
        assert!(
            records
                .iter()
                .any(|r| r.level == HeapLogLevel::Info && r.event == "extend")
        );
        assert!(heap.log().is_empty());
    }

    #[test]
    fn test_invariants_under_deterministic_trace() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *state
        }

        let mut heap = heap_with(2, 1, 1 << 24);
        heap.set_log_threshold(None);
        let mut live: Vec<(usize, usize, u8)> = Vec::new();
        let mut rng = 0xA5A5_5A5A_DEAD_BEEFu64;

        for step in 0..1500u32 {
            let r = lcg(&mut rng);
            let tag = (step % 251) as u8;
            match r % 3 {
                0 => {
                    let size = ((r >> 8) as usize % 3000).max(1);
                    let addr = heap.malloc(size).unwrap();
                    heap.write_bytes(addr, &vec![tag; size]);
                    live.push((addr, size, tag));
                }
                1 if !live.is_empty() => {
                    let idx = (r as usize) % live.len();
                    let (addr, _, _) = live.swap_remove(idx);
                    heap.free(addr);
                }
                2 if !live.is_empty() => {
                    let idx = (r as usize) % live.len();
                    let (addr, size, old_tag) = live[idx];
                    let new_size = ((r >> 16) as usize) % 3000;
                    match heap.realloc(addr, new_size).unwrap() {
                        None => {
                            assert_eq!(new_size, 0);
                            live.swap_remove(idx);
                        }
                        Some(new_addr) => {
                            let kept = size.min(new_size);
                            let mut out = vec![0u8; kept];
                            heap.read_bytes(new_addr, &mut out);
                            assert!(out.iter().all(|&b| b == old_tag));
                            heap.write_bytes(new_addr, &vec![tag; new_size]);
                            live[idx] = (new_addr, new_size, tag);
                        }
                    }
                }
                _ => {}
            }
            heap.check_integrity().unwrap();
        }

        for (addr, size, tag) in live.drain(..) {
            let mut out = vec![0u8; size];
            heap.read_bytes(addr, &mut out);
            assert!(out.iter().all(|&b| b == tag));
            heap.free(addr);
        }
        assert_eq!(heap.chunks().filter(|chunk| chunk.free).count(), 1);
    }
}
