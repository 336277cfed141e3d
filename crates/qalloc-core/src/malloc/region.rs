//! Heap region abstraction.
//!
//! A region is one contiguous span of bytes that grows monotonically at its
//! high end and never moves. The heap addresses it by offset; `base()` maps
//! offsets to the addresses handed to callers.

use super::chunk::{HEADER_SIZE, RawHeader};
use super::error::RegionError;

/// Backing store for a [`Heap`](super::Heap).
///
/// Offsets passed to the accessors are always inside `0..len()`; the heap
/// never asks for bytes past the current end.
pub trait HeapRegion {
    /// Operating-system page size used for growth rounding.
    fn page_size(&self) -> usize;

    /// Address corresponding to offset zero.
    fn base(&self) -> usize;

    /// Current length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `bytes` to the end of the region. Existing bytes keep their
    /// offsets and addresses.
    fn grow(&mut self, bytes: usize) -> Result<(), RegionError>;

    fn read_header(&self, offset: usize) -> RawHeader;

    fn write_header(&mut self, offset: usize, raw: &RawHeader);

    /// Copies `len` bytes from `src` to `dst`; the ranges may overlap.
    fn copy_within(&mut self, src: usize, dst: usize, len: usize);

    fn fill(&mut self, offset: usize, len: usize, byte: u8);

    fn read_bytes(&self, offset: usize, out: &mut [u8]);

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]);
}

/// Simulated address of offset zero for [`VecRegion`]: page aligned and
/// above the zero page.
pub const VEC_REGION_BASE: usize = 0x1000;

/// Bounded in-process region backed by a `Vec<u8>`.
///
/// Addresses are logical (`VEC_REGION_BASE + offset`); growing past
/// `capacity` reports [`RegionError::Exhausted`], which stands in for the
/// operating system refusing to extend the heap.
#[derive(Debug, Clone)]
pub struct VecRegion {
    bytes: Vec<u8>,
    page_size: usize,
    capacity: usize,
    base: usize,
}

impl VecRegion {
    /// Creates an empty region that may grow up to `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two at least as large as a
    /// chunk header.
    #[must_use]
    pub fn new(page_size: usize, capacity: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        assert!(page_size >= 2 * HEADER_SIZE, "page size too small");
        Self {
            bytes: Vec::new(),
            page_size,
            capacity,
            base: VEC_REGION_BASE,
        }
    }

    /// Moves the simulated base address. Must be aligned to the page size.
    #[must_use]
    pub fn with_base(mut self, base: usize) -> Self {
        assert!(base.is_multiple_of(self.page_size), "base must be page aligned");
        self.base = base;
        self
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw view of the region contents.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl HeapRegion for VecRegion {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn base(&self) -> usize {
        self.base
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn grow(&mut self, bytes: usize) -> Result<(), RegionError> {
        let new_len = self
            .bytes
            .len()
            .checked_add(bytes)
            .ok_or(RegionError::Overflow)?;
        if new_len > self.capacity {
            return Err(RegionError::Exhausted { requested: bytes });
        }
        self.bytes.resize(new_len, 0);
        Ok(())
    }

    fn read_header(&self, offset: usize) -> RawHeader {
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&self.bytes[offset..offset + HEADER_SIZE]);
        raw
    }

    fn write_header(&mut self, offset: usize, raw: &RawHeader) {
        self.bytes[offset..offset + HEADER_SIZE].copy_from_slice(raw);
    }

    fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        self.bytes.copy_within(src..src + len, dst);
    }

    fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        self.bytes[offset..offset + len].fill(byte);
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.bytes[offset..offset + out.len()]);
    }

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_until_capacity() {
        let mut region = VecRegion::new(4096, 8192);
        assert!(region.is_empty());
        region.grow(4096).unwrap();
        region.grow(4096).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(
            region.grow(1),
            Err(RegionError::Exhausted { requested: 1 })
        );
        assert_eq!(region.len(), 8192);
    }

    #[test]
    fn growth_overflow_is_reported() {
        let mut region = VecRegion::new(4096, usize::MAX);
        region.grow(16).unwrap();
        assert_eq!(region.grow(usize::MAX), Err(RegionError::Overflow));
    }

    #[test]
    fn byte_accessors_round_trip() {
        let mut region = VecRegion::new(4096, 4096);
        region.grow(4096).unwrap();
        region.write_bytes(100, &[1, 2, 3, 4]);
        region.copy_within(100, 102, 4);
        let mut out = [0u8; 6];
        region.read_bytes(100, &mut out);
        assert_eq!(out, [1, 2, 1, 2, 3, 4]);
        region.fill(100, 3, 0xAA);
        region.read_bytes(100, &mut out);
        assert_eq!(out, [0xAA, 0xAA, 0xAA, 2, 3, 4]);
    }

    #[test]
    fn base_is_page_aligned() {
        let region = VecRegion::new(4096, 4096);
        assert_eq!(region.base() % region.page_size(), 0);
        let moved = region.with_base(0x7000_0000);
        assert_eq!(moved.base(), 0x7000_0000);
    }
}
