//! Program-break backed heap region.

use std::ffi::c_void;
use std::ptr;

use qalloc_core::HEADER_SIZE;
use qalloc_core::malloc::RegionError;
use qalloc_core::malloc::chunk::{RawHeader, align_up};
use qalloc_core::malloc::HeapRegion;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Operating-system page size, or 4 KiB if it cannot be queried.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    match usize::try_from(raw) {
        Ok(size) if size.is_power_of_two() && size >= 2 * HEADER_SIZE => size,
        _ => FALLBACK_PAGE_SIZE,
    }
}

fn sbrk(increment: isize) -> Option<usize> {
    // SAFETY: sbrk only moves the program break; callers never release memory
    // they have handed out.
    let previous = unsafe { libc::sbrk(increment as libc::intptr_t) };
    (previous != usize::MAX as *mut c_void).then_some(previous as usize)
}

/// Region living directly above the program break.
///
/// The start is page aligned so every chunk data address is aligned to the
/// allocator's alignment unit. Growth only succeeds while nobody else has
/// moved the break since the last growth; otherwise the region would no
/// longer be contiguous.
#[derive(Debug)]
pub struct SbrkRegion {
    base: usize,
    len: usize,
    page_size: usize,
}

impl SbrkRegion {
    /// Claims the current break, padding it up to a page boundary.
    pub fn acquire() -> Result<Self, RegionError> {
        let page_size = page_size();
        let current = sbrk(0).ok_or(RegionError::Exhausted { requested: 0 })?;
        let base = align_up(current, page_size).ok_or(RegionError::Overflow)?;
        let pad = base - current;
        if pad > 0 {
            let found = sbrk(pad as isize).ok_or(RegionError::Exhausted { requested: pad })?;
            if found != current {
                return Err(RegionError::Discontiguous {
                    expected: current,
                    found,
                });
            }
        }
        Ok(Self {
            base,
            len: 0,
            page_size,
        })
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        (self.base + offset) as *mut u8
    }
}

impl HeapRegion for SbrkRegion {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn base(&self) -> usize {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }

    fn grow(&mut self, bytes: usize) -> Result<(), RegionError> {
        let expected = self.base.checked_add(self.len).ok_or(RegionError::Overflow)?;
        let new_len = self.len.checked_add(bytes).ok_or(RegionError::Overflow)?;
        let increment = isize::try_from(bytes).map_err(|_| RegionError::Overflow)?;
        let found = sbrk(increment).ok_or(RegionError::Exhausted { requested: bytes })?;
        if found != expected {
            // The new bytes sit somewhere else; they stay unused.
            return Err(RegionError::Discontiguous { expected, found });
        }
        self.len = new_len;
        Ok(())
    }

    fn read_header(&self, offset: usize) -> RawHeader {
        // SAFETY: the heap only reads headers at offsets inside `0..len`, all
        // of which belong to this region.
        unsafe { ptr::read(self.ptr(offset).cast::<RawHeader>()) }
    }

    fn write_header(&mut self, offset: usize, raw: &RawHeader) {
        // SAFETY: as for `read_header`; the bytes are owned by the region.
        unsafe { ptr::write(self.ptr(offset).cast::<RawHeader>(), *raw) }
    }

    fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        // SAFETY: both ranges are inside the region; `ptr::copy` permits overlap.
        unsafe { ptr::copy(self.ptr(src), self.ptr(dst), len) }
    }

    fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        // SAFETY: the range is inside the region.
        unsafe { ptr::write_bytes(self.ptr(offset), byte, len) }
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        // SAFETY: the source range is inside the region and cannot alias `out`,
        // which the caller owns.
        unsafe { ptr::copy_nonoverlapping(self.ptr(offset), out.as_mut_ptr(), out.len()) }
    }

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        // SAFETY: as for `read_bytes`, in the other direction.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr(offset), bytes.len()) }
    }
}
