//! ABI layer for the malloc family (`malloc`, `free`, `calloc`, `realloc`,
//! `reallocarray`, `malloc_usable_size`, `aligned_alloc`, `posix_memalign`,
//! `memalign`, `valloc`) plus the `qalloc_check_heap` / `qalloc_dump_heap`
//! diagnostics.
//!
//! Every entry point goes through one process-wide [`Allocator`] over the
//! program break. Its futex guard serializes all heap mutation; the heap is
//! built inside the guard by the first request.
//!
//! Failures follow the C contract: a null pointer (or a status code for
//! `posix_memalign`) with errno set to `ENOMEM` or `EINVAL`. Heap
//! initialization failure, corruption found by the checker, and alignments
//! above the page size under the default `abort` policy terminate the
//! process after printing a diagnostic.
//!
//! In test mode, this module is suppressed to avoid shadowing the system
//! allocator (which would cause infinite recursion in the test binary
//! itself).

use std::ffi::{c_int, c_void};

use qalloc_core::malloc::RegionError;
use qalloc_core::{AllocError, Allocator, Heap};

use crate::config::heap_config;
use crate::diag::{self, StderrWriter};
use crate::errno::set_errno;
use crate::guard::FutexMutex;
use crate::region::SbrkRegion;

static ALLOCATOR: Allocator<SbrkRegion, FutexMutex> = Allocator::new(bootstrap);

fn bootstrap() -> Result<Heap<SbrkRegion>, RegionError> {
    Heap::new(SbrkRegion::acquire()?, heap_config())
}

/// Applies the failure policy and returns the errno to report.
fn reject(err: AllocError) -> c_int {
    if err.is_fatal() {
        diag::fatal(format_args!("{err}"));
    }
    if matches!(err, AllocError::UnsupportedAlignment { .. }) && heap_config().overalign.is_fatal()
    {
        diag::fatal(format_args!("{err}"));
    }
    err.errno()
}

/// Post-call housekeeping: flush lifecycle records, then verify the heap
/// when per-call checking is enabled.
fn settle() {
    let config = heap_config();
    if config.log_threshold.is_some() {
        ALLOCATOR.drain_logs(|record| diag::emit_record(&record));
    }
    if config.check_every_op
        && let Err(err) = ALLOCATOR.check_integrity()
    {
        diag::fatal_corruption(&err);
    }
}

fn to_ptr(result: Result<usize, AllocError>) -> *mut c_void {
    let out = match result {
        Ok(addr) => addr as *mut c_void,
        Err(err) => {
            set_errno(reject(err));
            std::ptr::null_mut()
        }
    };
    settle();
    out
}

fn resized_ptr(result: Result<Option<usize>, AllocError>) -> *mut c_void {
    to_ptr(result.map(|addr| addr.unwrap_or(0)))
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    to_ptr(ALLOCATOR.malloc(size))
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    ALLOCATOR.free(ptr as usize);
    settle();
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    to_ptr(ALLOCATOR.calloc(nmemb, size))
}

/// `realloc(NULL, n)` allocates; `realloc(p, 0)` frees `p` and returns null.
/// On failure `ptr` stays valid.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    resized_ptr(ALLOCATOR.realloc(ptr as usize, size))
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn reallocarray(ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void {
    resized_ptr(ALLOCATOR.reallocarray(ptr as usize, nmemb, size))
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    ALLOCATOR.usable_size(ptr as usize)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    to_ptr(ALLOCATOR.aligned_alloc(alignment, size))
}

/// Stores an allocation aligned to `alignment` in `*memptr` and returns 0,
/// or returns `EINVAL`/`ENOMEM` without touching `*memptr`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    let rc = match ALLOCATOR.posix_memalign(alignment, size) {
        Ok(addr) => {
            // SAFETY: caller guarantees `memptr` is a valid out-pointer.
            unsafe { *memptr = addr as *mut c_void };
            0
        }
        Err(err) => reject(err),
    };
    settle();
    rc
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    to_ptr(ALLOCATOR.memalign(alignment, size))
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    to_ptr(ALLOCATOR.valloc(size))
}

/// Walks the heap in both directions. Returns 0 when it is consistent;
/// otherwise prints the offending chunks and aborts.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn qalloc_check_heap() -> c_int {
    if let Err(err) = ALLOCATOR.check_integrity() {
        diag::fatal_corruption(&err);
    }
    0
}

/// Prints every chunk to stderr.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn qalloc_dump_heap() {
    ALLOCATOR.with_existing(|heap| {
        // Nowhere to report a failed write to stderr.
        let _ = heap.dump(&mut StderrWriter);
    });
}
