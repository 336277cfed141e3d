// All extern "C" ABI exports accept raw pointers from C callers with the
// usual malloc-family contracts; per-function safety docs would repeat them.
#![allow(clippy::missing_safety_doc)]
//! # qalloc-abi
//!
//! ABI-compatible extern "C" boundary for qalloc.
//!
//! This crate produces a `cdylib` (`libqalloc.so`) that can be preloaded or
//! linked to replace the malloc family. Each export forwards to the safe heap
//! in `qalloc-core`, running over memory taken from the program break.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> futex guard -> Heap<SbrkRegion> -> return
//! ```
//!
//! Everything reachable from an export is allocation-free: the guard is a
//! raw futex, configuration is read with `getenv` into a stack buffer, and
//! diagnostics are written straight to file descriptor 2.

// Helpers only reached from the exports, which are compiled out under test.
#[cfg_attr(test, allow(dead_code))]
mod config;
#[cfg_attr(test, allow(dead_code))]
mod diag;
#[cfg_attr(test, allow(dead_code))]
mod errno;
mod guard;
mod region;

// Gated behind cfg(not(test)) because these exports (malloc, free, ...) would
// shadow the system allocator in the test binary, causing infinite recursion
// or deadlock.
#[cfg(not(test))]
pub mod malloc_abi;

pub use guard::FutexMutex;
pub use region::{SbrkRegion, page_size};
