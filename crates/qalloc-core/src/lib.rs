//! # qalloc-core
//!
//! Safe Rust core of the qalloc heap allocator.
//!
//! The allocator manages a single contiguous region that only ever grows. The
//! region is partitioned by an address-ordered, doubly linked list of chunk
//! headers ending in a zero-size sentinel. Allocation is a best-fit scan
//! followed by splitting; deallocation coalesces with both neighbours.
//!
//! Memory is never touched directly: every read and write goes through a
//! [`HeapRegion`](malloc::HeapRegion), and chunks are identified by offsets
//! into that region. The ABI crate supplies the program-break backed region;
//! tests, the harness and benches use the in-process
//! [`VecRegion`](malloc::VecRegion).
//!
//! No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod malloc;

pub use config::{HeapConfig, OveralignPolicy};
pub use malloc::{
    ALIGNMENT, AllocError, Allocator, ChunkView, HEADER_SIZE, Heap, HeapCorruption, HeapLogLevel,
    HeapLogRecord, HeapRegion, HeapStats, RegionError, VecRegion,
};
