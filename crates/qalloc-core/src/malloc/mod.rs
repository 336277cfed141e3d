//! Memory allocation.
//!
//! Best-fit allocator over a single growable region:
//! - `chunk`: header layout and size normalization
//! - `region`: the memory the heap lives in
//! - `heap`: chunk-list algorithms (best fit, split, coalesce, grow)
//! - `check`: introspection and integrity checking
//! - `allocator`: the locked, lazily initialized process-wide instance

pub mod allocator;
pub mod check;
pub mod chunk;
pub mod error;
pub mod heap;
pub mod log;
pub mod region;

pub use allocator::Allocator;
pub use check::{ChunkView, Chunks, CorruptionKind, HeapCorruption, HeapStats};
pub use chunk::{ALIGNMENT, HEADER_SIZE};
pub use error::{AllocError, RegionError};
pub use heap::Heap;
pub use log::{HeapLogLevel, HeapLogRecord, LOG_CAPACITY, LogRing};
pub use region::{HeapRegion, VEC_REGION_BASE, VecRegion};
