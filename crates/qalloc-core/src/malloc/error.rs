//! Allocation and region error types.

use thiserror::Error;

use crate::errno::{EINVAL, ENOMEM};

/// Failure reported by a [`HeapRegion`](super::HeapRegion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("region cannot grow by {requested} bytes")]
    Exhausted { requested: usize },
    #[error("region end moved from {expected:#x} to {found:#x}; growth is no longer contiguous")]
    Discontiguous { expected: usize, found: usize },
    #[error("region size arithmetic overflowed")]
    Overflow,
}

/// Failure of an allocation entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("request of {requested} bytes overflows the representable size")]
    SizeOverflow { requested: usize },
    #[error("out of memory: {0}")]
    OutOfMemory(RegionError),
    #[error("alignment {alignment} is not a non-zero power of two")]
    InvalidAlignment { alignment: usize },
    #[error("alignment {alignment} exceeds the page size {page_size}")]
    UnsupportedAlignment { alignment: usize, page_size: usize },
    #[error("heap initialization failed: {0}")]
    HeapInit(RegionError),
}

impl AllocError {
    /// The errno a C caller observes for this failure.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::SizeOverflow { .. } | Self::OutOfMemory(_) | Self::HeapInit(_) => ENOMEM,
            Self::InvalidAlignment { .. } | Self::UnsupportedAlignment { .. } => EINVAL,
        }
    }

    /// Returns true for failures the process cannot continue past.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::HeapInit(_))
    }
}
