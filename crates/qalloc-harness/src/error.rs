//! Harness error type.

use qalloc_core::{AllocError, HeapCorruption};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allocation failed at step {step}: {source}")]
    Alloc {
        step: usize,
        #[source]
        source: AllocError,
    },
    #[error("heap integrity violated after step {step}: {source}")]
    Corruption {
        step: usize,
        #[source]
        source: HeapCorruption,
    },
    #[error("block {addr:#x} lost its contents by step {step}")]
    ContentMismatch { step: usize, addr: usize },
    #[error("scenario check failed: {0}")]
    Scenario(String),
    #[error("invalid log line {line}: {reason}")]
    InvalidLog { line: usize, reason: String },
}
