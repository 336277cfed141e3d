//! Verification harness for the qalloc heap.
//!
//! This crate provides:
//! - Allocation storms: seeded randomized workloads with content and
//!   integrity checks after every step, summarized as a JSON report
//! - The reuse/growth scenario: a fixed sequence that pins down best-fit
//!   reuse and single-step growth
//! - Lifecycle log export: the heap's structured records as JSONL

#![forbid(unsafe_code)]

pub mod error;
pub mod scenario;
pub mod storm;
pub mod structured_log;

pub use error::HarnessError;
pub use scenario::{ScenarioReport, run_reuse_scenario};
pub use storm::{
    StatsSnapshot, StormConfig, StormReport, StormType, XorShift64, run_storm, run_storm_with_log,
    run_threaded_storm,
};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, validate_log, validate_log_line};
