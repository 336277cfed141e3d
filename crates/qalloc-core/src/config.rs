//! Heap configuration.
//!
//! Sizing and policy knobs are read from the environment by the ABI layer:
//! - `QALLOC_INITIAL_PAGES`: pages reserved when the heap is created (default 256).
//! - `QALLOC_EXTEND_PAGES`: minimum growth step in pages (default 16).
//! - `QALLOC_OVERALIGN`: `abort` (default) or `reject` for alignment requests
//!   larger than the page size.
//! - `QALLOC_LOG`: lifecycle log threshold (`off`, `error`, `warn`, `info`,
//!   `debug`, `trace`). Records at or above the threshold go to stderr.
//! - `QALLOC_CHECK`: `1`/`on` runs the integrity checker after every
//!   mutating call.
//!
//! Unknown or malformed values fall back to the defaults.

use crate::malloc::HeapLogLevel;

/// Pages reserved for the initial region.
pub const DEFAULT_INITIAL_PAGES: usize = 256;
/// Minimum growth step in pages.
pub const DEFAULT_EXTEND_PAGES: usize = 16;

pub const ENV_INITIAL_PAGES: &str = "QALLOC_INITIAL_PAGES";
pub const ENV_EXTEND_PAGES: &str = "QALLOC_EXTEND_PAGES";
pub const ENV_OVERALIGN: &str = "QALLOC_OVERALIGN";
pub const ENV_LOG: &str = "QALLOC_LOG";
pub const ENV_CHECK: &str = "QALLOC_CHECK";

/// What to do with an alignment request larger than the page size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OveralignPolicy {
    /// Treat it as an unrecoverable configuration error and terminate.
    #[default]
    Abort,
    /// Report `EINVAL` (or a null pointer) and keep running.
    Reject,
}

impl OveralignPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        if matches_any(s, &["reject", "einval", "error", "soft"]) {
            Self::Reject
        } else {
            Self::Abort
        }
    }

    /// Returns true if an oversized alignment terminates the process.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Abort)
    }
}

/// Resolved heap configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Pages reserved when the heap is created.
    pub initial_pages: usize,
    /// Growth floor in pages; every extension is at least this large.
    pub extend_pages: usize,
    /// Handling of alignments above the page size.
    pub overalign: OveralignPolicy,
    /// Lowest level recorded in the lifecycle log, `None` disables it.
    pub log_threshold: Option<HeapLogLevel>,
    /// Run the integrity checker after every mutating entry point.
    pub check_every_op: bool,
}

impl HeapConfig {
    /// Defaults matching the historical constants.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_pages: DEFAULT_INITIAL_PAGES,
            extend_pages: DEFAULT_EXTEND_PAGES,
            overalign: OveralignPolicy::Abort,
            log_threshold: None,
            check_every_op: false,
        }
    }

    /// Builds a configuration from a key lookup (normally the environment).
    #[must_use]
    pub fn from_lookup<'a>(lookup: impl Fn(&str) -> Option<&'a str>) -> Self {
        let mut config = Self::new();
        if let Some(pages) = lookup(ENV_INITIAL_PAGES).and_then(parse_pages) {
            config.initial_pages = pages;
        }
        if let Some(pages) = lookup(ENV_EXTEND_PAGES).and_then(parse_pages) {
            config.extend_pages = pages;
        }
        if let Some(raw) = lookup(ENV_OVERALIGN) {
            config.overalign = OveralignPolicy::from_str_loose(raw);
        }
        if let Some(raw) = lookup(ENV_LOG) {
            config.log_threshold = parse_log_threshold(raw);
        }
        if let Some(raw) = lookup(ENV_CHECK) {
            config.check_every_op = parse_flag(raw);
        }
        config
    }

    #[must_use]
    pub const fn with_initial_pages(mut self, pages: usize) -> Self {
        self.initial_pages = if pages == 0 { 1 } else { pages };
        self
    }

    #[must_use]
    pub const fn with_extend_pages(mut self, pages: usize) -> Self {
        self.extend_pages = if pages == 0 { 1 } else { pages };
        self
    }

    #[must_use]
    pub const fn with_overalign(mut self, policy: OveralignPolicy) -> Self {
        self.overalign = policy;
        self
    }

    #[must_use]
    pub const fn with_log_threshold(mut self, threshold: Option<HeapLogLevel>) -> Self {
        self.log_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_check_every_op(mut self, enabled: bool) -> Self {
        self.check_every_op = enabled;
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_pages(raw: &str) -> Option<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => None,
        Ok(pages) => Some(pages),
    }
}

// Runs inside the allocator's bootstrap path: must not allocate.
fn matches_any(raw: &str, candidates: &[&str]) -> bool {
    let raw = raw.trim();
    candidates
        .iter()
        .any(|candidate| raw.eq_ignore_ascii_case(candidate))
}

fn parse_log_threshold(raw: &str) -> Option<HeapLogLevel> {
    if matches_any(raw, &["trace", "all"]) {
        Some(HeapLogLevel::Trace)
    } else if matches_any(raw, &["debug"]) {
        Some(HeapLogLevel::Debug)
    } else if matches_any(raw, &["info", "1", "on"]) {
        Some(HeapLogLevel::Info)
    } else if matches_any(raw, &["warn", "warning"]) {
        Some(HeapLogLevel::Warn)
    } else if matches_any(raw, &["error"]) {
        Some(HeapLogLevel::Error)
    } else {
        None
    }
}

fn parse_flag(raw: &str) -> bool {
    matches_any(raw, &["1", "on", "yes", "true"])
}
