//! Structured allocator lifecycle log.
//!
//! Records are plain `Copy` values kept in a fixed-capacity ring inside the
//! heap, so logging never allocates while the heap guard is held. When the
//! ring is full the oldest record is overwritten and counted as dropped.

use std::fmt;

/// Number of records retained before the oldest are overwritten.
pub const LOG_CAPACITY: usize = 128;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeapLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl HeapLogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Severity level.
    pub level: HeapLogLevel,
    /// API symbol (`malloc`, `free`, `realloc`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `extend`, ...).
    pub event: &'static str,
    /// User address involved in the event.
    pub addr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Snapshot: region length in bytes.
    pub heap_len: usize,
    /// Snapshot: number of growth events so far.
    pub growth_events: u64,
}

impl HeapLogRecord {
    /// Correlation id rendered as `core::malloc::<symbol>::<decision id>`.
    #[must_use]
    pub fn trace_id(&self) -> TraceId<'_> {
        TraceId(self)
    }
}

/// Display adapter for [`HeapLogRecord::trace_id`].
pub struct TraceId<'a>(&'a HeapLogRecord);

impl fmt::Display for TraceId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "core::malloc::{}::{:016x}",
            self.0.symbol, self.0.decision_id
        )
    }
}

impl fmt::Display for HeapLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} event={} outcome={}",
            self.level.as_str(),
            self.trace_id(),
            self.event,
            self.outcome
        )?;
        if let Some(addr) = self.addr {
            write!(f, " addr={addr:#x}")?;
        }
        if let Some(size) = self.size {
            write!(f, " size={size}")?;
        }
        write!(
            f,
            " heap_len={} growth_events={}",
            self.heap_len, self.growth_events
        )
    }
}

/// Fixed-capacity ring of lifecycle records.
#[derive(Debug, Clone)]
pub struct LogRing {
    records: [Option<HeapLogRecord>; LOG_CAPACITY],
    head: usize,
    len: usize,
    next_decision_id: u64,
    dropped: u64,
    threshold: Option<HeapLogLevel>,
}

impl LogRing {
    /// Creates a ring that keeps records at or above `threshold`.
    #[must_use]
    pub const fn new(threshold: Option<HeapLogLevel>) -> Self {
        Self {
            records: [None; LOG_CAPACITY],
            head: 0,
            len: 0,
            next_decision_id: 1,
            dropped: 0,
            threshold,
        }
    }

    #[must_use]
    pub const fn threshold(&self) -> Option<HeapLogLevel> {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: Option<HeapLogLevel>) {
        self.threshold = threshold;
    }

    #[must_use]
    pub fn enabled(&self, level: HeapLogLevel) -> bool {
        self.threshold.is_some_and(|threshold| level >= threshold)
    }

    /// Stores a record, assigning its decision id. Records below the
    /// threshold are discarded without consuming an id.
    pub fn push(&mut self, mut record: HeapLogRecord) {
        if !self.enabled(record.level) {
            return;
        }
        record.decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);

        let tail = (self.head + self.len) % LOG_CAPACITY;
        self.records[tail] = Some(record);
        if self.len == LOG_CAPACITY {
            self.head = (self.head + 1) % LOG_CAPACITY;
            self.dropped += 1;
        } else {
            self.len += 1;
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records overwritten before they were drained.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Oldest-first view of the retained records.
    pub fn iter(&self) -> impl Iterator<Item = &HeapLogRecord> + '_ {
        (0..self.len).filter_map(move |i| self.records[(self.head + i) % LOG_CAPACITY].as_ref())
    }

    /// Removes and returns the oldest record.
    pub fn pop(&mut self) -> Option<HeapLogRecord> {
        if self.len == 0 {
            return None;
        }
        let record = self.records[self.head].take();
        self.head = (self.head + 1) % LOG_CAPACITY;
        self.len -= 1;
        record
    }
}
