//! JSONL export of heap lifecycle records.
//!
//! Provides:
//! - [`LogEntry`]: one serialized [`HeapLogRecord`].
//! - [`LogEmitter`]: writes JSONL lines to any writer.
//! - [`validate_log_line`] / [`validate_log`]: schema checks for exported logs.

use std::io::Write;

use clap::ValueEnum;
use qalloc_core::{HeapLogLevel, HeapLogRecord};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

const TRACE_PREFIX: &str = "core::malloc::";

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<HeapLogLevel> for LogLevel {
    fn from(level: HeapLogLevel) -> Self {
        match level {
            HeapLogLevel::Trace => Self::Trace,
            HeapLogLevel::Debug => Self::Debug,
            HeapLogLevel::Info => Self::Info,
            HeapLogLevel::Warn => Self::Warn,
            HeapLogLevel::Error => Self::Error,
        }
    }
}

impl From<LogLevel> for HeapLogLevel {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::Trace,
            LogLevel::Debug => Self::Debug,
            LogLevel::Info => Self::Info,
            LogLevel::Warn => Self::Warn,
            LogLevel::Error => Self::Error,
        }
    }
}

/// Canonical structured log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub trace_id: String,
    pub decision_id: u64,
    pub level: LogLevel,
    pub symbol: String,
    pub event: String,
    pub outcome: String,
    /// Hex-formatted address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    pub heap_len: usize,
    pub growth_events: u64,
}

impl From<&HeapLogRecord> for LogEntry {
    fn from(record: &HeapLogRecord) -> Self {
        Self {
            trace_id: record.trace_id().to_string(),
            decision_id: record.decision_id,
            level: record.level.into(),
            symbol: record.symbol.to_owned(),
            event: record.event.to_owned(),
            outcome: record.outcome.to_owned(),
            addr: record.addr.map(|addr| format!("{addr:#x}")),
            size: record.size,
            heap_len: record.heap_len,
            growth_events: record.growth_events,
        }
    }
}

impl LogEntry {
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Writes entries as one JSON object per line.
pub struct LogEmitter<W: Write> {
    out: W,
    lines: usize,
}

impl<W: Write> LogEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out, lines: 0 }
    }

    pub fn emit(&mut self, entry: &LogEntry) -> Result<(), HarnessError> {
        let line = entry.to_jsonl()?;
        writeln!(self.out, "{line}")?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Parses one line and checks that its trace id matches its symbol and
/// decision id.
pub fn validate_log_line(line: &str, line_no: usize) -> Result<LogEntry, HarnessError> {
    let entry: LogEntry = serde_json::from_str(line).map_err(|err| HarnessError::InvalidLog {
        line: line_no,
        reason: err.to_string(),
    })?;
    let expected = format!(
        "{TRACE_PREFIX}{}::{:016x}",
        entry.symbol, entry.decision_id
    );
    if entry.trace_id != expected {
        return Err(HarnessError::InvalidLog {
            line: line_no,
            reason: format!("trace_id {} does not match {expected}", entry.trace_id),
        });
    }
    Ok(entry)
}

/// Validates a whole JSONL document. Decision ids must strictly increase.
pub fn validate_log(content: &str) -> Result<Vec<LogEntry>, HarnessError> {
    let mut entries: Vec<LogEntry> = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = validate_log_line(line, idx + 1)?;
        if let Some(prev) = entries.last()
            && entry.decision_id <= prev.decision_id
        {
            return Err(HarnessError::InvalidLog {
                line: idx + 1,
                reason: format!(
                    "decision_id {} does not follow {}",
                    entry.decision_id, prev.decision_id
                ),
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}
