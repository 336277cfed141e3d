//! Fixed reuse and growth scenario.
//!
//! Three blocks A (32), B (64) and C (32) are laid out in address order and
//! the rest of the initial region is filled. Freeing B and asking for 64
//! bytes must hand back B's span without growing. Freeing A and C then
//! leaves two isolated 32-byte spans, so a 200-byte request must grow the
//! region exactly once.

use qalloc_core::{AllocError, Heap, HeapConfig, HeapLogLevel, HeapStats, VecRegion};
use serde::Serialize;

use crate::error::HarnessError;
use crate::storm::StatsSnapshot;
use crate::structured_log::LogEntry;

const PAGE: usize = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioStep {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    pub growth_events: u64,
    pub free_chunks: usize,
    pub largest_free: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub steps: Vec<ScenarioStep>,
    pub reused_in_place: bool,
    pub growth_for_large: u64,
    pub final_stats: StatsSnapshot,
    pub log: Vec<LogEntry>,
}

struct Recorder {
    heap: Heap<VecRegion>,
    steps: Vec<ScenarioStep>,
    log: Vec<LogEntry>,
}

impl Recorder {
    fn malloc(&mut self, name: &'static str, size: usize) -> Result<usize, HarnessError> {
        let step = self.steps.len();
        let addr = self
            .heap
            .malloc(size)
            .map_err(|source| HarnessError::Alloc { step, source })?;
        self.note(name, Some(addr))?;
        Ok(addr)
    }

    fn free(&mut self, name: &'static str, addr: usize) -> Result<(), HarnessError> {
        self.heap.free(addr);
        self.note(name, Some(addr))
    }

    fn note(&mut self, name: &'static str, addr: Option<usize>) -> Result<(), HarnessError> {
        let step = self.steps.len();
        self.heap
            .check_integrity()
            .map_err(|source| HarnessError::Corruption { step, source })?;
        while let Some(record) = self.heap.pop_log() {
            self.log.push(LogEntry::from(&record));
        }
        let stats = self.heap.stats();
        self.steps.push(ScenarioStep {
            name,
            addr: addr.map(|addr| format!("{addr:#x}")),
            growth_events: stats.growth_events,
            free_chunks: stats.free_chunks,
            largest_free: stats.largest_free,
        });
        Ok(())
    }

    fn stats(&self) -> HeapStats {
        self.heap.stats()
    }
}

fn expect(cond: bool, what: impl FnOnce() -> String) -> Result<(), HarnessError> {
    if cond {
        Ok(())
    } else {
        Err(HarnessError::Scenario(what()))
    }
}

/// Runs the scenario on a one-page heap and checks every expectation.
pub fn run_reuse_scenario() -> Result<ScenarioReport, HarnessError> {
    let config = HeapConfig::new()
        .with_initial_pages(1)
        .with_extend_pages(1)
        .with_log_threshold(Some(HeapLogLevel::Trace));
    let heap = Heap::new(VecRegion::new(PAGE, 1 << 20), config).map_err(|err| {
        HarnessError::Alloc {
            step: 0,
            source: AllocError::HeapInit(err),
        }
    })?;
    let mut rec = Recorder {
        heap,
        steps: Vec::new(),
        log: Vec::new(),
    };
    rec.note("init", None)?;

    let a = rec.malloc("alloc_a", 32)?;
    let b = rec.malloc("alloc_b", 64)?;
    let c = rec.malloc("alloc_c", 32)?;
    expect(a < b && b < c, || {
        format!("blocks out of address order: {a:#x} {b:#x} {c:#x}")
    })?;

    let tail = rec.stats().largest_free;
    let filler = rec.malloc("fill_tail", tail)?;
    expect(rec.stats().free_chunks == 0, || {
        "filler left free space behind".to_owned()
    })?;

    rec.free("free_b", b)?;
    let reused = rec.malloc("realloc_b_span", 64)?;
    let reused_in_place = reused == b;
    expect(reused_in_place, || {
        format!("64-byte request went to {reused:#x}, not the freed span {b:#x}")
    })?;
    expect(rec.stats().growth_events == 0, || {
        "reusing a freed span grew the heap".to_owned()
    })?;

    rec.free("free_a", a)?;
    rec.free("free_c", c)?;
    let stats = rec.stats();
    expect(stats.free_chunks == 2 && stats.largest_free == 32, || {
        format!(
            "A and C should stay separate 32-byte spans, found {} free chunks, largest {}",
            stats.free_chunks, stats.largest_free
        )
    })?;

    let big = rec.malloc("alloc_large", 200)?;
    let growth_for_large = rec.stats().growth_events;
    expect(growth_for_large == 1, || {
        format!("200-byte request grew the heap {growth_for_large} times")
    })?;
    expect(big > filler, || {
        format!("grown block {big:#x} is not past the filler {filler:#x}")
    })?;

    Ok(ScenarioReport {
        final_stats: rec.stats().into(),
        steps: rec.steps,
        reused_in_place,
        growth_for_large,
        log: rec.log,
    })
}
