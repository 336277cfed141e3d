//! Allocation storms.
//!
//! A storm drives a heap through a seeded workload over a fixed set of
//! slots. Every live block is filled with a tag byte; the tag is verified on
//! free and resize, and the integrity checker runs after every operation
//! (or every `check_every` operations).

use clap::ValueEnum;
use qalloc_core::{
    AllocError, Allocator, Heap, HeapConfig, HeapLogLevel, HeapStats, VecRegion,
};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::structured_log::LogEntry;

const PAGE: usize = 4096;

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StormType {
    Sawtooth,
    InverseSawtooth,
    RandomChurn,
    ResizeChurn,
    RegionExhaustion,
    AlignmentStress,
}

impl StormType {
    pub fn as_str(self) -> &'static str {
        match self {
            StormType::Sawtooth => "sawtooth",
            StormType::InverseSawtooth => "inverse_sawtooth",
            StormType::RandomChurn => "random_churn",
            StormType::ResizeChurn => "resize_churn",
            StormType::RegionExhaustion => "region_exhaustion",
            StormType::AlignmentStress => "alignment_stress",
        }
    }

    pub fn all() -> [StormType; 6] {
        [
            StormType::Sawtooth,
            StormType::InverseSawtooth,
            StormType::RandomChurn,
            StormType::ResizeChurn,
            StormType::RegionExhaustion,
            StormType::AlignmentStress,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StormConfig {
    pub storm: StormType,
    pub seed: u64,
    pub ops: usize,
    pub slots: usize,
    pub max_size: usize,
    pub initial_pages: usize,
    pub extend_pages: usize,
    pub capacity_bytes: usize,
    /// Run the integrity checker every this many operations.
    pub check_every: usize,
}

impl StormConfig {
    pub fn new(storm: StormType, seed: u64) -> Self {
        Self {
            storm,
            seed,
            ops: 20_000,
            slots: 256,
            max_size: 4096,
            initial_pages: 4,
            extend_pages: 1,
            capacity_bytes: 64 << 20,
            check_every: 1,
        }
    }

    fn heap_config(&self, log_threshold: Option<HeapLogLevel>) -> HeapConfig {
        HeapConfig::new()
            .with_initial_pages(self.initial_pages)
            .with_extend_pages(self.extend_pages)
            .with_log_threshold(log_threshold)
    }

    fn capacity(&self) -> usize {
        match self.storm {
            // Small enough that the workload runs into the ceiling.
            StormType::RegionExhaustion => (self.initial_pages + 16) * PAGE,
            _ => self.capacity_bytes,
        }
    }
}

/// Serializable copy of [`HeapStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub chunks: usize,
    pub free_chunks: usize,
    pub free_bytes: usize,
    pub used_chunks: usize,
    pub used_bytes: usize,
    pub largest_free: usize,
    pub heap_bytes: usize,
    pub growth_events: u64,
}

impl From<HeapStats> for StatsSnapshot {
    fn from(stats: HeapStats) -> Self {
        Self {
            chunks: stats.chunks,
            free_chunks: stats.free_chunks,
            free_bytes: stats.free_bytes,
            used_chunks: stats.used_chunks,
            used_bytes: stats.used_bytes,
            largest_free: stats.largest_free,
            heap_bytes: stats.heap_bytes,
            growth_events: stats.growth_events,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StormReport {
    pub storm: StormType,
    pub seed: u64,
    pub threads: usize,
    pub ops: usize,
    pub allocations: usize,
    pub frees: usize,
    pub resizes: usize,
    pub failed_allocations: usize,
    pub peak_live_bytes: usize,
    pub integrity_checks: usize,
    /// Fragmentation of free space at the end: `1 - largest_free / free_bytes`.
    pub free_fragmentation: f64,
    pub final_stats: StatsSnapshot,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    addr: usize,
    size: usize,
    tag: u8,
}

struct StormRunner {
    heap: Heap<VecRegion>,
    config: StormConfig,
    slots: Vec<Option<Slot>>,
    rng: XorShift64,
    step: usize,
    live_bytes: usize,
    report: StormReport,
    log: Option<Vec<LogEntry>>,
    scratch: Vec<u8>,
}

impl StormRunner {
    fn new(config: StormConfig, log_threshold: Option<HeapLogLevel>) -> Result<Self, HarnessError> {
        let region = VecRegion::new(PAGE, config.capacity());
        let heap = Heap::new(region, config.heap_config(log_threshold))
            .map_err(|err| HarnessError::Alloc {
                step: 0,
                source: AllocError::HeapInit(err),
            })?;
        let report = StormReport {
            storm: config.storm,
            seed: config.seed,
            threads: 1,
            ops: 0,
            allocations: 0,
            frees: 0,
            resizes: 0,
            failed_allocations: 0,
            peak_live_bytes: 0,
            integrity_checks: 0,
            free_fragmentation: 0.0,
            final_stats: heap.stats().into(),
        };
        Ok(Self {
            slots: vec![None; config.slots.max(1)],
            rng: XorShift64::new(config.seed),
            heap,
            config,
            step: 0,
            live_bytes: 0,
            report,
            log: log_threshold.map(|_| Vec::new()),
            scratch: Vec::new(),
        })
    }

    fn tag(&self) -> u8 {
        (self.step as u8) | 1
    }

    fn random_size(&mut self) -> usize {
        self.rng.gen_range(1, self.config.max_size.max(1))
    }

    fn verify(&mut self, slot: Slot) -> Result<(), HarnessError> {
        self.scratch.clear();
        self.scratch.resize(slot.size, 0);
        self.heap.read_bytes(slot.addr, &mut self.scratch);
        if self.scratch.iter().all(|&b| b == slot.tag) {
            Ok(())
        } else {
            Err(HarnessError::ContentMismatch {
                step: self.step,
                addr: slot.addr,
            })
        }
    }

    fn stamp(&mut self, addr: usize, size: usize) -> Slot {
        let tag = self.tag();
        self.scratch.clear();
        self.scratch.resize(size, tag);
        self.heap.write_bytes(addr, &self.scratch);
        Slot { addr, size, tag }
    }

    fn absorb(&mut self, result: Result<usize, AllocError>) -> Result<Option<usize>, HarnessError> {
        match result {
            Ok(addr) => Ok(Some(addr)),
            Err(AllocError::OutOfMemory(_)) => {
                self.report.failed_allocations += 1;
                Ok(None)
            }
            Err(source) => Err(HarnessError::Alloc {
                step: self.step,
                source,
            }),
        }
    }

    fn allocate_at(&mut self, idx: usize, size: usize, align: usize) -> Result<(), HarnessError> {
        self.free_at(idx)?;
        let result = if align <= 16 {
            self.heap.malloc(size)
        } else {
            self.heap.aligned_alloc(align, size)
        };
        let Some(addr) = self.absorb(result)? else {
            return Ok(());
        };
        if addr % align.max(16) != 0 {
            return Err(HarnessError::Scenario(format!(
                "step {}: {addr:#x} is not aligned to {align}",
                self.step
            )));
        }
        self.slots[idx] = Some(self.stamp(addr, size));
        self.report.allocations += 1;
        self.live_bytes += size;
        self.report.peak_live_bytes = self.report.peak_live_bytes.max(self.live_bytes);
        Ok(())
    }

    fn free_at(&mut self, idx: usize) -> Result<(), HarnessError> {
        let Some(slot) = self.slots[idx].take() else {
            return Ok(());
        };
        self.verify(slot)?;
        self.heap.free(slot.addr);
        self.report.frees += 1;
        self.live_bytes -= slot.size;
        Ok(())
    }

    fn resize_at(&mut self, idx: usize, size: usize) -> Result<(), HarnessError> {
        let Some(slot) = self.slots[idx] else {
            return self.allocate_at(idx, size, 16);
        };
        self.verify(slot)?;
        let resized = match self.heap.realloc(slot.addr, size) {
            Ok(resized) => resized,
            Err(AllocError::OutOfMemory(_)) => {
                self.report.failed_allocations += 1;
                return Ok(());
            }
            Err(source) => {
                return Err(HarnessError::Alloc {
                    step: self.step,
                    source,
                });
            }
        };
        self.report.resizes += 1;
        self.live_bytes -= slot.size;
        match resized {
            None => self.slots[idx] = None,
            Some(addr) => {
                let kept = Slot {
                    addr,
                    size: slot.size.min(size),
                    tag: slot.tag,
                };
                self.verify(kept)?;
                self.slots[idx] = Some(self.stamp(addr, size));
                self.live_bytes += size;
                self.report.peak_live_bytes = self.report.peak_live_bytes.max(self.live_bytes);
            }
        }
        Ok(())
    }

    fn step_once(&mut self) -> Result<(), HarnessError> {
        let slots = self.slots.len();
        let max = self.config.max_size.max(1);
        match self.config.storm {
            StormType::Sawtooth | StormType::InverseSawtooth => {
                let phase = self.step % (2 * slots);
                let rising = self.config.storm == StormType::Sawtooth;
                if phase < slots {
                    let rank = if rising { phase } else { slots - 1 - phase };
                    let size = 1 + rank * max / slots;
                    self.allocate_at(phase, size, 16)?;
                } else {
                    let idx = phase - slots;
                    let idx = if rising { slots - 1 - idx } else { idx };
                    self.free_at(idx)?;
                }
            }
            StormType::RandomChurn => {
                let idx = self.rng.gen_range(0, slots - 1);
                if self.slots[idx].is_some() && self.rng.next_u64() % 2 == 0 {
                    self.free_at(idx)?;
                } else {
                    let size = self.random_size();
                    self.allocate_at(idx, size, 16)?;
                }
            }
            StormType::ResizeChurn => {
                let idx = self.rng.gen_range(0, slots - 1);
                let size = if self.rng.next_u64() % 16 == 0 {
                    0
                } else {
                    self.random_size()
                };
                self.resize_at(idx, size)?;
            }
            StormType::RegionExhaustion => {
                let idx = self.rng.gen_range(0, slots - 1);
                if self.rng.next_u64() % 4 == 0 {
                    self.free_at(idx)?;
                } else {
                    let size = self.rng.gen_range(max, 4 * max);
                    self.allocate_at(idx, size, 16)?;
                }
            }
            StormType::AlignmentStress => {
                let idx = self.rng.gen_range(0, slots - 1);
                if self.slots[idx].is_some() && self.rng.next_u64() % 3 == 0 {
                    self.free_at(idx)?;
                } else {
                    let align = 1 << self.rng.gen_range(0, 12);
                    let size = self.random_size();
                    self.allocate_at(idx, size, align)?;
                }
            }
        }
        Ok(())
    }

    fn after_step(&mut self) -> Result<(), HarnessError> {
        if let Some(log) = self.log.as_mut() {
            while let Some(record) = self.heap.pop_log() {
                log.push(LogEntry::from(&record));
            }
        }
        if self.step % self.config.check_every.max(1) == 0 {
            self.report.integrity_checks += 1;
            self.heap
                .check_integrity()
                .map_err(|source| HarnessError::Corruption {
                    step: self.step,
                    source,
                })?;
        }
        Ok(())
    }

    fn run(mut self) -> Result<(StormReport, Vec<LogEntry>), HarnessError> {
        self.after_step()?;
        self.report.ops = self.config.ops;
        for step in 1..=self.config.ops {
            self.step = step;
            self.step_once()?;
            self.after_step()?;
        }
        for idx in 0..self.slots.len() {
            self.free_at(idx)?;
        }
        self.after_step()?;
        self.heap
            .check_integrity()
            .map_err(|source| HarnessError::Corruption {
                step: self.step,
                source,
            })?;

        let stats = self.heap.stats();
        if stats.used_chunks != 0 {
            return Err(HarnessError::Scenario(format!(
                "{} chunks still in use after draining every slot",
                stats.used_chunks
            )));
        }
        self.report.free_fragmentation = fragmentation(&stats);
        self.report.final_stats = stats.into();
        Ok((self.report, self.log.unwrap_or_default()))
    }
}

fn fragmentation(stats: &HeapStats) -> f64 {
    if stats.free_bytes == 0 {
        0.0
    } else {
        1.0 - stats.largest_free as f64 / stats.free_bytes as f64
    }
}

/// Runs one storm against a fresh heap.
pub fn run_storm(config: &StormConfig) -> Result<StormReport, HarnessError> {
    StormRunner::new(config.clone(), None)?
        .run()
        .map(|(report, _)| report)
}

/// Runs one storm and returns every lifecycle record at or above `level`.
pub fn run_storm_with_log(
    config: &StormConfig,
    level: HeapLogLevel,
) -> Result<(StormReport, Vec<LogEntry>), HarnessError> {
    StormRunner::new(config.clone(), Some(level))?.run()
}

/// Random churn from several threads through one locked allocator.
/// Each thread owns its slots; the heap is checked after all threads join.
pub fn run_threaded_storm(
    config: &StormConfig,
    threads: usize,
) -> Result<StormReport, HarnessError> {
    let threads = threads.max(1);
    let heap = Heap::new(
        VecRegion::new(PAGE, config.capacity_bytes),
        config.heap_config(None),
    )
    .map_err(|err| HarnessError::Alloc {
        step: 0,
        source: AllocError::HeapInit(err),
    })?;
    let allocator: Allocator<VecRegion> = Allocator::from_heap(heap);

    let per_thread: Vec<Result<(usize, usize, usize), HarnessError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let allocator = &allocator;
                let seed = config.seed.wrapping_add(t as u64 * 0x9E37_79B9);
                scope.spawn(move || churn(allocator, config, t, seed))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(HarnessError::Scenario("storm thread panicked".into())))
            })
            .collect()
    });

    let mut report = StormReport {
        storm: StormType::RandomChurn,
        seed: config.seed,
        threads,
        ops: 0,
        allocations: 0,
        frees: 0,
        resizes: 0,
        failed_allocations: 0,
        peak_live_bytes: 0,
        integrity_checks: 1,
        free_fragmentation: 0.0,
        final_stats: allocator.stats().into(),
    };
    for outcome in per_thread {
        let (ops, allocations, frees) = outcome?;
        report.ops += ops;
        report.allocations += allocations;
        report.frees += frees;
    }
    allocator
        .check_integrity()
        .map_err(|source| HarnessError::Corruption {
            step: report.ops,
            source,
        })?;
    let stats = allocator.stats();
    report.free_fragmentation = fragmentation(&stats);
    report.final_stats = stats.into();
    Ok(report)
}

fn churn(
    allocator: &Allocator<VecRegion>,
    config: &StormConfig,
    thread: usize,
    seed: u64,
) -> Result<(usize, usize, usize), HarnessError> {
    let mut rng = XorShift64::new(seed);
    let mut slots: Vec<Option<(usize, usize)>> = vec![None; config.slots.max(1)];
    let tag = thread as u8 | 0x80;
    let (mut allocations, mut frees) = (0, 0);
    let alloc_err = |step, source| HarnessError::Alloc { step, source };

    let release = |slot: (usize, usize), step: usize| -> Result<(), HarnessError> {
        let (addr, size) = slot;
        let mut out = vec![0u8; size];
        allocator
            .with_heap(|heap| heap.read_bytes(addr, &mut out))
            .map_err(|source| alloc_err(step, source))?;
        if out.iter().any(|&b| b != tag) {
            return Err(HarnessError::ContentMismatch { step, addr });
        }
        allocator.free(addr);
        Ok(())
    };

    for step in 0..config.ops {
        let idx = rng.gen_range(0, slots.len() - 1);
        if let Some(slot) = slots[idx].take() {
            release(slot, step)?;
            frees += 1;
            continue;
        }
        let size = rng.gen_range(1, config.max_size.max(1));
        let addr = allocator
            .malloc(size)
            .map_err(|source| alloc_err(step, source))?;
        allocator
            .with_heap(|heap| heap.write_bytes(addr, &vec![tag; size]))
            .map_err(|source| alloc_err(step, source))?;
        slots[idx] = Some((addr, size));
        allocations += 1;
    }
    for slot in slots.into_iter().flatten() {
        release(slot, config.ops)?;
        frees += 1;
    }
    Ok((config.ops, allocations, frees))
}
