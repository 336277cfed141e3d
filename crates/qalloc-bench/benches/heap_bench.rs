//! Heap benchmarks over the in-process region.

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use qalloc_bench::bench_heap;
use qalloc_core::{Allocator, Heap, VecRegion};

fn fresh_heap() -> Heap<VecRegion> {
    bench_heap(256).expect("heap init")
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        let mut heap = fresh_heap();
        group.bench_with_input(BenchmarkId::new("heap", size), &size, |b, &sz| {
            b.iter(|| {
                let addr = heap.malloc(sz).unwrap();
                heap.free(criterion::black_box(addr));
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("1000x64B", |b| {
        b.iter_batched(
            fresh_heap,
            |mut heap| {
                let addrs: Vec<usize> = (0..1000).map(|_| heap.malloc(64).unwrap()).collect();
                criterion::black_box(addrs);
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

// Best fit scans the whole chunk list, so cost grows with the number of
// chunks. Alternating live and freed blocks keeps the list long.
fn bench_fragmented_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmented_fit");

    for &chunks in &[64usize, 512, 4096] {
        let mut heap = fresh_heap();
        let mut live = Vec::with_capacity(chunks);
        for i in 0..chunks {
            let addr = heap.malloc(48 + (i % 7) * 16).unwrap();
            live.push(addr);
        }
        for addr in live.iter().step_by(2) {
            heap.free(*addr);
        }
        group.bench_with_input(BenchmarkId::new("malloc_free_64", chunks), &chunks, |b, _| {
            b.iter(|| {
                let addr = heap.malloc(64).unwrap();
                heap.free(criterion::black_box(addr));
            });
        });
    }
    group.finish();
}

fn bench_realloc_grow(c: &mut Criterion) {
    c.bench_function("realloc_grow_16_to_16k", |b| {
        b.iter_batched(
            fresh_heap,
            |mut heap| {
                let mut addr = heap.malloc(16).unwrap();
                let mut size = 16;
                while size < 16 * 1024 {
                    size *= 2;
                    addr = heap.realloc(addr, size).unwrap().unwrap();
                }
                heap.free(addr);
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_locked_allocator(c: &mut Criterion) {
    let allocator: Allocator<VecRegion> = Allocator::from_heap(fresh_heap());
    c.bench_function("allocator_malloc_free_256", |b| {
        b.iter(|| {
            let addr = allocator.malloc(256).unwrap();
            allocator.free(criterion::black_box(addr));
        });
    });
}

fn bench_integrity_check(c: &mut Criterion) {
    let mut heap = fresh_heap();
    for i in 0..1024 {
        let addr = heap.malloc(32 + i % 200).unwrap();
        if i % 3 == 0 {
            heap.free(addr);
        }
    }
    c.bench_function("check_integrity_1024_chunks", |b| {
        b.iter(|| criterion::black_box(heap.check_integrity()).is_ok());
    });
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_fragmented_fit,
    bench_realloc_grow,
    bench_locked_allocator,
    bench_integrity_check
);
criterion_main!(benches);
