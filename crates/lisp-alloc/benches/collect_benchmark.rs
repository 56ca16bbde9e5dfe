//! Benchmark: collection pause time for heaps of different shapes.
//!
//! Measures a full collection over long lists, wide vectors and string-heavy
//! heaps, with half of the allocated objects left unreachable.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use lisp_alloc::{Heap, HeapConfig, LispObject, NIL};

fn fresh_heap() -> Heap {
    Heap::new(HeapConfig::new().scan_stack(false))
}

fn n(i: usize) -> LispObject {
    LispObject::fixnum(i64::try_from(i).unwrap_or(0)).unwrap_or(NIL)
}

fn list_heap(len: usize) -> Heap {
    let mut heap = fresh_heap();
    let mut kept = NIL;
    for i in 0..len {
        kept = heap.allocate_pair(n(i), kept);
        heap.allocate_pair(n(i), NIL);
    }
    heap.protect(kept);
    heap
}

fn vector_heap(count: usize) -> Heap {
    let mut heap = fresh_heap();
    let outer = heap.allocate_vector(count, NIL).unwrap();
    heap.protect(outer);
    for i in 0..count {
        let inner = heap.allocate_vector(16, n(i)).unwrap();
        heap.aset(outer, i, inner).unwrap();
        heap.allocate_vector(16, NIL).unwrap();
    }
    heap
}

fn string_heap(count: usize) -> Heap {
    let mut heap = fresh_heap();
    let outer = heap.allocate_vector(count, NIL).unwrap();
    heap.protect(outer);
    for i in 0..count {
        let s = heap.make_string(&format!("string number {i}")).unwrap();
        heap.aset(outer, i, s).unwrap();
        heap.make_string(&format!("garbage number {i}")).unwrap();
    }
    heap
}

fn bench_lists(c: &mut Criterion) {
    for len in [1_000, 10_000, 100_000] {
        c.bench_function(&format!("collect_list_{len}"), |b| {
            b.iter_batched(
                || list_heap(len),
                |mut heap| black_box(heap.collect_garbage()),
                BatchSize::LargeInput,
            );
        });
    }
}

fn bench_vectors(c: &mut Criterion) {
    c.bench_function("collect_vectors_10000", |b| {
        b.iter_batched(
            || vector_heap(10_000),
            |mut heap| black_box(heap.collect_garbage()),
            BatchSize::LargeInput,
        );
    });
}

fn bench_strings(c: &mut Criterion) {
    c.bench_function("collect_strings_10000", |b| {
        b.iter_batched(
            || string_heap(10_000),
            |mut heap| black_box(heap.collect_garbage()),
            BatchSize::LargeInput,
        );
    });
}

fn bench_steady_state(c: &mut Criterion) {
    c.bench_function("cons_with_safepoints", |b| {
        let mut heap = fresh_heap();
        b.iter(|| {
            for i in 0..1_000 {
                black_box(heap.allocate_pair(n(i), NIL));
            }
            black_box(heap.maybe_gc());
        });
    });
}

criterion_group!(
    benches,
    bench_lists,
    bench_vectors,
    bench_strings,
    bench_steady_state
);
criterion_main!(benches);
