//! Integration tests for collection metrics and heap statistics.

use std::time::Duration;

use lisp_alloc::{global_metrics, Heap, HeapConfig, LispObject, Weakness, NIL, T};

fn heap() -> Heap {
    Heap::new(HeapConfig::new().scan_stack(false))
}

/// Phase times never add up to more than the whole collection.
#[test]
fn test_phase_timing_fits_in_the_total() {
    let mut heap = heap();
    for _ in 0..1000 {
        heap.allocate_pair(T, NIL);
    }
    let metrics = heap.collect_garbage();
    let phases = metrics.mark_duration + metrics.weak_duration + metrics.sweep_duration;
    assert!(
        phases <= metrics.duration + Duration::from_micros(100),
        "phases ({phases:?}) exceed the total ({:?})",
        metrics.duration
    );
}

#[test]
fn test_last_metrics_are_kept() {
    let mut heap = heap();
    assert!(heap.last_gc_metrics().is_none());
    let metrics = heap.collect_garbage();
    let last = heap.last_gc_metrics().unwrap();
    assert_eq!(last.gc_id, metrics.gc_id);
    assert_eq!(last.bytes_live, metrics.bytes_live);
    assert_eq!(heap.gcs_done(), 1);
}

#[test]
fn test_live_bytes_track_the_live_set() {
    let mut heap = heap();
    let empty = heap.collect_garbage().bytes_live;

    let v = heap.allocate_vector(100, NIL).unwrap();
    heap.protect(v);
    let s = heap.make_string("0123456789").unwrap();
    heap.protect(s);
    let metrics = heap.collect_garbage();

    let stats = metrics.heap;
    assert_eq!(stats.live_bytes(), metrics.bytes_live);
    assert!(metrics.bytes_live >= empty + 100 * 8 + 10);
    assert_eq!(stats.string_bytes, 10);
    assert!(stats.vector_slots_used >= 100);
}

#[test]
fn test_stats_count_each_kind() {
    let mut heap = heap();
    let before = heap.stats();
    let f = heap.allocate_float(1.0);
    let p = heap.allocate_pair(f, NIL);
    let m = heap.allocate_marker();
    let sym = heap.make_symbol("counted").unwrap();
    let keep = heap.list(&[p, m, sym]);
    heap.protect(keep);

    let after = heap.collect_garbage().heap;
    assert_eq!(after.floats.in_use, before.floats.in_use + 1);
    assert_eq!(after.pairs.in_use, before.pairs.in_use + 4);
    assert_eq!(after.misc.in_use, before.misc.in_use + 1);
    assert_eq!(after.symbols.in_use, before.symbols.in_use + 1);
    assert!(after.pairs.cell_size >= 2 * std::mem::size_of::<LispObject>());
    assert!(after.pair_blocks >= 1);
}

#[test]
fn test_global_metrics_accumulate() {
    let collections = global_metrics().total_collections();
    let consed = global_metrics().total_bytes_consed();
    let removed = global_metrics().total_weak_entries_removed();

    let mut heap = heap();
    let table = heap.make_hash_table(Some(Weakness::Key), 8).unwrap();
    heap.protect(table);
    let key = heap.make_string("dies").unwrap();
    heap.hash_put(table, key, T).unwrap();
    let metrics = heap.collect_garbage();

    assert!(global_metrics().total_collections() > collections);
    assert!(global_metrics().total_bytes_consed() >= consed + metrics.bytes_consed);
    assert!(global_metrics().total_weak_entries_removed() > removed);
    assert!(global_metrics().last_gc_id().0 >= metrics.gc_id);
    assert!(global_metrics().total_pause_ns() > 0);
}
