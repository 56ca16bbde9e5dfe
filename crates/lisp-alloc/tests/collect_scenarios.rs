//! End-to-end collection scenarios: reachability, marking of shared and
//! cyclic graphs, and agreement between the allocators and the address
//! classifier.

use lisp_alloc::test_util;
use lisp_alloc::{Heap, HeapConfig, LispObject, MemType, NIL, T};

fn heap() -> Heap {
    Heap::new(HeapConfig::new().scan_stack(false))
}

fn n(i: i64) -> LispObject {
    LispObject::fixnum(i).unwrap()
}

fn expected_mem_type(obj: LispObject) -> Vec<MemType> {
    match obj.lisp_type() {
        lisp_alloc::LispType::Cons => vec![MemType::Cons],
        lisp_alloc::LispType::String => vec![MemType::String],
        lisp_alloc::LispType::Float => vec![MemType::Float],
        lisp_alloc::LispType::Symbol => vec![MemType::Symbol],
        lisp_alloc::LispType::Misc => vec![MemType::Misc],
        lisp_alloc::LispType::Vectorlike => vec![
            MemType::Vectorlike,
            MemType::VectorBlock,
            MemType::Buffer,
        ],
        lisp_alloc::LispType::Fixnum => Vec::new(),
    }
}

/// Two strings held by one rooted pair survive; once the root goes, their
/// bytes become free room that the next string takes back.
#[test]
fn test_foo_bar_scenario() {
    let mut heap = heap();
    let foo = heap.make_string("foo").unwrap();
    let bar = heap.make_string("bar").unwrap();
    let pair = heap.allocate_pair(foo, bar);
    heap.protect(pair);

    heap.collect_garbage();
    assert_eq!(heap.string_bytes(heap.car(pair).unwrap()).unwrap(), b"foo");
    assert_eq!(heap.string_bytes(heap.cdr(pair).unwrap()).unwrap(), b"bar");
    let free_with_root = heap.stats().string_data_free_bytes;

    assert!(heap.unprotect(pair));
    let metrics = heap.collect_garbage();
    let free_after_drop = metrics.heap.string_data_free_bytes;
    assert!(free_after_drop > free_with_root);
    assert!(metrics.heap.strings.free >= 2);

    let baz = heap.make_string("baz").unwrap();
    assert!(heap.stats().string_data_free_bytes < free_after_drop);
    assert!(heap.stats().strings.free < metrics.heap.strings.free);
    assert_eq!(heap.string_bytes(baz).unwrap(), b"baz");
}

/// A burst of 5000 pairs fills blocks in order; keeping every other one
/// leaves half live and half on the free list.
#[test]
fn test_every_other_pair_survives() {
    let mut heap = heap();
    let baseline = heap.stats().pairs.in_use;
    let mut blocks = test_util::pair_blocks(&heap);
    let mut pairs = Vec::with_capacity(5000);
    for i in 0..5000 {
        pairs.push(heap.allocate_pair(n(i), NIL));
        let now = test_util::pair_blocks(&heap);
        assert!(now >= blocks);
        blocks = now;
    }
    assert_eq!(heap.stats().pairs.free, 0);
    assert_eq!(heap.stats().pairs.in_use, baseline + 5000);

    for pair in pairs.iter().step_by(2) {
        heap.protect(*pair);
    }
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.pairs.in_use, baseline + 2500);
    assert_eq!(metrics.heap.pairs.free, 2500);
    assert_eq!(metrics.heap.pair_blocks, blocks);

    for (i, pair) in pairs.iter().enumerate().step_by(2) {
        assert_eq!(heap.car(*pair).unwrap(), n(i64::try_from(i).unwrap()));
        assert!(test_util::is_live_object(&heap, *pair));
    }
    for pair in pairs.iter().skip(1).step_by(2) {
        assert!(!test_util::is_live_object(&heap, *pair));
    }
}

/// Shared structure and cycles are marked once and survive intact.
#[test]
fn test_shared_and_cyclic_graph() {
    let mut heap = heap();
    let shared = heap.make_string("shared").unwrap();
    let v = heap.allocate_vector(4, shared).unwrap();
    let list = heap.list(&[shared, v, shared]);
    heap.aset(v, 3, list).unwrap();
    let root = heap.allocate_pair(list, v);
    heap.protect(root);

    let first = heap.collect_garbage();
    let second = heap.collect_garbage();
    assert_eq!(first.heap.pairs.in_use, second.heap.pairs.in_use);
    assert_eq!(first.heap.strings.in_use, second.heap.strings.in_use);
    assert_eq!(first.heap.vectors.in_use, second.heap.vectors.in_use);

    assert_eq!(heap.aref(v, 3), Ok(list));
    assert_eq!(heap.list_to_vec(list).unwrap(), vec![shared, v, shared]);
    assert_eq!(heap.string_bytes(shared).unwrap(), b"shared");
}

/// Every live object is found in the classifier with a kind matching its
/// tag, and freed cells stop counting as live.
#[test]
fn test_classifier_agrees_with_allocators() {
    let mut heap = heap();
    let string = heap.make_string("classified").unwrap();
    let float = heap.allocate_float(0.25);
    let symbol = heap.make_symbol("sym").unwrap();
    let marker = heap.allocate_marker();
    let small = heap.allocate_vector(3, NIL).unwrap();
    let large = heap.allocate_vector(2048, NIL).unwrap();
    let name = heap.make_string("buf").unwrap();
    let buffer = heap.make_buffer(name).unwrap();
    let pair = heap.allocate_pair(T, NIL);
    let live = [string, float, symbol, marker, small, large, buffer, pair];
    let keep = heap.list(&live);
    heap.protect(keep);

    let dead_pair = heap.allocate_pair(NIL, NIL);
    let dead_float = heap.allocate_float(9.0);
    let dead_string = heap.make_string("gone").unwrap();

    heap.collect_garbage();

    for obj in live {
        let kind = heap.mem_type_of(obj).unwrap();
        assert!(expected_mem_type(obj).contains(&kind), "{obj:?} in {kind:?}");
        assert!(test_util::is_live_object(&heap, obj), "{obj:?} not live");
    }
    for obj in [dead_pair, dead_float, dead_string] {
        assert!(!test_util::is_live_object(&heap, obj), "{obj:?} still live");
    }

    let entries = test_util::mem_entries(&heap);
    assert!(entries.windows(2).all(|w| w[0].end <= w[1].start));
    assert_eq!(
        entries.iter().filter(|e| e.mem_type == MemType::Spare).count(),
        1
    );
}

/// Whatever the graph, a collection keeps exactly the reachable pairs.
#[test]
fn test_random_graphs_keep_exactly_the_reachable() {
    let mut heap = heap();
    let baseline = heap.stats().pairs.in_use;
    let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    let nodes: Vec<LispObject> = (0..400).map(|i| heap.allocate_pair(n(i), NIL)).collect();
    for &node in &nodes {
        let target = nodes[usize::try_from(next() % 400).unwrap()];
        if next() % 3 == 0 {
            heap.setcdr(node, target).unwrap();
        }
    }
    let roots: Vec<usize> = (0..5).map(|_| usize::try_from(next() % 400).unwrap()).collect();

    let mut reachable = std::collections::HashSet::new();
    for &r in &roots {
        let mut cur = nodes[r];
        while cur.is_cons() && reachable.insert(cur) {
            cur = heap.cdr(cur).unwrap();
        }
        heap.protect(nodes[r]);
    }

    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.pairs.in_use, baseline + reachable.len());
    for node in reachable {
        assert!(heap.car(node).unwrap().is_fixnum());
    }
}
