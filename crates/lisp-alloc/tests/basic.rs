//! Integration tests for allocation and collection of the basic kinds.

use lisp_alloc::{Error, Heap, HeapConfig, LispObject, LispType, NIL, STRING_BYTES_BOUND, T};

fn heap() -> Heap {
    Heap::new(HeapConfig::new().scan_stack(false))
}

#[test]
fn test_rooted_pair_of_strings_survives() {
    let mut heap = heap();
    let foo = heap.make_string("foo").unwrap();
    let bar = heap.make_string("bar").unwrap();
    let pair = heap.allocate_pair(foo, bar);
    heap.protect(pair);

    heap.collect_garbage();

    let car = heap.car(pair).unwrap();
    let cdr = heap.cdr(pair).unwrap();
    assert_eq!(heap.string_bytes(car).unwrap(), b"foo");
    assert_eq!(heap.string_bytes(cdr).unwrap(), b"bar");
}

#[test]
fn test_unrooted_objects_are_reclaimed() {
    let mut heap = heap();
    let baseline = heap.stats();
    for i in 0..1000 {
        let f = heap.allocate_float(f64::from(i));
        heap.allocate_pair(f, NIL);
    }
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.pairs.in_use, baseline.pairs.in_use);
    assert_eq!(metrics.heap.floats.in_use, baseline.floats.in_use);
}

#[test]
fn test_freed_pairs_are_reused() {
    let mut heap = heap();
    for _ in 0..100 {
        heap.allocate_pair(T, T);
    }
    heap.collect_garbage();
    let blocks = heap.stats().pair_blocks;
    let free = heap.stats().pairs.free;
    assert!(free >= 100);
    for _ in 0..100 {
        heap.allocate_pair(NIL, NIL);
    }
    assert_eq!(heap.stats().pair_blocks, blocks);
    assert_eq!(heap.stats().pairs.free, free - 100);
}

#[test]
fn test_field_values_survive_collection() {
    let mut heap = heap();
    let f = heap.allocate_float(2.5);
    let s = heap.make_string("ünïcode").unwrap();
    let v = heap.allocate_vector(3, NIL).unwrap();
    heap.aset(v, 0, f).unwrap();
    heap.aset(v, 1, s).unwrap();
    heap.aset(v, 2, LispObject::fixnum(-7).unwrap()).unwrap();
    heap.protect(v);

    heap.collect_garbage();
    heap.collect_garbage();

    assert_eq!(heap.float_value(heap.aref(v, 0).unwrap()), Ok(2.5));
    let s = heap.aref(v, 1).unwrap();
    assert_eq!(heap.string_bytes(s).unwrap(), "ünïcode".as_bytes());
    assert_eq!(heap.string_chars(s), Ok(7));
    assert_eq!(heap.string_multibyte_p(s), Ok(true));
    assert_eq!(heap.aref(v, 2).unwrap().as_fixnum(), Some(-7));
}

#[test]
fn test_cyclic_lists_are_collected_and_kept() {
    let mut heap = heap();
    let baseline = heap.stats().pairs.in_use;
    let a = heap.allocate_pair(LispObject::fixnum(1).unwrap(), NIL);
    let b = heap.allocate_pair(LispObject::fixnum(2).unwrap(), a);
    heap.setcdr(a, b).unwrap();
    heap.protect(a);

    heap.collect_garbage();
    assert_eq!(heap.car(heap.cdr(a).unwrap()).unwrap().as_fixnum(), Some(2));

    heap.unprotect(a);
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.pairs.in_use, baseline);
}

#[test]
fn test_symbols_keep_their_slots() {
    let mut heap = heap();
    let sym = heap.intern("answer").unwrap();
    let value = heap.make_string("forty-two").unwrap();
    heap.set(sym, value).unwrap();
    let prop = heap.intern("doc").unwrap();
    let doc = heap.make_string("the answer").unwrap();
    heap.put(sym, prop, doc).unwrap();

    heap.collect_garbage();

    let sym = heap.intern_soft("answer").unwrap().unwrap();
    assert_eq!(heap.string_bytes(heap.symbol_value(sym).unwrap()).unwrap(), b"forty-two");
    let doc = heap.get(sym, prop).unwrap();
    assert_eq!(heap.string_bytes(doc).unwrap(), b"the answer");
}

#[test]
fn test_uninterned_symbols_are_reclaimed() {
    let mut heap = heap();
    let before = heap.stats().symbols.in_use;
    heap.make_symbol("transient").unwrap();
    assert_eq!(heap.stats().symbols.in_use, before + 1);
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.symbols.in_use, before);
}

#[test]
fn test_oversized_requests_are_errors() {
    let mut heap = heap();
    assert_eq!(
        heap.make_uninit_string(STRING_BYTES_BOUND + 1),
        Err(Error::StringTooLong {
            requested: STRING_BYTES_BOUND + 1
        })
    );
    assert_eq!(heap.consing_since_gc(), 0);
}

#[test]
fn test_wrong_type_is_reported() {
    let mut heap = heap();
    let f = heap.allocate_float(1.0);
    assert_eq!(
        heap.car(f),
        Err(Error::WrongType {
            expected: "list",
            found: LispType::Float
        })
    );
    assert_eq!(heap.car(NIL), Ok(NIL));
}

#[test]
fn test_immediates_need_no_memory() {
    let heap = heap();
    let n = LispObject::fixnum(123_456).unwrap();
    assert!(n.is_fixnum());
    assert_eq!(n.as_fixnum(), Some(123_456));
    assert!(NIL.is_nil());
    assert!(T.is_builtin_symbol());
    assert_eq!(heap.consing_since_gc(), 0);
}
