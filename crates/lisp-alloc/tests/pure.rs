//! Integration tests for pure space.

use lisp_alloc::{Error, Heap, HeapConfig, LispObject, NIL, T};

fn heap() -> Heap {
    Heap::new(HeapConfig::new().scan_stack(false))
}

#[test]
fn test_pure_objects_are_read_only() {
    let mut heap = heap();
    let s = heap.make_pure_string(b"constant", false).unwrap();
    let pair = heap.pure_cons(s, NIL).unwrap();
    assert!(heap.pure_p(s));
    assert!(heap.pure_p(pair));
    assert_eq!(heap.setcar(pair, T), Err(Error::ImmutableObject));
    assert_eq!(heap.set_string_byte(s, 0, b'C'), Err(Error::ImmutableObject));
    assert_eq!(heap.car(pair), Ok(s));
}

#[test]
fn test_pure_objects_need_no_roots() {
    let mut heap = heap();
    let s = heap.make_pure_string(b"forever", false).unwrap();
    let f = heap.make_pure_float(6.25);
    let v = heap.make_pure_vector(&[s, f]).unwrap();
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.strings.in_use, 0);
    assert_eq!(heap.string_bytes(s).unwrap(), b"forever");
    assert_eq!(heap.float_value(f), Ok(6.25));
    assert_eq!(heap.aref(v, 1), Ok(f));
}

#[test]
fn test_string_data_is_shared() {
    let mut heap = heap();
    heap.make_pure_string(b"make-sparse-keymap", false).unwrap();
    let (_, bytes_before, _) = heap.pure_space_usage();
    let tail = heap.make_pure_string(b"keymap", false).unwrap();
    let again = heap.make_pure_string(b"make-sparse-keymap", false).unwrap();
    let (_, bytes_after, _) = heap.pure_space_usage();
    assert_eq!(bytes_after, bytes_before);
    assert_eq!(heap.string_bytes(tail).unwrap(), b"keymap");
    assert_eq!(heap.string_bytes(again).unwrap(), b"make-sparse-keymap");
}

#[test]
fn test_purecopy_is_deep() {
    let mut heap = heap();
    let name = heap.make_string("name").unwrap();
    let f = heap.allocate_float(0.5);
    let inner = heap.allocate_vector(2, name).unwrap();
    let list = heap.list(&[name, f, inner, LispObject::fixnum(3).unwrap()]);

    let copy = heap.purecopy(list).unwrap();
    heap.protect(copy);
    let metrics = heap.collect_garbage();

    assert_eq!(metrics.heap.pairs.in_use, 0);
    assert_eq!(metrics.heap.floats.in_use, 0);
    let items = heap.list_to_vec(copy).unwrap();
    assert!(items.iter().take(3).all(|&item| heap.pure_p(item)));
    assert_eq!(heap.string_bytes(items[0]).unwrap(), b"name");
    assert_eq!(heap.float_value(items[1]), Ok(0.5));
    assert_eq!(heap.string_bytes(heap.aref(items[2], 1).unwrap()).unwrap(), b"name");
}

#[test]
fn test_purecopy_rejects_mutable_kinds() {
    let mut heap = heap();
    let marker = heap.allocate_marker();
    assert!(matches!(
        heap.purecopy(marker),
        Err(Error::WrongType { .. })
    ));
}

#[test]
fn test_purecopy_pins_symbols() {
    let mut heap = heap();
    let sym = heap.make_symbol("uninterned").unwrap();
    let list = heap.list(&[sym]);
    let copy = heap.purecopy(list).unwrap();
    heap.collect_garbage();
    let sym = heap.car(copy).unwrap();
    let name = heap.symbol_name(sym).unwrap();
    assert_eq!(heap.string_bytes(name).unwrap(), b"uninterned");
}

#[test]
fn test_purify_flag_puts_names_in_pure_space() {
    let mut heap = heap();
    heap.set_purify_flag(true);
    let sym = heap.intern("car").unwrap();
    heap.set_purify_flag(false);
    let other = heap.intern("cdr").unwrap();

    assert!(heap.pure_p(heap.symbol_name(sym).unwrap()));
    assert!(!heap.pure_p(heap.symbol_name(other).unwrap()));
}

/// Once pure space is full, objects come from the heap instead and stay
/// alive for good.
#[test]
fn test_overflow_falls_back_to_the_heap() {
    let mut heap = Heap::new(HeapConfig::new().scan_stack(false).pure_size(4096));
    let mut made = Vec::new();
    for i in 0..200 {
        made.push(heap.make_pure_string(format!("overflowing-{i}").as_bytes(), false).unwrap());
    }
    let (_, _, overflow) = heap.pure_space_usage();
    assert!(overflow > 0);
    assert!(made.iter().any(|&s| !heap.pure_p(s)));

    heap.collect_garbage();
    for (i, s) in made.iter().enumerate() {
        assert_eq!(
            heap.string_bytes(*s).unwrap(),
            format!("overflowing-{i}").as_bytes()
        );
    }
}
