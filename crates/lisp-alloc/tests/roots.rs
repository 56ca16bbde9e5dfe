//! Integration tests for the root set: statics, protected references,
//! root scopes, dynamic bindings and native variables.

use std::cell::Cell;

use lisp_alloc::{Error, Heap, HeapConfig, LispObject, NIL, T, UNBOUND};

fn heap() -> Heap {
    Heap::new(HeapConfig::new().scan_stack(false))
}

#[test]
fn test_static_roots_are_read_at_each_collection() {
    let mut heap = heap();
    let cell: &'static Cell<LispObject> = Box::leak(Box::new(Cell::new(NIL)));
    heap.register_static_root(cell);

    let first = heap.make_string("first").unwrap();
    cell.set(first);
    heap.collect_garbage();
    assert_eq!(heap.string_bytes(cell.get()).unwrap(), b"first");

    let second = heap.make_string("second").unwrap();
    cell.set(second);
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.strings.in_use, 1);
    assert_eq!(heap.string_bytes(cell.get()).unwrap(), b"second");
}

#[test]
fn test_root_scopes_release_on_exit() {
    let mut heap = heap();
    let baseline = heap.protected_count();
    let kept = heap.with_root_scope(|heap| {
        let a = heap.make_string("scoped").unwrap();
        heap.protect(a);
        heap.collect_garbage();
        assert_eq!(heap.string_bytes(a).unwrap(), b"scoped");
        heap.protected_count()
    });
    assert_eq!(kept, baseline + 1);
    assert_eq!(heap.protected_count(), baseline);
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.strings.in_use, 0);
}

#[test]
fn test_nested_frames() {
    let mut heap = heap();
    heap.push_root_frame();
    let outer = heap.make_string("outer").unwrap();
    heap.protect(outer);
    heap.push_root_frame();
    let inner = heap.make_string("inner").unwrap();
    heap.protect(inner);
    heap.pop_root_frame();
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.strings.in_use, 1);
    assert_eq!(heap.string_bytes(outer).unwrap(), b"outer");
    heap.pop_root_frame();
    assert_eq!(heap.protected_count(), 0);
}

/// The value a dynamic binding shadows stays alive until it is restored.
#[test]
fn test_dynamic_bindings_keep_old_values() {
    let mut heap = heap();
    let var = heap.intern("case-fold-search").unwrap();
    let global = heap.make_string("global").unwrap();
    heap.set(var, global).unwrap();

    let depth = heap.specpdl_depth();
    let local = heap.make_string("local").unwrap();
    heap.specbind(var, local).unwrap();
    heap.collect_garbage();
    assert_eq!(heap.symbol_value(var), Ok(local));

    heap.unbind_to(depth).unwrap();
    assert_eq!(heap.specpdl_depth(), depth);
    let restored = heap.symbol_value(var).unwrap();
    assert_eq!(heap.string_bytes(restored).unwrap(), b"global");
}

#[test]
fn test_uninterned_specbind_symbols_are_roots() {
    let mut heap = heap();
    let var = heap.make_symbol("temp-var").unwrap();
    let value = heap.make_string("bound").unwrap();
    heap.specbind(var, value).unwrap();
    heap.collect_garbage();
    assert_eq!(heap.symbol_value(var), Ok(value));
    heap.unbind_to(0).unwrap();
    assert_eq!(heap.symbol_value(var), Ok(UNBOUND));
}

#[test]
fn test_aliases_share_a_value() {
    let mut heap = heap();
    let base = heap.intern("new-name").unwrap();
    let alias = heap.intern("old-name").unwrap();
    heap.defvaralias(alias, base).unwrap();
    let value = heap.make_string("shared").unwrap();
    heap.set(alias, value).unwrap();

    heap.collect_garbage();

    assert_eq!(heap.indirect_variable(alias), Ok(base));
    assert_eq!(heap.symbol_value(base), Ok(value));
    assert_eq!(heap.defvaralias(base, alias), Err(Error::CyclicAlias));
    assert_eq!(heap.set(T, NIL), Err(Error::ImmutableObject));
}

#[test]
fn test_forwarded_values_are_roots() {
    let mut heap = heap();
    let native: &'static Cell<LispObject> = Box::leak(Box::new(Cell::new(NIL)));
    let var = heap.intern("native-var").unwrap();
    heap.forward_symbol(var, native).unwrap();
    let value = heap.make_string("in a native cell").unwrap();
    heap.set(var, value).unwrap();
    assert_eq!(native.get(), value);

    heap.collect_garbage();
    assert_eq!(heap.string_bytes(native.get()).unwrap(), b"in a native cell");
}

#[test]
fn test_function_and_plist_slots_are_traced() {
    let mut heap = heap();
    let sym = heap.intern("my-function").unwrap();
    let body = heap.make_string("body").unwrap();
    let function = heap.list(&[T, body]);
    heap.fset(sym, function).unwrap();
    let note = heap.make_string("a note").unwrap();
    let plist = heap.list(&[T, note]);
    heap.setplist(sym, plist).unwrap();

    heap.collect_garbage();

    let function = heap.symbol_function(sym).unwrap();
    let body = heap.list_to_vec(function).unwrap()[1];
    assert_eq!(heap.string_bytes(body).unwrap(), b"body");
    assert_eq!(heap.get(sym, T), Ok(note));
}

#[test]
fn test_unintern_lets_symbols_go() {
    let mut heap = heap();
    heap.intern("ephemeral").unwrap();
    let before = heap.collect_garbage().heap.symbols.in_use;
    assert_eq!(heap.unintern("ephemeral"), Ok(true));
    assert_eq!(heap.intern_soft("ephemeral"), Ok(None));
    let after = heap.collect_garbage().heap.symbols.in_use;
    assert_eq!(after, before - 1);

    let mut seen = 0;
    heap.mapatoms(|_| seen += 1).unwrap();
    assert_eq!(seen, after);
}
