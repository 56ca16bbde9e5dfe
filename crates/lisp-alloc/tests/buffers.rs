//! Integration tests for buffers, markers, overlays and undo lists.

use lisp_alloc::{Heap, HeapConfig, LispObject, Validity, NIL, T};

fn heap() -> Heap {
    Heap::new(HeapConfig::new().scan_stack(false))
}

fn n(i: i64) -> LispObject {
    LispObject::fixnum(i).unwrap()
}

fn buffer(heap: &mut Heap, name: &str) -> LispObject {
    let name = heap.make_string(name).unwrap();
    let b = heap.make_buffer(name).unwrap();
    heap.protect(b);
    b
}

#[test]
fn test_rooted_buffers_keep_their_slots() {
    let mut heap = heap();
    let b = buffer(&mut heap, "*scratch*");
    let file = heap.make_string("scratch.el").unwrap();
    let dir = heap.make_string("/tmp/").unwrap();
    heap.set_buffer_file_name(b, file, dir).unwrap();

    heap.collect_garbage();

    assert!(heap.buffer_live_p(b));
    assert_eq!(heap.buffer_list(), vec![b]);
    let name = heap.buffer_name(b).unwrap();
    assert_eq!(heap.string_bytes(name).unwrap(), b"*scratch*");
    let mark = heap.buffer_mark(b).unwrap();
    assert!(mark.is_misc());
    assert_eq!(heap.marker_buffer(mark), Ok(NIL));
}

#[test]
fn test_unreferenced_buffers_are_freed() {
    let mut heap = heap();
    let name = heap.make_string("temp").unwrap();
    heap.make_buffer(name).unwrap();
    assert_eq!(heap.stats().buffers.in_use, 1);
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.buffers.in_use, 0);
    assert!(heap.buffer_list().is_empty());
}

#[test]
fn test_killed_buffers_are_special() {
    let mut heap = heap();
    let b = buffer(&mut heap, "doomed");
    let m = heap.allocate_marker();
    heap.set_marker(m, b, 10).unwrap();
    heap.protect(m);

    assert_eq!(heap.kill_buffer(b), Ok(true));
    assert_eq!(heap.kill_buffer(b), Ok(false));
    assert!(!heap.buffer_live_p(b));
    assert_eq!(heap.buffer_name(b), Ok(NIL));
    assert_eq!(heap.marker_buffer(m), Ok(NIL));
    assert_eq!(heap.is_valid_reference(b), Validity::Special);

    heap.collect_garbage();
    assert_eq!(heap.is_valid_reference(b), Validity::Special);
    assert!(heap.buffer_list().is_empty());
}

#[test]
fn test_indirect_buffers_share_a_base() {
    let mut heap = heap();
    let base = buffer(&mut heap, "base");
    let name = heap.make_string("indirect").unwrap();
    let indirect = heap.make_indirect_buffer(base, name).unwrap();
    heap.protect(indirect);
    let name = heap.make_string("indirect-2").unwrap();
    let second = heap.make_indirect_buffer(indirect, name).unwrap();
    assert_eq!(heap.buffer_base_buffer(second), Ok(base));
    assert!(heap.unprotect(base));

    heap.collect_garbage();

    assert!(heap.buffer_live_p(base));
    assert_eq!(heap.buffer_base_buffer(indirect), Ok(base));
    assert_eq!(heap.buffer_base_buffer(base), Ok(NIL));
    assert_eq!(heap.buffer_list(), vec![indirect, base]);

    heap.kill_buffer(base).unwrap();
    assert!(!heap.buffer_live_p(indirect));
}

#[test]
fn test_markers_follow_their_buffer() {
    let mut heap = heap();
    let b = buffer(&mut heap, "text");
    let m = heap.allocate_marker();
    heap.protect(m);
    assert_eq!(heap.marker_position(m), Ok(None));
    heap.set_marker(m, b, 42).unwrap();
    heap.set_marker_insertion_type(m, true).unwrap();
    for i in 0..20 {
        let dead = heap.allocate_marker();
        heap.set_marker(dead, b, i).unwrap();
    }

    heap.collect_garbage();

    assert_eq!(heap.marker_buffer(m), Ok(b));
    assert_eq!(heap.marker_position(m), Ok(Some(42)));
    assert_eq!(heap.marker_insertion_type(m), Ok(true));
    assert_eq!(heap.buffer_markers(b).unwrap(), vec![m]);

    heap.set_marker(m, NIL, 0).unwrap();
    assert!(heap.buffer_markers(b).unwrap().is_empty());
}

#[test]
fn test_overlays_are_traced_through_their_buffer() {
    let mut heap = heap();
    let b = buffer(&mut heap, "overlays");
    let mut overlays = Vec::new();
    for i in 0..5 {
        let start = heap.allocate_marker();
        heap.set_marker(start, b, i * 10).unwrap();
        let end = heap.allocate_marker();
        heap.set_marker(end, b, i * 10 + 5).unwrap();
        let face = heap.make_string(&format!("face-{i}")).unwrap();
        let plist = heap.list(&[T, face]);
        let overlay = heap.allocate_overlay(start, end, plist).unwrap();
        heap.add_overlay(b, overlay).unwrap();
        overlays.push(overlay);
    }

    heap.collect_garbage();

    let mut found = heap.buffer_overlays(b).unwrap();
    found.sort_by_key(|o| o.bits());
    overlays.sort_by_key(|o| o.bits());
    assert_eq!(found, overlays);
    for overlay in overlays {
        let start = heap.overlay_start(overlay).unwrap();
        let end = heap.overlay_end(overlay).unwrap();
        let from = heap.marker_position(start).unwrap().unwrap();
        assert_eq!(heap.marker_position(end), Ok(Some(from + 5)));
        let plist = heap.overlay_plist(overlay).unwrap();
        let face = heap.list_to_vec(plist).unwrap()[1];
        assert_eq!(
            heap.string_bytes(face).unwrap(),
            format!("face-{}", from / 10).as_bytes()
        );
    }
    assert_eq!(heap.buffer_markers(b).unwrap().len(), 10);
}

/// Undo entries of the form `(MARKER . ADJUSTMENT)` go away with their
/// marker; everything else in the undo list stays.
#[test]
fn test_undo_lists_drop_dead_marker_entries() {
    let mut heap = heap();
    let b = buffer(&mut heap, "undo");
    let live = heap.allocate_marker();
    heap.set_marker(live, b, 1).unwrap();
    heap.protect(live);
    let dead = heap.allocate_marker();
    heap.set_marker(dead, b, 2).unwrap();

    let text = heap.make_string("deleted text").unwrap();
    let insertion = heap.allocate_pair(n(1), n(5));
    let deletion = heap.allocate_pair(text, n(3));
    let live_entry = heap.allocate_pair(live, n(-2));
    let dead_entry = heap.allocate_pair(dead, n(4));
    let undo = heap.list(&[dead_entry, insertion, live_entry, NIL, dead_entry, deletion]);
    heap.set_buffer_undo_list(b, undo).unwrap();

    heap.collect_garbage();

    let undo = heap.buffer_undo_list(b).unwrap();
    assert_eq!(
        heap.list_to_vec(undo).unwrap(),
        vec![insertion, live_entry, NIL, deletion]
    );
    let text = heap.car(deletion).unwrap();
    assert_eq!(heap.string_bytes(text).unwrap(), b"deleted text");
}

#[test]
fn test_undo_disabled_is_left_alone() {
    let mut heap = heap();
    let b = buffer(&mut heap, "no-undo");
    heap.set_buffer_undo_list(b, T).unwrap();
    heap.collect_garbage();
    assert_eq!(heap.buffer_undo_list(b), Ok(T));
}

#[test]
fn test_special_buffers_exist_and_survive() {
    let mut heap = heap();
    let defaults = heap.buffer_defaults();
    let symbols = heap.buffer_local_symbols();
    assert_ne!(defaults, symbols);
    heap.collect_garbage();
    heap.collect_garbage();
    assert_eq!(heap.is_valid_reference(defaults), Validity::Special);
    assert_eq!(heap.is_valid_reference(symbols), Validity::Special);
    assert!(heap.buffer_list().is_empty());
}

/// A buffer-local binding loaded for a buffer that has since been killed
/// falls back to the global binding at the next collection.
#[test]
fn test_bindings_for_killed_buffers_fall_back() {
    let mut heap = heap();
    let var = heap.intern("fill-column").unwrap();
    heap.set(var, n(70)).unwrap();
    heap.make_variable_buffer_local(var).unwrap();

    let b = buffer(&mut heap, "local");
    heap.set_buffer_local_value(var, b, n(100)).unwrap();
    assert_eq!(heap.symbol_value(var), Ok(n(100)));
    assert_eq!(heap.local_binding_buffer(var), Ok(b));
    let locals = heap.buffer_local_variables(b).unwrap();
    assert_eq!(heap.list_to_vec(locals).unwrap().len(), 1);

    heap.kill_buffer(b).unwrap();
    assert!(heap.unprotect(b));
    heap.collect_garbage();

    assert_eq!(heap.local_binding_buffer(var), Ok(NIL));
    assert_eq!(heap.symbol_value(var), Ok(n(70)));
    assert_eq!(heap.default_value(var), Ok(n(70)));
    assert_eq!(heap.stats().buffers.in_use, 0);
}

#[test]
fn test_set_default_leaves_loaded_local_binding() {
    let mut heap = heap();
    let var = heap.intern("tab-width").unwrap();
    heap.set(var, n(8)).unwrap();
    heap.make_variable_buffer_local(var).unwrap();
    let b = buffer(&mut heap, "tabs");
    heap.set_buffer_local_value(var, b, n(4)).unwrap();

    heap.set_default(var, n(2)).unwrap();
    heap.collect_garbage();

    assert_eq!(heap.symbol_value(var), Ok(n(4)));
    assert_eq!(heap.default_value(var), Ok(n(2)));
    heap.swap_in_global_binding(var).unwrap();
    assert_eq!(heap.symbol_value(var), Ok(n(2)));
}

#[test]
fn test_replaced_overlay_plist_is_reclaimed() {
    let mut heap = heap();
    let b = buffer(&mut heap, "plist");
    let start = heap.allocate_marker();
    heap.set_marker(start, b, 1).unwrap();
    let end = heap.allocate_marker();
    heap.set_marker(end, b, 2).unwrap();
    let old = heap.list(&[T, T, T, T]);
    let overlay = heap.allocate_overlay(start, end, old).unwrap();
    heap.add_overlay(b, overlay).unwrap();
    heap.collect_garbage();
    let before = heap.stats().pairs.in_use;

    let face = heap.make_string("bold").unwrap();
    let plist = heap.list(&[T, face]);
    heap.set_overlay_plist(overlay, plist).unwrap();
    heap.collect_garbage();

    assert_eq!(heap.stats().pairs.in_use, before - 4 + 2);
    let kept = heap.list_to_vec(heap.overlay_plist(overlay).unwrap()).unwrap();
    assert_eq!(heap.string_bytes(kept[1]).unwrap(), b"bold");
}
