//! Marking that has to wait for everything else: buffer undo lists and
//! weak hash tables.

use std::collections::HashSet;

use super::mark::{filter_undo_list, GcVisitor};
use crate::hashtab::HashTable;
use crate::heap::Heap;

impl GcVisitor<'_> {
    /// Filter and mark the undo list of every marked buffer not seen yet.
    /// Returns true if any buffer was processed.
    pub(crate) fn mark_undo_lists(&mut self, done: &mut HashSet<usize>) -> bool {
        let heap = self.heap;
        let special = [heap.buffers.defaults, heap.buffers.local_symbols];
        let mut progressed = false;
        for buffer in heap.buffers.iter().chain(special) {
            if buffer.is_null() || done.contains(&(buffer as usize)) {
                continue;
            }
            // SAFETY: buffers on the chain and the special buffers are
            // allocated.
            if !unsafe { (*buffer).header.is_marked() } {
                continue;
            }
            done.insert(buffer as usize);
            // SAFETY: the buffer is marked and we own the heap.
            unsafe { filter_undo_list(heap, buffer) };
            // SAFETY: as above.
            self.visit(unsafe { (*buffer).undo_list });
            progressed = true;
        }
        self.process_worklist();
        progressed
    }

    /// Mark the dead parts of weak entries that stay because of their live
    /// parts. Returns true if anything new was marked.
    pub(crate) fn propagate_weak(&mut self) -> bool {
        let heap = self.heap;
        let before = self.objects_marked;
        let mut table = heap.weak_tables;
        while !table.is_null() {
            // SAFETY: the weak chain holds allocated hash tables.
            let t = unsafe { &*table };
            if t.header.is_marked() {
                if let Some(weakness) = t.weakness() {
                    let mut pending = Vec::new();
                    t.for_each_entry(|key, value| {
                        let key_ok = heap.survives_gc(key);
                        let value_ok = heap.survives_gc(value);
                        if weakness.keeps(key_ok, value_ok) {
                            if !key_ok {
                                pending.push(key);
                            }
                            if !value_ok {
                                pending.push(value);
                            }
                        }
                    });
                    for obj in pending {
                        self.visit(obj);
                    }
                }
            }
            table = t.next_weak;
        }
        self.process_worklist();
        self.objects_marked != before
    }

    /// Run undo-list filtering and weak propagation until neither marks
    /// anything more.
    pub(crate) fn finish_marking(&mut self) {
        let mut done = HashSet::new();
        loop {
            let undo = self.mark_undo_lists(&mut done);
            let weak = self.propagate_weak();
            if !undo && !weak {
                break;
            }
        }
    }
}

impl Heap {
    /// Drop weak entries whose kept parts died, and unlink unmarked tables
    /// from the weak chain. Returns the number of entries removed.
    ///
    /// Must run after marking and before vectors are swept.
    pub(crate) fn sweep_weak_tables(&mut self) -> usize {
        let mut removed = 0;
        let mut link: *mut *mut HashTable = &raw mut self.weak_tables;
        // SAFETY: `link` points at the field holding `table`; tables on the
        // chain are allocated until the vector sweep.
        unsafe {
            let mut table = *link;
            while !table.is_null() {
                let next = (*table).next_weak;
                if (*table).header.is_marked() {
                    if let Some(weakness) = (*table).weakness() {
                        removed += (*table).remove_where(|key, value| {
                            !weakness.keeps(self.survives_gc(key), self.survives_gc(value))
                        });
                    }
                    link = &raw mut (*table).next_weak;
                } else {
                    *link = next;
                    (*table).next_weak = std::ptr::null_mut();
                }
                table = next;
            }
        }
        removed
    }
}

