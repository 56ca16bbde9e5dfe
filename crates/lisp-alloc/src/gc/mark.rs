//! The mark phase.
//!
//! Marking is driven by an explicit worklist. Pairs and symbols are walked
//! in place along their `cdr` and intern chains, so long lists and obarray
//! buckets do not grow the worklist.

use crate::hashtab::HashTable;
use crate::heap::Heap;
use crate::object::{LispObject, LispType, NIL, T};
use crate::space::block::{cell_mut, cell_ref, Slot};
use crate::space::buffer::Buffer;
use crate::space::float::FloatSpace;
use crate::space::misc::{Misc, MiscSpace};
use crate::space::pair::{Cons, ConsSpace};
use crate::space::string::{LispString, StringHeaderSpace};
use crate::space::symbol::{binding_buffer_killed, LispSymbol, SymbolSpace, SymbolValue};
use crate::space::vector::{contents, PvecType, VectorHeader, COMPILED_CONSTANTS};

impl Heap {
    /// Has `obj` been marked, or does it never need to be?
    pub(crate) fn survives_gc(&self, obj: LispObject) -> bool {
        if obj.is_immediate() {
            return true;
        }
        let addr = obj.address();
        if self.pure.contains(addr) {
            return true;
        }
        // SAFETY: a reference reachable during collection denotes an object
        // of the kind its tag names.
        unsafe {
            match obj.lisp_type() {
                LispType::Cons => ConsSpace::is_marked(addr),
                LispType::Symbol => SymbolSpace::is_marked(addr),
                LispType::String => StringHeaderSpace::is_marked(addr),
                LispType::Float => FloatSpace::is_marked(addr),
                LispType::Misc => MiscSpace::is_marked(addr),
                LispType::Vectorlike => (*(addr as *const VectorHeader)).is_marked(),
                LispType::Fixnum => true,
            }
        }
    }
}

/// Marks objects reachable from what it is shown.
pub(crate) struct GcVisitor<'h> {
    pub(crate) heap: &'h Heap,
    worklist: Vec<LispObject>,
    /// Panic after this many consecutive links of one chain.
    halt: Option<usize>,
    pub(crate) objects_marked: usize,
}

impl<'h> GcVisitor<'h> {
    pub(crate) fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            worklist: Vec::with_capacity(1024),
            halt: heap.config.mark_loop_halt,
            objects_marked: 0,
        }
    }

    /// Set the mark of `obj`. Returns true if it was not marked before and
    /// has references of its own to trace.
    fn set_mark(&mut self, obj: LispObject) -> bool {
        if obj.is_immediate() {
            return false;
        }
        let addr = obj.address();
        if self.heap.pure.contains(addr) {
            return false;
        }
        // SAFETY: as in `Heap::survives_gc`.
        let newly = unsafe {
            match obj.lisp_type() {
                LispType::Cons => ConsSpace::set_mark(addr),
                LispType::Symbol => SymbolSpace::set_mark(addr),
                LispType::String => StringHeaderSpace::set_mark(addr),
                LispType::Float => {
                    if FloatSpace::set_mark(addr) {
                        self.objects_marked += 1;
                    }
                    return false;
                }
                LispType::Misc => MiscSpace::set_mark(addr),
                LispType::Vectorlike => {
                    let header = &mut *(addr as *mut VectorHeader);
                    if header.is_marked() {
                        false
                    } else {
                        header.set_mark();
                        true
                    }
                }
                LispType::Fixnum => false,
            }
        };
        if newly {
            self.objects_marked += 1;
        }
        newly
    }

    /// Mark `obj` and queue it for tracing.
    pub(crate) fn visit(&mut self, obj: LispObject) {
        if self.set_mark(obj) {
            self.worklist.push(obj);
        }
    }

    /// Mark a stack word if it may refer to a live object.
    pub(crate) fn visit_candidate(&mut self, word: usize) {
        if let Some(obj) = self.heap.conservative_candidate(word) {
            self.visit(obj);
        }
    }

    /// Trace everything queued, and everything that reaches.
    pub(crate) fn process_worklist(&mut self) {
        while let Some(obj) = self.worklist.pop() {
            match obj.lisp_type() {
                LispType::Cons => self.trace_list(obj),
                LispType::Symbol => self.trace_symbols(obj),
                LispType::String => {
                    // SAFETY: marked strings are live.
                    let string = unsafe { cell_ref::<LispString>(obj.address()) };
                    self.visit(string.intervals);
                }
                LispType::Misc => self.trace_misc(obj),
                LispType::Vectorlike => self.trace_vectorlike(obj.address()),
                LispType::Float | LispType::Fixnum => {}
            }
        }
    }

    fn count_link(&self, links: &mut usize) {
        *links += 1;
        if let Some(limit) = self.halt {
            assert!(*links <= limit, "mark loop halted after {limit} links");
        }
    }

    /// Trace a marked pair and the rest of its list.
    fn trace_list(&mut self, mut pair: LispObject) {
        let mut links = 0;
        loop {
            // SAFETY: marked pairs are live.
            let cons = unsafe { cell_ref::<Cons>(pair.address()) };
            self.visit(cons.car);
            let cdr = cons.cdr;
            if !cdr.is_cons() || !self.set_mark(cdr) {
                if !cdr.is_cons() {
                    self.visit(cdr);
                }
                return;
            }
            self.count_link(&mut links);
            pair = cdr;
        }
    }

    /// Trace a marked symbol and the rest of its intern chain.
    fn trace_symbols(&mut self, mut symbol: LispObject) {
        let mut links = 0;
        loop {
            // SAFETY: marked heap symbols are live, and the collector has
            // the heap to itself.
            let sym = unsafe { cell_mut::<LispSymbol>(symbol.address()) };
            self.visit(sym.name);
            self.visit(sym.function);
            self.visit(sym.plist);
            match &mut sym.value {
                SymbolValue::Plain(value) | SymbolValue::Alias(value) => self.visit(*value),
                SymbolValue::Localized(binding) => {
                    if binding_buffer_killed(binding) {
                        binding.where_ = NIL;
                        binding.valcell = binding.defcell;
                    }
                    self.visit(binding.where_);
                    self.visit(binding.valcell);
                    self.visit(binding.defcell);
                }
                SymbolValue::Forwarded(cell) => self.visit(cell.get()),
            }
            let next = sym.next;
            if !next.is_symbol() || !self.set_mark(next) {
                return;
            }
            self.count_link(&mut links);
            symbol = next;
        }
    }

    fn trace_misc(&mut self, obj: LispObject) {
        // SAFETY: marked misc cells are live.
        match unsafe { cell_ref::<Misc>(obj.address()) } {
            // The buffer a marker points into is not kept alive by it.
            Misc::Marker(_) => {}
            Misc::Overlay(overlay) => {
                self.visit(overlay.start);
                self.visit(overlay.end);
                self.visit(overlay.plist);
                self.visit(overlay.next);
            }
        }
    }

    fn visit_slots(&mut self, vector: *mut VectorHeader, range: std::ops::Range<usize>) {
        for i in range {
            // SAFETY: `range` lies within the traced slots.
            self.visit(unsafe { *contents(vector).add(i) });
        }
    }

    fn trace_vectorlike(&mut self, addr: usize) {
        let vector = addr as *mut VectorHeader;
        // SAFETY: marked vector-likes are allocated.
        let header = unsafe { &*vector };
        let traced = header.traced();
        match header.pvec_type() {
            Some(PvecType::Buffer) => self.trace_buffer(vector.cast::<Buffer>()),
            Some(PvecType::HashTable) => {
                self.visit_slots(vector, 0..traced);
                // SAFETY: the header says this is a hash table.
                let table = unsafe { &*vector.cast::<HashTable>() };
                if table.weakness().is_none() {
                    self.visit(table.key_and_value);
                } else {
                    // Entries are decided once everything else is marked.
                    self.set_mark(table.key_and_value);
                }
            }
            Some(PvecType::Compiled) => {
                self.visit_slots(vector, 0..COMPILED_CONSTANTS);
                self.visit_slots(vector, COMPILED_CONSTANTS + 1..traced);
                self.visit_slots(vector, COMPILED_CONSTANTS..COMPILED_CONSTANTS + 1);
            }
            Some(PvecType::CharTable | PvecType::SubCharTable) => {
                self.trace_char_table(vector, traced);
            }
            Some(PvecType::BoolVector | PvecType::Free) => {}
            _ => self.visit_slots(vector, 0..traced),
        }
    }

    /// Char tables are mostly fixnums and symbols; skip what needs no work.
    fn trace_char_table(&mut self, vector: *mut VectorHeader, traced: usize) {
        for i in 0..traced {
            // SAFETY: `i` is a traced slot.
            let value = unsafe { *contents(vector).add(i) };
            if value.is_fixnum() || (value.is_symbol() && self.heap.survives_gc(value)) {
                continue;
            }
            self.visit(value);
        }
    }

    fn trace_buffer(&mut self, buffer: *mut Buffer) {
        // SAFETY: marked buffers are allocated.
        let b = unsafe { &*buffer };
        self.visit_slots(buffer.cast(), 0..b.header.traced());
        self.visit(b.overlays_before);
        self.visit(b.overlays_after);
        if !b.base_buffer.is_null() {
            self.visit(LispObject::from_address(b.base_buffer as usize, LispType::Vectorlike));
        }
        // The undo list is filtered, then marked, after everything else.
    }
}

/// Drop `(MARKER . ADJUSTMENT)` entries whose marker is unmarked from
/// `buffer`'s undo list.
///
/// # Safety
///
/// `buffer` must be allocated and marked; the collector must have the heap
/// to itself.
pub(crate) unsafe fn filter_undo_list(heap: &Heap, buffer: *mut Buffer) {
    let dead_marker_entry = |entry: LispObject| -> bool {
        if !entry.is_cons() || heap.pure.contains(entry.address()) {
            return false;
        }
        // SAFETY: entries of a reachable list are live.
        let car = unsafe { cell_ref::<Cons>(entry.address()) }.car;
        car.is_misc()
            && !heap.survives_gc(car)
            // SAFETY: as above.
            && matches!(unsafe { &*(car.address() as *const Slot<Misc>) }, Slot::Live(Misc::Marker(_)))
    };
    // SAFETY: forwarded from the caller.
    let b = unsafe { &mut *buffer };
    if b.undo_list == T {
        return;
    }
    let mut prev = NIL;
    let mut tail = b.undo_list;
    while tail.is_cons() && !heap.pure.contains(tail.address()) {
        // SAFETY: as above.
        let cell = unsafe { cell_ref::<Cons>(tail.address()) };
        let next = cell.cdr;
        if dead_marker_entry(cell.car) {
            if prev.is_nil() {
                b.undo_list = next;
            } else {
                // SAFETY: `prev` is a live heap pair of the same list.
                unsafe { cell_mut::<Cons>(prev.address()) }.cdr = next;
            }
        } else {
            prev = tail;
        }
        tail = next;
    }
}
