//! Precise roots.
//!
//! Everything here is marked at the start of every collection: registered
//! static cells, the shadow stack of protected references, the dynamic
//! binding stack, and objects pinned for life. The native stack is handled
//! separately by [`crate::scan`].

use std::cell::Cell;

use crate::error::Result;
use crate::heap::Heap;
use crate::object::LispObject;

// ============================================================================
// ShadowStack - explicitly protected references
// ============================================================================

/// References protected by native code, with frames for scoped protection.
#[derive(Debug, Default)]
pub(crate) struct ShadowStack {
    roots: Vec<LispObject>,
    frame_markers: Vec<usize>,
}

impl ShadowStack {
    pub(crate) const fn new() -> Self {
        Self {
            roots: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, obj: LispObject) {
        self.roots.push(obj);
    }

    /// Drop the most recent protection of `obj`.
    pub(crate) fn pop(&mut self, obj: LispObject) -> bool {
        match self.roots.iter().rposition(|&r| r == obj) {
            Some(pos) => {
                self.roots.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.roots.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = LispObject> + '_ {
        self.roots.iter().copied()
    }

    pub(crate) fn push_frame(&mut self) {
        self.frame_markers.push(self.roots.len());
    }

    /// Remove every root pushed since the matching `push_frame`.
    pub(crate) fn pop_frame(&mut self) {
        if let Some(marker) = self.frame_markers.pop() {
            self.roots.truncate(marker);
        }
    }
}

/// One entry of the dynamic binding stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpecBinding {
    pub(crate) symbol: LispObject,
    pub(crate) old_value: LispObject,
}

#[derive(Debug, Default)]
pub(crate) struct RootSet {
    pub(crate) statics: Vec<&'static Cell<LispObject>>,
    pub(crate) shadow: ShadowStack,
    pub(crate) specpdl: Vec<SpecBinding>,
    /// Heap objects that pure objects refer to after pure space overflowed.
    pub(crate) pinned: Vec<LispObject>,
    pub(crate) pinned_symbols: Vec<LispObject>,
}

impl RootSet {
    pub(crate) const fn new() -> Self {
        Self {
            statics: Vec::new(),
            shadow: ShadowStack::new(),
            specpdl: Vec::new(),
            pinned: Vec::new(),
            pinned_symbols: Vec::new(),
        }
    }

    /// Call `f` on every precise root.
    pub(crate) fn for_each(&self, mut f: impl FnMut(LispObject)) {
        for cell in &self.statics {
            f(cell.get());
        }
        self.shadow.iter().for_each(&mut f);
        for binding in &self.specpdl {
            f(binding.symbol);
            f(binding.old_value);
        }
        self.pinned.iter().copied().for_each(&mut f);
        self.pinned_symbols.iter().copied().for_each(&mut f);
    }
}

impl Heap {
    /// Treat the object held in `cell` as a root for the rest of the heap's
    /// life. The cell may be updated at any time.
    pub fn register_static_root(&mut self, cell: &'static Cell<LispObject>) {
        self.roots.statics.push(cell);
    }

    /// Keep `obj` alive until a matching [`Heap::unprotect`] or until the
    /// enclosing root frame is popped.
    pub fn protect(&mut self, obj: LispObject) {
        self.roots.shadow.push(obj);
    }

    /// Undo the most recent [`Heap::protect`] of `obj`. Returns false if it
    /// was not protected.
    pub fn unprotect(&mut self, obj: LispObject) -> bool {
        self.roots.shadow.pop(obj)
    }

    /// Open a frame of protected references.
    pub fn push_root_frame(&mut self) {
        self.roots.shadow.push_frame();
    }

    /// Unprotect everything protected since the matching
    /// [`Heap::push_root_frame`].
    pub fn pop_root_frame(&mut self) {
        self.roots.shadow.pop_frame();
    }

    /// Run `f` inside a root frame.
    pub fn with_root_scope<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push_root_frame();
        let result = f(self);
        self.pop_root_frame();
        result
    }

    /// Number of references currently protected.
    #[must_use]
    pub fn protected_count(&self) -> usize {
        self.roots.shadow.len()
    }

    /// Bind `symbol` dynamically to `value`, saving its current value.
    ///
    /// # Errors
    ///
    /// As for [`Heap::set`].
    pub fn specbind(&mut self, symbol: LispObject, value: LispObject) -> Result<()> {
        let old_value = self.symbol_value(symbol)?;
        self.set(symbol, value)?;
        self.roots.specpdl.push(SpecBinding { symbol, old_value });
        Ok(())
    }

    /// Current depth of the dynamic binding stack.
    #[must_use]
    pub fn specpdl_depth(&self) -> usize {
        self.roots.specpdl.len()
    }

    /// Undo dynamic bindings down to `depth`, innermost first.
    ///
    /// # Errors
    ///
    /// As for [`Heap::set`].
    pub fn unbind_to(&mut self, depth: usize) -> Result<()> {
        while self.roots.specpdl.len() > depth {
            if let Some(binding) = self.roots.specpdl.pop() {
                self.set(binding.symbol, binding.old_value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{NIL, T, UNBOUND};
    use crate::HeapConfig;

    fn n(i: i64) -> LispObject {
        LispObject::fixnum(i).unwrap()
    }

    #[test]
    fn shadow_stack_frames() {
        let mut stack = ShadowStack::new();
        stack.push(n(1));
        stack.push_frame();
        stack.push(n(2));
        stack.push(n(3));
        assert_eq!(stack.len(), 3);
        stack.pop_frame();
        assert_eq!(stack.iter().collect::<Vec<_>>(), vec![n(1)]);
        assert!(stack.pop(n(1)));
        assert!(!stack.pop(n(1)));
    }

    #[test]
    fn pop_removes_latest_duplicate() {
        let mut stack = ShadowStack::new();
        stack.push(n(1));
        stack.push(n(2));
        stack.push(n(1));
        stack.pop(n(1));
        assert_eq!(stack.iter().collect::<Vec<_>>(), vec![n(1), n(2)]);
    }

    #[test]
    fn specbind_restores_in_order() {
        let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
        let sym = heap.make_symbol("x").unwrap();
        let depth = heap.specpdl_depth();
        heap.specbind(sym, T).unwrap();
        heap.specbind(sym, n(2)).unwrap();
        assert_eq!(heap.symbol_value(sym), Ok(n(2)));
        heap.unbind_to(depth + 1).unwrap();
        assert_eq!(heap.symbol_value(sym), Ok(T));
        heap.unbind_to(depth).unwrap();
        assert_eq!(heap.symbol_value(sym), Ok(UNBOUND));
    }

    #[test]
    fn root_set_visits_bindings() {
        let mut roots = RootSet::new();
        roots.specpdl.push(SpecBinding {
            symbol: T,
            old_value: NIL,
        });
        roots.shadow.push(n(4));
        let mut seen = Vec::new();
        roots.for_each(|obj| seen.push(obj));
        assert_eq!(seen, vec![n(4), T, NIL]);
    }
}
