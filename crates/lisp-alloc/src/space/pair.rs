//! Pairs.

use super::block::{cell_mut, cell_ref, CellKind, CellSpace};
use crate::error::{wrong_type, Error, Result};
use crate::heap::Heap;
use crate::mem_tree::MemType;
use crate::object::{LispObject, LispType, NIL};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Cons {
    pub(crate) car: LispObject,
    pub(crate) cdr: LispObject,
}

impl CellKind for Cons {
    const MEM_TYPE: MemType = MemType::Cons;
    const NAME: &'static str = "cons";
}

pub(crate) type ConsSpace = CellSpace<Cons>;

impl Heap {
    /// Allocate a pair `(car . cdr)`.
    pub fn allocate_pair(&mut self, car: LispObject, cdr: LispObject) -> LispObject {
        let slot = self.conses.allocate(Cons { car, cdr }, &mut self.mem);
        self.consing_since_gc += ConsSpace::SLOT_SIZE;
        LispObject::from_address(slot as usize, LispType::Cons)
    }

    /// A proper list of `items`.
    pub fn list(&mut self, items: &[LispObject]) -> LispObject {
        items
            .iter()
            .rev()
            .fold(NIL, |tail, &item| self.allocate_pair(item, tail))
    }

    pub(crate) fn xcons(&self, obj: LispObject) -> Result<&Cons> {
        if !obj.is_cons() {
            return Err(wrong_type("cons", obj.lisp_type()));
        }
        // SAFETY: a cons-tagged reference denotes a live or pure pair.
        Ok(unsafe { cell_ref::<Cons>(obj.address()) })
    }

    fn xcons_mut(&mut self, obj: LispObject) -> Result<&mut Cons> {
        if !obj.is_cons() {
            return Err(wrong_type("cons", obj.lisp_type()));
        }
        self.check_impure(obj)?;
        // SAFETY: as in `xcons`, and `&mut self` makes the access exclusive.
        Ok(unsafe { cell_mut::<Cons>(obj.address()) })
    }

    /// First element of a pair; `nil` for `nil`.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] if `list` is neither a pair nor `nil`.
    pub fn car(&self, list: LispObject) -> Result<LispObject> {
        if list.is_nil() {
            return Ok(NIL);
        }
        self.xcons(list)
            .map(|c| c.car)
            .map_err(|_| wrong_type("list", list.lisp_type()))
    }

    /// Rest of a pair; `nil` for `nil`.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] if `list` is neither a pair nor `nil`.
    pub fn cdr(&self, list: LispObject) -> Result<LispObject> {
        if list.is_nil() {
            return Ok(NIL);
        }
        self.xcons(list)
            .map(|c| c.cdr)
            .map_err(|_| wrong_type("list", list.lisp_type()))
    }

    /// Replace the first element of a pair.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for a non-pair, [`Error::ImmutableObject`] for
    /// a pure pair.
    pub fn setcar(&mut self, cell: LispObject, value: LispObject) -> Result<()> {
        self.xcons_mut(cell)?.car = value;
        Ok(())
    }

    /// Replace the rest of a pair.
    ///
    /// # Errors
    ///
    /// As for [`Heap::setcar`].
    pub fn setcdr(&mut self, cell: LispObject, value: LispObject) -> Result<()> {
        self.xcons_mut(cell)?.cdr = value;
        Ok(())
    }

    /// The elements of a proper list.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] if `list` is not a proper list.
    pub fn list_to_vec(&self, list: LispObject) -> Result<Vec<LispObject>> {
        let mut out = Vec::new();
        let mut tail = list;
        while !tail.is_nil() {
            let cell = self.xcons(tail).map_err(|_| wrong_type("list", tail.lisp_type()))?;
            out.push(cell.car);
            tail = cell.cdr;
        }
        Ok(out)
    }

    pub(crate) fn check_impure(&self, obj: LispObject) -> Result<()> {
        if self.pure.contains(obj.address()) {
            Err(Error::ImmutableObject)
        } else {
            Ok(())
        }
    }
}
