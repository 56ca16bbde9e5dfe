//! Boxed floats.

use super::block::{cell_ref, CellKind, CellSpace};
use crate::error::{wrong_type, Result};
use crate::heap::Heap;
use crate::mem_tree::MemType;
use crate::object::{LispObject, LispType};

#[derive(Debug, Clone, Copy)]
pub(crate) struct LispFloat(pub(crate) f64);

impl CellKind for LispFloat {
    const MEM_TYPE: MemType = MemType::Float;
    const NAME: &'static str = "float";
}

pub(crate) type FloatSpace = CellSpace<LispFloat>;

impl Heap {
    /// Box a double.
    pub fn allocate_float(&mut self, value: f64) -> LispObject {
        let slot = self.floats.allocate(LispFloat(value), &mut self.mem);
        self.consing_since_gc += FloatSpace::SLOT_SIZE;
        LispObject::from_address(slot as usize, LispType::Float)
    }

    /// The value of a boxed float.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for anything but a float.
    pub fn float_value(&self, obj: LispObject) -> Result<f64> {
        if !obj.is_float() {
            return Err(wrong_type("float", obj.lisp_type()));
        }
        // SAFETY: a float-tagged reference denotes a live or pure float.
        Ok(unsafe { cell_ref::<LispFloat>(obj.address()) }.0)
    }
}
