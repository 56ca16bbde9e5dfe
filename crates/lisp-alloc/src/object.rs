//! Tagged Lisp references.
//!
//! A [`LispObject`] is one machine word. The low three bits are a tag naming
//! the kind of object; the remaining bits are either an inline integer
//! (fixnums) or the address of the object's cell with the tag bits cleared.
//! Every heap cell is 8-aligned, so the tag never overlaps address bits.

use std::fmt;

/// Number of low bits used for the tag.
pub const GCTYPEBITS: u32 = 3;

/// Alignment every heap object must have so its address can carry a tag.
pub const GCALIGNMENT: usize = 1 << GCTYPEBITS;

const TAG_MASK: usize = GCALIGNMENT - 1;

/// Largest value representable as a fixnum.
pub const MOST_POSITIVE_FIXNUM: i64 = (1 << 61) - 1;

/// Smallest value representable as a fixnum.
pub const MOST_NEGATIVE_FIXNUM: i64 = -MOST_POSITIVE_FIXNUM - 1;

/// Symbols with an address below this are builtin immediates rather than
/// heap cells.
pub(crate) const BUILTIN_SYMBOL_LIMIT: usize = 4096;

const TAG_SYMBOL: usize = 0;
const TAG_MISC: usize = 1;
const TAG_INT0: usize = 2;
const TAG_CONS: usize = 3;
const TAG_STRING: usize = 4;
const TAG_VECTORLIKE: usize = 5;
const TAG_INT1: usize = 6;
const TAG_FLOAT: usize = 7;

/// The kind of object a reference points to, read from its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LispType {
    /// A symbol, including the builtin `nil`, `t` and `unbound`.
    Symbol,
    /// A marker or overlay.
    Misc,
    /// An inline 62-bit integer.
    Fixnum,
    /// A pair.
    Cons,
    /// A string header.
    String,
    /// A vector, pseudovector or buffer.
    Vectorlike,
    /// A boxed double.
    Float,
}

/// A tagged reference to a Lisp value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LispObject(usize);

/// The empty list and false value.
pub const NIL: LispObject = LispObject(0);

/// The canonical true value.
pub const T: LispObject = LispObject(GCALIGNMENT);

/// The value of a symbol with no value.
pub const UNBOUND: LispObject = LispObject(2 * GCALIGNMENT);

/// Names of the builtin symbols, indexed by address / 8.
pub(crate) const BUILTIN_SYMBOL_NAMES: [&str; 3] = ["nil", "t", "unbound"];

impl LispObject {
    /// Build a reference from its raw bits.
    ///
    /// # Safety
    ///
    /// Heap accessors trust the tag and address of any reference they are
    /// given. A reference built from arbitrary bits may only be passed to
    /// [`crate::Heap::is_valid_reference`] and [`crate::Heap::mem_type_of`]
    /// unless it is known to denote a live object of the tagged kind.
    #[must_use]
    pub const unsafe fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    /// The raw bits of this reference.
    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }

    /// A fixnum, or `None` if `n` is out of the fixnum range.
    #[must_use]
    pub const fn fixnum(n: i64) -> Option<Self> {
        if n < MOST_NEGATIVE_FIXNUM || n > MOST_POSITIVE_FIXNUM {
            return None;
        }
        Some(Self(((n << 2) as usize) | TAG_INT0))
    }

    /// A fixnum from a value known to be in range, such as an index.
    pub(crate) const fn from_index(n: usize) -> Self {
        debug_assert!(n as u64 <= MOST_POSITIVE_FIXNUM as u64);
        Self((n << 2) | TAG_INT0)
    }

    /// The integer value of a fixnum.
    #[must_use]
    pub const fn as_fixnum(self) -> Option<i64> {
        if self.is_fixnum() {
            Some((self.0 as i64) >> 2)
        } else {
            None
        }
    }

    pub(crate) const fn tag(self) -> usize {
        self.0 & TAG_MASK
    }

    /// The kind of object this reference denotes.
    #[must_use]
    pub const fn lisp_type(self) -> LispType {
        match self.tag() {
            TAG_SYMBOL => LispType::Symbol,
            TAG_MISC => LispType::Misc,
            TAG_CONS => LispType::Cons,
            TAG_STRING => LispType::String,
            TAG_VECTORLIKE => LispType::Vectorlike,
            TAG_FLOAT => LispType::Float,
            _ => LispType::Fixnum,
        }
    }

    /// The builtin symbol at `index` in [`BUILTIN_SYMBOL_NAMES`].
    pub(crate) const fn builtin_symbol(index: usize) -> Self {
        Self(index * GCALIGNMENT)
    }

    /// Address of the referenced cell, with the tag cleared.
    pub(crate) const fn address(self) -> usize {
        self.0 & !TAG_MASK
    }

    /// Tag `addr` as an object of kind `ty`.
    pub(crate) fn from_address(addr: usize, ty: LispType) -> Self {
        debug_assert_eq!(addr & TAG_MASK, 0, "unaligned Lisp object address");
        let tag = match ty {
            LispType::Symbol => TAG_SYMBOL,
            LispType::Misc => TAG_MISC,
            LispType::Cons => TAG_CONS,
            LispType::String => TAG_STRING,
            LispType::Vectorlike => TAG_VECTORLIKE,
            LispType::Float => TAG_FLOAT,
            LispType::Fixnum => TAG_INT0,
        };
        Self(addr | tag)
    }

    /// Tagged pointer to the cell of type `P`.
    pub(crate) const fn as_ptr<P>(self) -> *mut P {
        self.address() as *mut P
    }

    /// True for `nil`.
    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == NIL.0
    }

    /// True for inline integers.
    #[must_use]
    pub const fn is_fixnum(self) -> bool {
        self.0 & 3 == TAG_INT0 & 3
    }

    /// True for pairs.
    #[must_use]
    pub const fn is_cons(self) -> bool {
        self.tag() == TAG_CONS
    }

    /// True for symbols, builtin or not.
    #[must_use]
    pub const fn is_symbol(self) -> bool {
        self.tag() == TAG_SYMBOL
    }

    /// True for strings.
    #[must_use]
    pub const fn is_string(self) -> bool {
        self.tag() == TAG_STRING
    }

    /// True for floats.
    #[must_use]
    pub const fn is_float(self) -> bool {
        self.tag() == TAG_FLOAT
    }

    /// True for markers and overlays.
    #[must_use]
    pub const fn is_misc(self) -> bool {
        self.tag() == TAG_MISC
    }

    /// True for vectors, pseudovectors and buffers.
    #[must_use]
    pub const fn is_vectorlike(self) -> bool {
        self.tag() == TAG_VECTORLIKE
    }

    /// True for `nil`, `t` and `unbound`, which live outside the heap.
    #[must_use]
    pub const fn is_builtin_symbol(self) -> bool {
        self.is_symbol() && self.0 < BUILTIN_SYMBOL_LIMIT
    }

    /// True for values that carry no heap pointer.
    pub(crate) const fn is_immediate(self) -> bool {
        self.is_fixnum() || self.is_builtin_symbol()
    }
}

impl Default for LispObject {
    fn default() -> Self {
        NIL
    }
}

impl fmt::Debug for LispObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(n) = self.as_fixnum() {
            return write!(f, "{n}");
        }
        if self.is_builtin_symbol() {
            let name = BUILTIN_SYMBOL_NAMES
                .get(self.0 / GCALIGNMENT)
                .copied()
                .unwrap_or("?builtin");
            return f.write_str(name);
        }
        let kind = match self.lisp_type() {
            LispType::Symbol => "symbol",
            LispType::Misc => "misc",
            LispType::Cons => "cons",
            LispType::String => "string",
            LispType::Vectorlike => "vectorlike",
            LispType::Float => "float",
            LispType::Fixnum => unreachable!(),
        };
        write!(f, "#<{kind} {:#x}>", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixnum_round_trip_at_the_edges() {
        for n in [0, 1, -1, 42, MOST_POSITIVE_FIXNUM, MOST_NEGATIVE_FIXNUM] {
            let obj = LispObject::fixnum(n).unwrap();
            assert!(obj.is_fixnum());
            assert_eq!(obj.lisp_type(), LispType::Fixnum);
            assert_eq!(obj.as_fixnum(), Some(n));
        }
        assert!(LispObject::fixnum(MOST_POSITIVE_FIXNUM + 1).is_none());
        assert!(LispObject::fixnum(MOST_NEGATIVE_FIXNUM - 1).is_none());
    }

    #[test]
    fn both_integer_tags_are_fixnums() {
        let odd = LispObject::fixnum(1).unwrap();
        assert_eq!(odd.tag(), TAG_INT1);
        let even = LispObject::fixnum(2).unwrap();
        assert_eq!(even.tag(), TAG_INT0);
    }

    #[test]
    fn builtin_symbols() {
        for obj in [NIL, T, UNBOUND] {
            assert!(obj.is_symbol());
            assert!(obj.is_builtin_symbol());
            assert!(obj.is_immediate());
        }
        assert!(NIL.is_nil());
        assert!(!T.is_nil());
        assert_eq!(format!("{T:?}"), "t");
    }

    #[test]
    fn address_tagging() {
        let addr = 0x7f00_1234_5678usize & !TAG_MASK;
        for ty in [
            LispType::Symbol,
            LispType::Misc,
            LispType::Cons,
            LispType::String,
            LispType::Vectorlike,
            LispType::Float,
        ] {
            let obj = LispObject::from_address(addr, ty);
            assert_eq!(obj.lisp_type(), ty);
            assert_eq!(obj.address(), addr);
            assert!(!obj.is_fixnum());
        }
        let sym = LispObject::from_address(addr, LispType::Symbol);
        assert!(!sym.is_builtin_symbol());
    }
}
