//! The obarray: the table of interned symbols.
//!
//! A plain Lisp vector of buckets. Each bucket is either the fixnum 0 or the
//! first symbol of a chain linked through the symbols' `next` field. The
//! vector is a root, and marking a symbol follows its chain, so every
//! interned symbol stays alive.

use crate::error::Result;
use crate::heap::Heap;
use crate::object::{LispObject, BUILTIN_SYMBOL_NAMES};
use crate::space::symbol::{SymbolValue, CHAIN_END};

/// Number of buckets.
pub const OBARRAY_SIZE: usize = 1511;

/// Hash of a symbol name.
pub(crate) fn hash_string(bytes: &[u8]) -> usize {
    bytes.iter().fold(0usize, |hash, &c| {
        (hash << 4)
            .wrapping_add(hash >> (usize::BITS - 4))
            .wrapping_add(usize::from(c))
    })
}

enum Lookup {
    Found(LispObject),
    Missing(usize),
}

impl Heap {
    fn bucket_of(&self, name: &[u8]) -> usize {
        hash_string(name) % OBARRAY_SIZE
    }

    fn oblookup(&self, name: &[u8]) -> Result<Lookup> {
        let index = self.bucket_of(name);
        let mut tail = self.aref(self.obarray, index)?;
        while tail != CHAIN_END {
            let sym = self.xsymbol(tail)?;
            if self.string_bytes(sym.name)? == name {
                return Ok(Lookup::Found(tail));
            }
            tail = sym.next;
        }
        Ok(Lookup::Missing(index))
    }

    /// The interned symbol named `name`, creating it if needed. Names
    /// starting with `:` make self-evaluating keywords. The names `nil`,
    /// `t` and `unbound` give the builtin symbols.
    ///
    /// # Errors
    ///
    /// [`crate::Error::StringTooLong`] for an oversized name.
    pub fn intern(&mut self, name: &str) -> Result<LispObject> {
        if let Some(builtin) = builtin_symbol(name) {
            return Ok(builtin);
        }
        let index = match self.oblookup(name.as_bytes())? {
            Lookup::Found(sym) => return Ok(sym),
            Lookup::Missing(index) => index,
        };
        let name_string = if self.purify {
            self.make_pure_string(name.as_bytes(), !name.is_ascii())?
        } else {
            self.make_string(name)?
        };
        let sym = self.allocate_symbol(name_string)?;
        let head = self.aref(self.obarray, index)?;
        {
            let symbol = self.xsymbol_mut(sym)?;
            symbol.interned = true;
            symbol.next = head;
            if name.starts_with(':') {
                symbol.value = SymbolValue::Plain(sym);
            }
        }
        self.aset(self.obarray, index, sym)?;
        Ok(sym)
    }

    /// The interned symbol named `name`, if there is one.
    ///
    /// # Errors
    ///
    /// Only on a corrupted obarray.
    pub fn intern_soft(&self, name: &str) -> Result<Option<LispObject>> {
        if let Some(builtin) = builtin_symbol(name) {
            return Ok(Some(builtin));
        }
        Ok(match self.oblookup(name.as_bytes())? {
            Lookup::Found(sym) => Some(sym),
            Lookup::Missing(_) => None,
        })
    }

    /// Remove the symbol named `name` from the obarray. Returns false if
    /// there was none. The symbol itself lives on while referenced.
    ///
    /// # Errors
    ///
    /// Only on a corrupted obarray.
    pub fn unintern(&mut self, name: &str) -> Result<bool> {
        let sym = match self.oblookup(name.as_bytes())? {
            Lookup::Found(sym) => sym,
            Lookup::Missing(_) => return Ok(false),
        };
        let index = self.bucket_of(name.as_bytes());
        let next = self.xsymbol(sym)?.next;
        let head = self.aref(self.obarray, index)?;
        if head == sym {
            self.aset(self.obarray, index, next)?;
        } else {
            let mut prev = head;
            loop {
                let after = self.xsymbol(prev)?.next;
                if after == sym {
                    self.xsymbol_mut(prev)?.next = next;
                    break;
                }
                prev = after;
            }
        }
        let symbol = self.xsymbol_mut(sym)?;
        symbol.interned = false;
        symbol.next = CHAIN_END;
        Ok(true)
    }

    /// Call `f` on every interned heap symbol.
    ///
    /// # Errors
    ///
    /// Only on a corrupted obarray.
    pub fn mapatoms(&self, mut f: impl FnMut(LispObject)) -> Result<()> {
        for index in 0..OBARRAY_SIZE {
            let mut tail = self.aref(self.obarray, index)?;
            while tail != CHAIN_END {
                f(tail);
                tail = self.xsymbol(tail)?.next;
            }
        }
        Ok(())
    }

    /// The obarray vector.
    #[must_use]
    pub const fn obarray(&self) -> LispObject {
        self.obarray
    }
}

fn builtin_symbol(name: &str) -> Option<LispObject> {
    BUILTIN_SYMBOL_NAMES
        .iter()
        .position(|&builtin| builtin == name)
        .map(LispObject::builtin_symbol)
}
