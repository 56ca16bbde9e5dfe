//! Symbols and their value cells.

use std::cell::Cell;

use super::block::{cell_mut, cell_ref, CellKind, CellSpace};
use super::buffer::Buffer;
use crate::error::{wrong_type, Error, Result};
use crate::heap::Heap;
use crate::mem_tree::MemType;
use crate::object::{LispObject, LispType, NIL, UNBOUND};

/// Terminates an intern chain. Also marks an empty obarray bucket.
pub(crate) const CHAIN_END: LispObject = LispObject::from_index(0);

/// A buffer-local binding. `valcell` is the `(SYMBOL . VALUE)` pair loaded
/// for `where_`; `defcell` holds the default value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalBinding {
    pub(crate) where_: LispObject,
    pub(crate) valcell: LispObject,
    pub(crate) defcell: LispObject,
}

#[derive(Debug)]
pub(crate) enum SymbolValue {
    Plain(LispObject),
    Alias(LispObject),
    Localized(Box<LocalBinding>),
    Forwarded(&'static Cell<LispObject>),
}

#[derive(Debug)]
pub(crate) struct LispSymbol {
    pub(crate) name: LispObject,
    pub(crate) value: SymbolValue,
    pub(crate) function: LispObject,
    pub(crate) plist: LispObject,
    /// Next symbol in the same obarray bucket.
    pub(crate) next: LispObject,
    pub(crate) interned: bool,
    /// Marked at every collection.
    pub(crate) pinned: bool,
}

impl CellKind for LispSymbol {
    const MEM_TYPE: MemType = MemType::Symbol;
    const NAME: &'static str = "symbol";
}

pub(crate) type SymbolSpace = CellSpace<LispSymbol>;

/// Longest alias chain followed before giving up.
const MAX_ALIAS_DEPTH: usize = 100;

impl Heap {
    /// An uninterned symbol named `name`, unbound, with no function and an
    /// empty property list.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] if `name` is not a string.
    pub fn allocate_symbol(&mut self, name: LispObject) -> Result<LispObject> {
        if !name.is_string() {
            return Err(wrong_type("string", name.lisp_type()));
        }
        let pinned = self.pure.contains(name.address());
        let slot = self.symbols.allocate(
            LispSymbol {
                name,
                value: SymbolValue::Plain(UNBOUND),
                function: NIL,
                plist: NIL,
                next: CHAIN_END,
                interned: false,
                pinned,
            },
            &mut self.mem,
        );
        self.consing_since_gc += SymbolSpace::SLOT_SIZE;
        let symbol = LispObject::from_address(slot as usize, LispType::Symbol);
        if pinned {
            self.roots.pinned_symbols.push(symbol);
        }
        Ok(symbol)
    }

    /// `make-symbol`: an uninterned symbol with a fresh name.
    ///
    /// # Errors
    ///
    /// [`Error::StringTooLong`] for an oversized name.
    pub fn make_symbol(&mut self, name: &str) -> Result<LispObject> {
        let name = self.make_string(name)?;
        self.allocate_symbol(name)
    }

    pub(crate) fn xsymbol(&self, obj: LispObject) -> Result<&LispSymbol> {
        if !obj.is_symbol() || obj.is_builtin_symbol() {
            return Err(wrong_type("symbol", obj.lisp_type()));
        }
        // SAFETY: a heap symbol reference denotes a live symbol cell.
        Ok(unsafe { cell_ref::<LispSymbol>(obj.address()) })
    }

    pub(crate) fn xsymbol_mut(&mut self, obj: LispObject) -> Result<&mut LispSymbol> {
        if obj.is_builtin_symbol() {
            return Err(Error::ImmutableObject);
        }
        if !obj.is_symbol() {
            return Err(wrong_type("symbol", obj.lisp_type()));
        }
        // SAFETY: as in `xsymbol`; `&mut self` makes the access exclusive.
        Ok(unsafe { cell_mut::<LispSymbol>(obj.address()) })
    }

    /// Pin `symbol` so that every collection marks it.
    pub(crate) fn pin_symbol(&mut self, symbol: LispObject) {
        if let Ok(sym) = self.xsymbol_mut(symbol) {
            if !sym.pinned {
                sym.pinned = true;
                self.roots.pinned_symbols.push(symbol);
            }
        }
    }

    /// The name string of a symbol.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-symbols.
    pub fn symbol_name(&self, symbol: LispObject) -> Result<LispObject> {
        if symbol.is_builtin_symbol() {
            return Ok(self.builtin_names[symbol.address() / 8]);
        }
        Ok(self.xsymbol(symbol)?.name)
    }

    /// True if `symbol` is in the obarray.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-symbols.
    pub fn symbol_interned_p(&self, symbol: LispObject) -> Result<bool> {
        if symbol.is_builtin_symbol() {
            return Ok(true);
        }
        Ok(self.xsymbol(symbol)?.interned)
    }

    /// The end of `symbol`'s alias chain.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-symbols, [`Error::CyclicAlias`] if the
    /// chain does not end.
    pub fn indirect_variable(&self, symbol: LispObject) -> Result<LispObject> {
        let mut current = symbol;
        for _ in 0..MAX_ALIAS_DEPTH {
            if current.is_builtin_symbol() {
                return Ok(current);
            }
            match self.xsymbol(current)?.value {
                SymbolValue::Alias(target) => current = target,
                _ => return Ok(current),
            }
        }
        Err(Error::CyclicAlias)
    }

    /// The current value of `symbol`, following aliases. Returns
    /// [`UNBOUND`] for a void variable.
    ///
    /// # Errors
    ///
    /// As for [`Heap::indirect_variable`].
    pub fn symbol_value(&self, symbol: LispObject) -> Result<LispObject> {
        let symbol = self.indirect_variable(symbol)?;
        if symbol.is_builtin_symbol() {
            return Ok(symbol);
        }
        Ok(match &self.xsymbol(symbol)?.value {
            SymbolValue::Plain(value) => *value,
            SymbolValue::Alias(_) => UNBOUND,
            SymbolValue::Localized(binding) => self.cdr(binding.valcell)?,
            SymbolValue::Forwarded(cell) => cell.get(),
        })
    }

    /// Set the current value of `symbol`, following aliases.
    ///
    /// # Errors
    ///
    /// [`Error::ImmutableObject`] for `nil`, `t` and `unbound`, otherwise as
    /// for [`Heap::indirect_variable`].
    pub fn set(&mut self, symbol: LispObject, value: LispObject) -> Result<()> {
        let symbol = self.indirect_variable(symbol)?;
        let valcell = match &mut self.xsymbol_mut(symbol)?.value {
            SymbolValue::Plain(slot) => {
                *slot = value;
                return Ok(());
            }
            SymbolValue::Alias(_) => return Err(Error::CyclicAlias),
            SymbolValue::Forwarded(cell) => {
                cell.set(value);
                return Ok(());
            }
            SymbolValue::Localized(binding) => binding.valcell,
        };
        self.setcdr(valcell, value)
    }

    /// Make `symbol` an alias for `base`. The alias's old value is dropped.
    ///
    /// # Errors
    ///
    /// [`Error::CyclicAlias`] if `base` already leads back to `symbol`,
    /// [`Error::ImmutableObject`] for builtin symbols.
    pub fn defvaralias(&mut self, symbol: LispObject, base: LispObject) -> Result<()> {
        if !base.is_symbol() {
            return Err(wrong_type("symbol", base.lisp_type()));
        }
        if self.indirect_variable(base)? == symbol {
            return Err(Error::CyclicAlias);
        }
        self.xsymbol_mut(symbol)?.value = SymbolValue::Alias(base);
        Ok(())
    }

    /// Tie the value of `symbol` to a native variable.
    ///
    /// # Errors
    ///
    /// [`Error::ImmutableObject`] for builtin symbols.
    pub fn forward_symbol(
        &mut self,
        symbol: LispObject,
        cell: &'static Cell<LispObject>,
    ) -> Result<()> {
        self.xsymbol_mut(symbol)?.value = SymbolValue::Forwarded(cell);
        Ok(())
    }

    /// Give `symbol` buffer-local bindings. Its current value becomes the
    /// default.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for aliases and forwarded symbols.
    pub fn make_variable_buffer_local(&mut self, symbol: LispObject) -> Result<()> {
        let symbol = self.indirect_variable(symbol)?;
        let default = match self.xsymbol(symbol)?.value {
            SymbolValue::Localized(_) => return Ok(()),
            SymbolValue::Plain(value) => value,
            _ => return Err(wrong_type("plain variable", LispType::Symbol)),
        };
        let defcell = self.allocate_pair(symbol, default);
        self.xsymbol_mut(symbol)?.value = SymbolValue::Localized(Box::new(LocalBinding {
            where_: NIL,
            valcell: defcell,
            defcell,
        }));
        Ok(())
    }

    fn local_binding(&self, symbol: LispObject) -> Result<LocalBinding> {
        match &self.xsymbol(symbol)?.value {
            SymbolValue::Localized(binding) => Ok(**binding),
            _ => Err(wrong_type("buffer-local variable", LispType::Symbol)),
        }
    }

    fn set_local_binding(&mut self, symbol: LispObject, new: LocalBinding) -> Result<()> {
        if let SymbolValue::Localized(binding) = &mut self.xsymbol_mut(symbol)?.value {
            **binding = new;
        }
        Ok(())
    }

    /// Give `symbol` its own value in `buffer` and load that binding.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] if `symbol` is not buffer-local or `buffer` is
    /// not a live buffer.
    pub fn set_buffer_local_value(
        &mut self,
        symbol: LispObject,
        buffer: LispObject,
        value: LispObject,
    ) -> Result<()> {
        let symbol = self.indirect_variable(symbol)?;
        let mut binding = self.local_binding(symbol)?;
        let b = self.xlive_buffer(buffer)?;
        // SAFETY: `b` is a live buffer.
        let alist = unsafe { (*b).local_var_alist };
        let mut tail = alist;
        let mut cell = NIL;
        while tail.is_cons() {
            let entry = self.car(tail)?;
            if self.car(entry)? == symbol {
                cell = entry;
                break;
            }
            tail = self.cdr(tail)?;
        }
        if cell.is_nil() {
            cell = self.allocate_pair(symbol, value);
            let alist = self.allocate_pair(cell, alist);
            // SAFETY: allocation does not collect, so `b` is still live.
            unsafe { (*b).local_var_alist = alist };
        } else {
            self.setcdr(cell, value)?;
        }
        binding.where_ = buffer;
        binding.valcell = cell;
        self.set_local_binding(symbol, binding)
    }

    /// Load the global binding of a buffer-local `symbol`.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] if `symbol` is not buffer-local.
    pub fn swap_in_global_binding(&mut self, symbol: LispObject) -> Result<()> {
        let mut binding = self.local_binding(symbol)?;
        binding.where_ = NIL;
        binding.valcell = binding.defcell;
        self.set_local_binding(symbol, binding)
    }

    /// The buffer whose binding of `symbol` is loaded, or nil.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] if `symbol` is not buffer-local.
    pub fn local_binding_buffer(&self, symbol: LispObject) -> Result<LispObject> {
        Ok(self.local_binding(symbol)?.where_)
    }

    /// The default value of `symbol`: its global binding if it is
    /// buffer-local, else its value.
    ///
    /// # Errors
    ///
    /// As for [`Heap::symbol_value`].
    pub fn default_value(&self, symbol: LispObject) -> Result<LispObject> {
        let symbol = self.indirect_variable(symbol)?;
        match self.local_binding(symbol) {
            Ok(binding) => self.cdr(binding.defcell),
            Err(_) => self.symbol_value(symbol),
        }
    }

    /// Set the default value of `symbol`.
    ///
    /// # Errors
    ///
    /// As for [`Heap::set`].
    pub fn set_default(&mut self, symbol: LispObject, value: LispObject) -> Result<()> {
        let symbol = self.indirect_variable(symbol)?;
        match self.local_binding(symbol) {
            Ok(binding) => self.setcdr(binding.defcell, value),
            Err(_) => self.set(symbol, value),
        }
    }

    /// The function cell of `symbol`.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-symbols.
    pub fn symbol_function(&self, symbol: LispObject) -> Result<LispObject> {
        if symbol.is_builtin_symbol() {
            return Ok(NIL);
        }
        Ok(self.xsymbol(symbol)?.function)
    }

    /// Replace the function cell of `symbol`.
    ///
    /// # Errors
    ///
    /// [`Error::ImmutableObject`] for builtin symbols.
    pub fn fset(&mut self, symbol: LispObject, function: LispObject) -> Result<()> {
        self.xsymbol_mut(symbol)?.function = function;
        Ok(())
    }

    /// The property list of `symbol`.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-symbols.
    pub fn symbol_plist(&self, symbol: LispObject) -> Result<LispObject> {
        if symbol.is_builtin_symbol() {
            return Ok(NIL);
        }
        Ok(self.xsymbol(symbol)?.plist)
    }

    /// Replace the property list of `symbol`.
    ///
    /// # Errors
    ///
    /// [`Error::ImmutableObject`] for builtin symbols.
    pub fn setplist(&mut self, symbol: LispObject, plist: LispObject) -> Result<()> {
        self.xsymbol_mut(symbol)?.plist = plist;
        Ok(())
    }

    /// Property `prop` of `symbol`, or nil.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-symbols or a malformed property list.
    pub fn get(&self, symbol: LispObject, prop: LispObject) -> Result<LispObject> {
        let mut tail = self.symbol_plist(symbol)?;
        while tail.is_cons() {
            let rest = self.cdr(tail)?;
            if self.car(tail)? == prop {
                return self.car(rest);
            }
            tail = self.cdr(rest)?;
        }
        Ok(NIL)
    }

    /// Set property `prop` of `symbol` to `value`.
    ///
    /// # Errors
    ///
    /// As for [`Heap::setplist`].
    pub fn put(&mut self, symbol: LispObject, prop: LispObject, value: LispObject) -> Result<()> {
        let plist = self.symbol_plist(symbol)?;
        let mut tail = plist;
        while tail.is_cons() {
            let rest = self.cdr(tail)?;
            if self.car(tail)? == prop {
                return self.setcar(rest, value);
            }
            tail = self.cdr(rest)?;
        }
        let rest = self.allocate_pair(value, plist);
        let plist = self.allocate_pair(prop, rest);
        self.setplist(symbol, plist)
    }
}

/// True if the binding is loaded for a buffer that has since been killed.
pub(crate) fn binding_buffer_killed(binding: &LocalBinding) -> bool {
    if !binding.where_.is_vectorlike() {
        return false;
    }
    let buffer = binding.where_.as_ptr::<Buffer>();
    // SAFETY: `where_` only ever holds buffers, which are marked through the
    // binding and so outlive it.
    unsafe { (*buffer).name.is_nil() }
}
