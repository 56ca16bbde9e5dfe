//! Character tables.
//!
//! A char table maps every character code in `0..=MAX_CHAR` to a value
//! through up to four levels. The top level has 64 entries of 65536
//! characters each; below it sub-tables split their range into 16, 32 and
//! finally 128 single characters. An entry that is not a sub-table holds the
//! value for its whole range, so a table stays small until it is filled in
//! detail.
//!
//! Slots of a char table: default, parent, purpose, the cached ASCII
//! sub-table, 64 top-level entries, then the extra slots. A sub-table starts
//! with its depth and first character as fixnums.

use crate::error::{wrong_type, Error, Result};
use crate::heap::Heap;
use crate::object::{LispObject, LispType};
use crate::space::vector::{contents, PvecType, VectorHeader};

/// Largest character code.
pub const MAX_CHAR: usize = 0x3F_FFFF;

/// Most extra slots a char table may carry.
pub const CHAR_TABLE_EXTRA_SLOTS_MAX: usize = 10;

/// Entries per table at each depth.
const CHARTAB_SIZE: [usize; 4] = [1 << 6, 1 << 4, 1 << 5, 1 << 7];

/// Characters covered by one entry at each depth.
const CHARTAB_CHARS: [usize; 4] = [1 << 16, 1 << 12, 1 << 7, 1];

const DEFAULT_SLOT: usize = 0;
const PARENT_SLOT: usize = 1;
const PURPOSE_SLOT: usize = 2;
const ASCII_SLOT: usize = 3;

/// First of the 64 top-level entries.
pub(crate) const CHAR_TABLE_CONTENTS: usize = 4;
const CHAR_TABLE_STANDARD_SLOTS: usize = CHAR_TABLE_CONTENTS + CHARTAB_SIZE[0];

/// First entry of a sub-table, after depth and first character.
pub(crate) const SUB_CHAR_TABLE_CONTENTS: usize = 2;

#[inline]
fn slot(table: LispObject, i: usize) -> *mut LispObject {
    // SAFETY: callers stay within the table's traced slots.
    unsafe { contents(table.as_ptr::<VectorHeader>()).add(i) }
}

#[inline]
fn get(table: LispObject, i: usize) -> LispObject {
    // SAFETY: see `slot`.
    unsafe { *slot(table, i) }
}

#[inline]
fn put(table: LispObject, i: usize, value: LispObject) {
    // SAFETY: see `slot`.
    unsafe { *slot(table, i) = value }
}

const fn chartab_idx(c: usize, depth: usize, min_char: usize) -> usize {
    (c - min_char) / CHARTAB_CHARS[depth]
}

impl Heap {
    fn is_sub_char_table(&self, obj: LispObject) -> bool {
        self.pvec_type(obj) == Some(PvecType::SubCharTable)
    }

    fn xchar_table(&self, obj: LispObject) -> Result<LispObject> {
        if self.pvec_type(obj) == Some(PvecType::CharTable) {
            Ok(obj)
        } else {
            Err(wrong_type("char-table", obj.lisp_type()))
        }
    }

    /// A char table for `purpose` mapping every character to `init`, with
    /// `extra_slots` more slots set to nil.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] for more than [`CHAR_TABLE_EXTRA_SLOTS_MAX`]
    /// extra slots.
    pub fn make_char_table(
        &mut self,
        purpose: LispObject,
        init: LispObject,
        extra_slots: usize,
    ) -> Result<LispObject> {
        if extra_slots > CHAR_TABLE_EXTRA_SLOTS_MAX {
            return Err(Error::OutOfRange {
                index: extra_slots,
                len: CHAR_TABLE_EXTRA_SLOTS_MAX + 1,
            });
        }
        let nslots = CHAR_TABLE_STANDARD_SLOTS + extra_slots;
        let vector = self.alloc_pseudovector_raw(PvecType::CharTable, nslots, 0);
        let table = LispObject::from_address(vector as usize, LispType::Vectorlike);
        for i in CHAR_TABLE_CONTENTS..CHAR_TABLE_STANDARD_SLOTS {
            put(table, i, init);
        }
        put(table, PURPOSE_SLOT, purpose);
        put(table, ASCII_SLOT, init);
        Ok(table)
    }

    fn make_sub_char_table(&mut self, depth: usize, min_char: usize, init: LispObject) -> LispObject {
        let nslots = SUB_CHAR_TABLE_CONTENTS + CHARTAB_SIZE[depth];
        let vector = self.alloc_pseudovector_raw(PvecType::SubCharTable, nslots, 0);
        let table = LispObject::from_address(vector as usize, LispType::Vectorlike);
        put(table, 0, LispObject::from_index(depth));
        put(table, 1, LispObject::from_index(min_char));
        for i in 0..CHARTAB_SIZE[depth] {
            put(table, SUB_CHAR_TABLE_CONTENTS + i, init);
        }
        table
    }

    /// Value recorded for `c` in the table itself, nil if none.
    fn char_table_lookup(&self, table: LispObject, c: usize) -> LispObject {
        if c < 128 {
            let ascii = get(table, ASCII_SLOT);
            if !self.is_sub_char_table(ascii) {
                return ascii;
            }
            return get(ascii, SUB_CHAR_TABLE_CONTENTS + c);
        }
        let mut value = get(table, CHAR_TABLE_CONTENTS + chartab_idx(c, 0, 0));
        let mut depth = 1;
        while self.is_sub_char_table(value) {
            let min_char = get(value, 1).as_fixnum().map_or(0, |m| m as usize);
            value = get(value, SUB_CHAR_TABLE_CONTENTS + chartab_idx(c, depth, min_char));
            depth += 1;
        }
        value
    }

    /// The value for `c`: the table's own entry, else its default, else the
    /// parent's value.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-tables, [`Error::OutOfRange`] past
    /// [`MAX_CHAR`].
    pub fn char_table_ref(&self, table: LispObject, c: usize) -> Result<LispObject> {
        let mut table = self.xchar_table(table)?;
        check_char(c)?;
        loop {
            let mut value = self.char_table_lookup(table, c);
            if value.is_nil() {
                value = get(table, DEFAULT_SLOT);
            }
            let parent = get(table, PARENT_SLOT);
            if !value.is_nil() || parent.is_nil() {
                return Ok(value);
            }
            table = parent;
        }
    }

    /// The sub-table at `index` of `table`, creating it from the entry's
    /// current value if the entry is not yet split.
    fn sub_table_at(
        &mut self,
        table: LispObject,
        index: usize,
        depth: usize,
        min_char: usize,
    ) -> LispObject {
        let entry = get(table, index);
        if self.is_sub_char_table(entry) {
            return entry;
        }
        let sub = self.make_sub_char_table(depth, min_char, entry);
        put(table, index, sub);
        sub
    }

    /// Cache the sub-table covering the ASCII range, or the value covering
    /// it if that range is not split that far.
    fn update_ascii(&self, table: LispObject) {
        let mut value = get(table, CHAR_TABLE_CONTENTS);
        for _ in 1..3 {
            if !self.is_sub_char_table(value) {
                break;
            }
            value = get(value, SUB_CHAR_TABLE_CONTENTS);
        }
        put(table, ASCII_SLOT, value);
    }

    /// Set the value for `c`.
    ///
    /// # Errors
    ///
    /// As for [`Heap::char_table_ref`], plus [`Error::ImmutableObject`] for
    /// pure tables.
    pub fn char_table_set(&mut self, table: LispObject, c: usize, value: LispObject) -> Result<()> {
        self.char_table_set_range(table, c, c, value)
    }

    /// Set the value for every character in `from..=to`.
    ///
    /// # Errors
    ///
    /// As for [`Heap::char_table_set`]; also [`Error::OutOfRange`] if
    /// `from > to`.
    pub fn char_table_set_range(
        &mut self,
        table: LispObject,
        from: usize,
        to: usize,
        value: LispObject,
    ) -> Result<()> {
        let table = self.xchar_table(table)?;
        self.check_impure(table)?;
        check_char(to)?;
        if from > to {
            return Err(Error::OutOfRange { index: from, len: to + 1 });
        }
        self.set_range(table, CHAR_TABLE_CONTENTS, 0, 0, from, to, value);
        if from < 128 {
            self.update_ascii(table);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn set_range(
        &mut self,
        table: LispObject,
        base: usize,
        depth: usize,
        min_char: usize,
        from: usize,
        to: usize,
        value: LispObject,
    ) {
        let chars = CHARTAB_CHARS[depth];
        let first = chartab_idx(from.max(min_char), depth, min_char);
        let last = chartab_idx(to.min(min_char + CHARTAB_SIZE[depth] * chars - 1), depth, min_char);
        for i in first..=last {
            let lo = min_char + i * chars;
            let hi = lo + chars - 1;
            if from <= lo && hi <= to {
                put(table, base + i, value);
            } else {
                let sub = self.sub_table_at(table, base + i, depth + 1, lo);
                self.set_range(sub, SUB_CHAR_TABLE_CONTENTS, depth + 1, lo, from, to, value);
            }
        }
    }

    /// The table consulted for characters this one leaves nil.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-tables.
    pub fn char_table_parent(&self, table: LispObject) -> Result<LispObject> {
        Ok(get(self.xchar_table(table)?, PARENT_SLOT))
    }

    /// Set the parent, nil for none.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] if either argument is not a char table (a nil
    /// parent is allowed).
    pub fn set_char_table_parent(&mut self, table: LispObject, parent: LispObject) -> Result<()> {
        let table = self.xchar_table(table)?;
        if !parent.is_nil() {
            self.xchar_table(parent)?;
        }
        self.check_impure(table)?;
        put(table, PARENT_SLOT, parent);
        Ok(())
    }

    /// The purpose the table was made for.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-tables.
    pub fn char_table_purpose(&self, table: LispObject) -> Result<LispObject> {
        Ok(get(self.xchar_table(table)?, PURPOSE_SLOT))
    }

    /// Set the value used for characters without an entry.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-tables.
    pub fn set_char_table_default(&mut self, table: LispObject, value: LispObject) -> Result<()> {
        let table = self.xchar_table(table)?;
        self.check_impure(table)?;
        put(table, DEFAULT_SLOT, value);
        Ok(())
    }

    fn extra_slot_index(&self, table: LispObject, n: usize) -> Result<usize> {
        // SAFETY: char tables are vectorlike.
        let len = unsafe { (*table.as_ptr::<VectorHeader>()).traced() };
        let extras = len - CHAR_TABLE_STANDARD_SLOTS;
        if n >= extras {
            return Err(Error::OutOfRange { index: n, len: extras });
        }
        Ok(CHAR_TABLE_STANDARD_SLOTS + n)
    }

    /// Extra slot `n`.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-tables, [`Error::OutOfRange`] past the
    /// table's extra slots.
    pub fn char_table_extra_slot(&self, table: LispObject, n: usize) -> Result<LispObject> {
        let table = self.xchar_table(table)?;
        Ok(get(table, self.extra_slot_index(table, n)?))
    }

    /// Store into extra slot `n`.
    ///
    /// # Errors
    ///
    /// As for [`Heap::char_table_extra_slot`].
    pub fn set_char_table_extra_slot(
        &mut self,
        table: LispObject,
        n: usize,
        value: LispObject,
    ) -> Result<()> {
        let table = self.xchar_table(table)?;
        self.check_impure(table)?;
        let index = self.extra_slot_index(table, n)?;
        put(table, index, value);
        Ok(())
    }
}

const fn check_char(c: usize) -> Result<()> {
    if c > MAX_CHAR {
        return Err(Error::OutOfRange {
            index: c,
            len: MAX_CHAR + 1,
        });
    }
    Ok(())
}

#[cfg(test)]
fn top_entry(table: LispObject, i: usize) -> LispObject {
    get(table, CHAR_TABLE_CONTENTS + i)
}
