//! `eq` hash tables, optionally weak.
//!
//! Entries live in parallel vectors: `key_and_value` holds key and value of
//! entry `i` at `2i` and `2i + 1`, `hash` its hash code, and `next` the
//! index of the following entry in the same bucket. `index` maps a bucket to
//! its first entry. Free entries are chained through `next` from
//! `next_free`; their hash code is nil.
//!
//! The key/value vector sits outside the traced slots, so the collector
//! decides how to mark it: fully for ordinary tables, only its header for
//! weak ones, whose entries are resolved after everything else is marked.

use std::mem::size_of;
use std::ptr;

use crate::config::WORD_SIZE;
use crate::error::{wrong_type, Error, Result};
use crate::heap::Heap;
use crate::object::{LispObject, LispType, MOST_POSITIVE_FIXNUM, NIL};
use crate::space::vector::{contents, PvecType, VectorHeader, VECTOR_ELTS_MAX};

/// Entries a table has room for when no size is given.
pub const DEFAULT_HASH_SIZE: usize = 65;

const HASH_TABLE_TRACED_SLOTS: usize = 4;
const HASH_TABLE_WORDS: usize = size_of::<HashTable>() / WORD_SIZE - 1;

/// Most entries a table can hold: its key/value vector has two slots each.
const HASH_TABLE_SIZE_MAX: usize = VECTOR_ELTS_MAX / 2;

/// What makes an entry of a weak table removable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Weakness {
    /// Removed once the key is otherwise unreachable.
    Key,
    /// Removed once the value is otherwise unreachable.
    Value,
    /// Removed once both key and value are otherwise unreachable.
    KeyOrValue,
    /// Removed once either key or value is otherwise unreachable.
    KeyAndValue,
}

impl Weakness {
    const fn code(self) -> i64 {
        match self {
            Self::Key => 1,
            Self::Value => 2,
            Self::KeyOrValue => 3,
            Self::KeyAndValue => 4,
        }
    }

    const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Key),
            2 => Some(Self::Value),
            3 => Some(Self::KeyOrValue),
            4 => Some(Self::KeyAndValue),
            _ => None,
        }
    }

    /// Does an entry stay, given which of its parts are known to survive?
    pub(crate) const fn keeps(self, key_survives: bool, value_survives: bool) -> bool {
        match self {
            Self::Key => key_survives,
            Self::Value => value_survives,
            Self::KeyOrValue => key_survives || value_survives,
            Self::KeyAndValue => key_survives && value_survives,
        }
    }
}

#[repr(C)]
pub(crate) struct HashTable {
    pub(crate) header: VectorHeader,
    /// Weakness code as a fixnum, or nil.
    weak: LispObject,
    hash: LispObject,
    next: LispObject,
    index: LispObject,
    count: usize,
    next_free: isize,
    pub(crate) key_and_value: LispObject,
    pub(crate) next_weak: *mut HashTable,
}

#[inline]
fn slot(vector: LispObject, i: usize) -> *mut LispObject {
    // SAFETY: callers index within the vector's length.
    unsafe { contents(vector.as_ptr::<VectorHeader>()).add(i) }
}

fn as_index(obj: LispObject) -> isize {
    obj.as_fixnum().map_or(-1, |n| n as isize)
}

fn index_obj(i: isize) -> LispObject {
    LispObject::fixnum(i as i64).unwrap_or(NIL)
}

pub(crate) fn sxhash_eq(key: LispObject) -> usize {
    let bits = key.bits();
    (bits ^ (bits >> 29) ^ (bits >> 3)) & MOST_POSITIVE_FIXNUM as usize
}

impl HashTable {
    pub(crate) fn weakness(&self) -> Option<Weakness> {
        self.weak.as_fixnum().and_then(Weakness::from_code)
    }

    fn size(&self) -> usize {
        // SAFETY: `hash` is a plain vector.
        unsafe { (*self.hash.as_ptr::<VectorHeader>()).traced() }
    }

    pub(crate) fn key(&self, i: usize) -> LispObject {
        // SAFETY: `i` is below the size.
        unsafe { *slot(self.key_and_value, 2 * i) }
    }

    pub(crate) fn value(&self, i: usize) -> LispObject {
        // SAFETY: `i` is below the size.
        unsafe { *slot(self.key_and_value, 2 * i + 1) }
    }

    fn is_used(&self, i: usize) -> bool {
        // SAFETY: `i` is below the size.
        !unsafe { *slot(self.hash, i) }.is_nil()
    }

    fn next_of(&self, i: usize) -> isize {
        // SAFETY: `i` is below the size.
        as_index(unsafe { *slot(self.next, i) })
    }

    fn bucket_head(&self, bucket: usize) -> isize {
        // SAFETY: buckets are below the size.
        as_index(unsafe { *slot(self.index, bucket) })
    }

    fn lookup(&self, key: LispObject) -> Option<usize> {
        let mut i = self.bucket_head(sxhash_eq(key) % self.size());
        while i >= 0 {
            let entry = i as usize;
            if self.key(entry) == key {
                return Some(entry);
            }
            i = self.next_of(entry);
        }
        None
    }

    /// Store into a free entry. The table must have one.
    fn insert(&mut self, key: LispObject, value: LispObject, hash: usize) {
        let i = self.next_free as usize;
        let bucket = hash % self.size();
        // SAFETY: `i` is a free entry and `bucket` a bucket of this table.
        unsafe {
            self.next_free = as_index(*slot(self.next, i));
            *slot(self.key_and_value, 2 * i) = key;
            *slot(self.key_and_value, 2 * i + 1) = value;
            *slot(self.hash, i) = LispObject::from_index(hash);
            *slot(self.next, i) = *slot(self.index, bucket);
            *slot(self.index, bucket) = index_obj(i as isize);
        }
        self.count += 1;
    }

    /// Unlink and clear entry `i`, found after `prev` in bucket `bucket`.
    fn unlink(&mut self, i: usize, prev: Option<usize>, bucket: usize) {
        let next = self.next_of(i);
        // SAFETY: `i`, `prev` and `bucket` belong to this table.
        unsafe {
            match prev {
                Some(p) => *slot(self.next, p) = index_obj(next),
                None => *slot(self.index, bucket) = index_obj(next),
            }
            *slot(self.key_and_value, 2 * i) = NIL;
            *slot(self.key_and_value, 2 * i + 1) = NIL;
            *slot(self.hash, i) = NIL;
            *slot(self.next, i) = index_obj(self.next_free);
        }
        self.next_free = i as isize;
        self.count -= 1;
    }

    /// Visit every entry as `(key, value)`.
    pub(crate) fn for_each_entry(&self, mut f: impl FnMut(LispObject, LispObject)) {
        for i in 0..self.size() {
            if self.is_used(i) {
                f(self.key(i), self.value(i));
            }
        }
    }

    /// Remove entries for which `dead` holds. Returns how many went.
    pub(crate) fn remove_where(
        &mut self,
        mut dead: impl FnMut(LispObject, LispObject) -> bool,
    ) -> usize {
        let mut removed = 0;
        for bucket in 0..self.size() {
            let mut prev = None;
            let mut i = self.bucket_head(bucket);
            while i >= 0 {
                let entry = i as usize;
                let next = self.next_of(entry);
                if dead(self.key(entry), self.value(entry)) {
                    self.unlink(entry, prev, bucket);
                    removed += 1;
                } else {
                    prev = Some(entry);
                }
                i = next;
            }
        }
        removed
    }

    pub(crate) const fn count(&self) -> usize {
        self.count
    }
}

/// `size` if a table of that many entries fits, else the error to report.
const fn checked_table_size(size: usize) -> Result<usize> {
    if size > HASH_TABLE_SIZE_MAX {
        return Err(Error::VectorTooLarge {
            requested: size.saturating_mul(2),
        });
    }
    Ok(size)
}

impl Heap {
    /// A new `eq` table with room for `size` entries before it grows.
    ///
    /// # Errors
    ///
    /// [`Error::VectorTooLarge`] if the entry vectors for `size` entries
    /// would not fit a vector.
    pub fn make_hash_table(&mut self, weak: Option<Weakness>, size: usize) -> Result<LispObject> {
        let size = checked_table_size(size.max(1))?;
        let table = self
            .alloc_pseudovector_raw(
                PvecType::HashTable,
                HASH_TABLE_TRACED_SLOTS,
                HASH_TABLE_WORDS - HASH_TABLE_TRACED_SLOTS,
            )
            .cast::<HashTable>();
        let (hash, next, index, key_and_value) = self.hash_vectors(size);
        // SAFETY: the pseudovector has the size and header of a HashTable.
        unsafe {
            let header = ptr::read(&raw const (*table).header);
            table.write(HashTable {
                header,
                weak: weak.map_or(NIL, |w| LispObject::fixnum(w.code()).unwrap_or(NIL)),
                hash,
                next,
                index,
                count: 0,
                next_free: 0,
                key_and_value,
                next_weak: ptr::null_mut(),
            });
            if weak.is_some() {
                (*table).next_weak = self.weak_tables;
                self.weak_tables = table;
            }
        }
        Ok(LispObject::from_address(table as usize, LispType::Vectorlike))
    }

    /// Fresh entry vectors for `size` entries, all free. `size` has passed
    /// [`checked_table_size`].
    fn hash_vectors(&mut self, size: usize) -> (LispObject, LispObject, LispObject, LispObject) {
        let alloc = |heap: &mut Self, len: usize, fill: LispObject| {
            let v = heap.alloc_vectorlike(len);
            // SAFETY: room for the header and `len` slots.
            unsafe {
                v.write(VectorHeader::plain(len));
                for i in 0..len {
                    contents(v).add(i).write(fill);
                }
            }
            LispObject::from_address(v as usize, LispType::Vectorlike)
        };
        let hash = alloc(self, size, NIL);
        let next = alloc(self, size, NIL);
        let index = alloc(self, size, index_obj(-1));
        let key_and_value = alloc(self, 2 * size, NIL);
        for i in 0..size {
            let after = if i + 1 < size { i as isize + 1 } else { -1 };
            // SAFETY: `i` is below `size`.
            unsafe { *slot(next, i) = index_obj(after) };
        }
        (hash, next, index, key_and_value)
    }

    pub(crate) fn xhash_table(&self, obj: LispObject) -> Result<*mut HashTable> {
        if self.pvec_type(obj) == Some(PvecType::HashTable) {
            Ok(obj.as_ptr::<HashTable>())
        } else {
            Err(wrong_type("hash-table", obj.lisp_type()))
        }
    }

    /// Double the table's room and rehash every entry.
    fn grow_hash_table(&mut self, table: *mut HashTable) -> Result<()> {
        // SAFETY: `table` is a hash table; allocation does not collect.
        unsafe {
            let old_size = (*table).size();
            let new_size = checked_table_size(old_size.saturating_mul(2))?;
            let mut entries = Vec::with_capacity((*table).count);
            for i in 0..old_size {
                if (*table).is_used(i) {
                    entries.push(((*table).key(i), (*table).value(i), as_index(*slot((*table).hash, i))));
                }
            }
            let (hash, next, index, key_and_value) = self.hash_vectors(new_size);
            (*table).hash = hash;
            (*table).next = next;
            (*table).index = index;
            (*table).key_and_value = key_and_value;
            (*table).count = 0;
            (*table).next_free = 0;
            for (key, value, code) in entries {
                (*table).insert(key, value, code as usize);
            }
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(size = unsafe { (*table).size() }, "hash table grown");
        Ok(())
    }

    /// Associate `value` with `key`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-tables, and
    /// [`crate::Error::VectorTooLarge`] if a full table cannot grow.
    pub fn hash_put(&mut self, table: LispObject, key: LispObject, value: LispObject) -> Result<()> {
        let h = self.xhash_table(table)?;
        // SAFETY: `h` is a hash table.
        unsafe {
            if let Some(i) = (*h).lookup(key) {
                *slot((*h).key_and_value, 2 * i + 1) = value;
                return Ok(());
            }
            if (*h).next_free < 0 {
                self.grow_hash_table(h)?;
            }
            (*h).insert(key, value, sxhash_eq(key));
        }
        Ok(())
    }

    /// The value stored under `key`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-tables.
    pub fn hash_get(&self, table: LispObject, key: LispObject) -> Result<Option<LispObject>> {
        let h = self.xhash_table(table)?;
        // SAFETY: `h` is a hash table.
        let h = unsafe { &*h };
        Ok(h.lookup(key).map(|i| h.value(i)))
    }

    /// Remove `key`. Returns false if it was not there.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-tables.
    pub fn hash_remove(&mut self, table: LispObject, key: LispObject) -> Result<bool> {
        let h = self.xhash_table(table)?;
        // SAFETY: `h` is a hash table.
        let removed = unsafe { (*h).remove_where(|k, _| k == key) };
        Ok(removed > 0)
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-tables.
    pub fn hash_count(&self, table: LispObject) -> Result<usize> {
        let h = self.xhash_table(table)?;
        // SAFETY: `h` is a hash table.
        Ok(unsafe { (*h).count() })
    }

    /// The weakness of a table, `None` for an ordinary one.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-tables.
    pub fn hash_table_weakness(&self, table: LispObject) -> Result<Option<Weakness>> {
        let h = self.xhash_table(table)?;
        // SAFETY: `h` is a hash table.
        Ok(unsafe { (*h).weakness() })
    }

    /// Every `(key, value)` entry, in no particular order.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-tables.
    pub fn hash_entries(&self, table: LispObject) -> Result<Vec<(LispObject, LispObject)>> {
        let h = self.xhash_table(table)?;
        let mut out = Vec::new();
        // SAFETY: `h` is a hash table.
        unsafe { (*h).for_each_entry(|k, v| out.push((k, v))) };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::T;
    use crate::HeapConfig;

    fn heap() -> Heap {
        Heap::new(HeapConfig::new().scan_stack(false))
    }

    fn n(i: i64) -> LispObject {
        LispObject::fixnum(i).unwrap()
    }

    #[test]
    fn put_get_remove() {
        let mut heap = heap();
        let table = heap.make_hash_table(None, 4).unwrap();
        heap.hash_put(table, n(1), T).unwrap();
        heap.hash_put(table, n(2), NIL).unwrap();
        heap.hash_put(table, n(1), n(10)).unwrap();
        assert_eq!(heap.hash_count(table), Ok(2));
        assert_eq!(heap.hash_get(table, n(1)), Ok(Some(n(10))));
        assert_eq!(heap.hash_get(table, n(3)), Ok(None));
        assert_eq!(heap.hash_remove(table, n(1)), Ok(true));
        assert_eq!(heap.hash_remove(table, n(1)), Ok(false));
        assert_eq!(heap.hash_count(table), Ok(1));
    }

    #[test]
    fn tables_grow() {
        let mut heap = heap();
        let table = heap.make_hash_table(None, 2).unwrap();
        for i in 0..100 {
            heap.hash_put(table, n(i), n(i * i)).unwrap();
        }
        assert_eq!(heap.hash_count(table), Ok(100));
        for i in 0..100 {
            assert_eq!(heap.hash_get(table, n(i)), Ok(Some(n(i * i))));
        }
        assert_eq!(heap.hash_entries(table).unwrap().len(), 100);
    }

    #[test]
    fn freed_entries_are_reused() {
        let mut heap = heap();
        let table = heap.make_hash_table(None, 2).unwrap();
        heap.hash_put(table, n(1), T).unwrap();
        heap.hash_put(table, n(2), T).unwrap();
        heap.hash_remove(table, n(1)).unwrap();
        heap.hash_put(table, n(3), T).unwrap();
        let h = heap.xhash_table(table).unwrap();
        assert_eq!(unsafe { (*h).size() }, 2);
    }

    #[test]
    fn table_sizes_are_bounded() {
        assert_eq!(checked_table_size(DEFAULT_HASH_SIZE), Ok(DEFAULT_HASH_SIZE));
        assert_eq!(checked_table_size(HASH_TABLE_SIZE_MAX), Ok(HASH_TABLE_SIZE_MAX));
        assert_eq!(
            checked_table_size(HASH_TABLE_SIZE_MAX + 1),
            Err(Error::VectorTooLarge {
                requested: 2 * (HASH_TABLE_SIZE_MAX + 1)
            })
        );
        assert!(checked_table_size(usize::MAX).is_err());
    }

    #[test]
    fn weakness_keeps() {
        assert!(Weakness::Key.keeps(true, false));
        assert!(!Weakness::Value.keeps(true, false));
        assert!(Weakness::KeyOrValue.keeps(false, true));
        assert!(!Weakness::KeyAndValue.keeps(false, true));
    }

    #[test]
    fn weak_tables_are_chained() {
        let mut heap = heap();
        let weak = heap.make_hash_table(Some(Weakness::Key), 8).unwrap();
        let plain = heap.make_hash_table(None, 8).unwrap();
        assert_eq!(heap.hash_table_weakness(weak), Ok(Some(Weakness::Key)));
        assert_eq!(heap.hash_table_weakness(plain), Ok(None));
        assert_eq!(heap.weak_tables, heap.xhash_table(weak).unwrap());
        assert!(heap.xhash_table(n(1)).is_err());
    }
}
