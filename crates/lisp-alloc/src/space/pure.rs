//! Pure space: a read-only arena for objects that live as long as the heap.
//!
//! One anonymous mapping holds Lisp cells growing up from the bottom and
//! string bytes growing down from the top. Pure objects are never marked,
//! never swept and never registered with the address classifier; every
//! address inside the mapping is treated as live.
//!
//! When the arena is full, objects are made on the ordinary heap instead and
//! pinned as permanent roots.

use std::mem::{align_of, size_of};
use std::ptr;

use sys_alloc::{Mmap, MmapOptions};

use super::block::Slot;
use super::float::LispFloat;
use super::pair::Cons;
use super::string::{count_chars, LispString, STRING_BYTES_BOUND};
use super::vector::{contents, PvecType, VectorHeader, HEADER_SIZE};
use crate::config::WORD_SIZE;
use crate::error::{wrong_type, Error, Result};
use crate::heap::Heap;
use crate::object::{LispObject, LispType, NIL};

pub(crate) struct PureSpace {
    region: Option<Mmap>,
    /// Bytes of Lisp cells at the bottom.
    lisp_used: usize,
    /// Bytes of string data at the top.
    bytes_used: usize,
    /// Bytes requested after the arena filled up.
    overflow: usize,
}

impl PureSpace {
    pub(crate) fn new(size: usize) -> Self {
        let region = if size == 0 {
            None
        } else {
            match MmapOptions::new().len(size).map_anon() {
                Ok(region) => Some(region),
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(size, error = %_err, "pure space unavailable");
                    None
                }
            }
        };
        Self {
            region,
            lisp_used: 0,
            bytes_used: 0,
            overflow: 0,
        }
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.region.as_ref().is_some_and(|r| r.contains(addr))
    }

    fn room(&self) -> usize {
        self.region
            .as_ref()
            .map_or(0, |r| r.len() - self.lisp_used - self.bytes_used)
    }

    fn alloc_lisp(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        let region = self.region.as_ref()?;
        let base = region.ptr() as usize;
        let start = (base + self.lisp_used).next_multiple_of(align);
        let used = start + size - base;
        if used + self.bytes_used > region.len() {
            self.note_overflow(size);
            return None;
        }
        self.lisp_used = used;
        Some(start as *mut u8)
    }

    fn alloc_bytes(&mut self, nbytes: usize) -> Option<*mut u8> {
        let region = self.region.as_ref()?;
        if nbytes > self.room() {
            self.note_overflow(nbytes);
            return None;
        }
        self.bytes_used += nbytes;
        Some((region.ptr() as usize + region.len() - self.bytes_used) as *mut u8)
    }

    fn note_overflow(&mut self, size: usize) {
        if self.overflow == 0 {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                size = self.region.as_ref().map_or(0, Mmap::len),
                "pure space overflow; further pure objects go to the heap"
            );
        }
        self.overflow += size;
    }

    /// Existing pure string data equal to `bytes` and followed by a NUL.
    /// The tail of a longer string counts.
    fn find_string_data(&self, bytes: &[u8]) -> Option<*mut u8> {
        let region = self.region.as_ref()?;
        let start = region.ptr() as usize + region.len() - self.bytes_used;
        // SAFETY: the top `bytes_used` bytes of the mapping are string data.
        let haystack = unsafe { std::slice::from_raw_parts(start as *const u8, self.bytes_used) };
        horspool(haystack, bytes).map(|offset| (start + offset) as *mut u8)
    }

    pub(crate) fn lisp_used(&self) -> usize {
        self.lisp_used
    }

    pub(crate) fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub(crate) fn overflow(&self) -> usize {
        self.overflow
    }
}

/// Offset of `needle` followed by a NUL byte in `haystack`.
fn horspool(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let m = needle.len() + 1;
    if haystack.len() < m {
        return None;
    }
    let at = |i: usize| if i < needle.len() { needle[i] } else { 0 };
    let mut skip = [m; 256];
    for i in 0..m - 1 {
        skip[usize::from(at(i))] = m - 1 - i;
    }
    let mut pos = 0;
    while pos + m <= haystack.len() {
        if (0..m).rev().all(|i| haystack[pos + i] == at(i)) {
            return Some(pos);
        }
        pos += skip[usize::from(haystack[pos + m - 1])];
    }
    None
}

impl Heap {
    /// Make the obarray and `intern` copy symbol names into pure space.
    pub fn set_purify_flag(&mut self, purify: bool) {
        self.purify = purify;
    }

    /// True if `obj` lives in pure space.
    #[must_use]
    pub fn pure_p(&self, obj: LispObject) -> bool {
        !obj.is_immediate() && self.pure.contains(obj.address())
    }

    fn pure_cell<T>(&mut self, value: T) -> Option<*mut Slot<T>> {
        let p = self
            .pure
            .alloc_lisp(size_of::<Slot<T>>(), align_of::<Slot<T>>().max(WORD_SIZE))?
            .cast::<Slot<T>>();
        // SAFETY: fresh, aligned room in the mapping.
        unsafe { p.write(Slot::Live(value)) };
        Some(p)
    }

    /// Keep a heap object made in place of a pure one alive for good.
    fn pin(&mut self, obj: LispObject) -> LispObject {
        self.roots.pinned.push(obj);
        obj
    }

    /// A read-only string. Equal data already in pure space is shared.
    ///
    /// # Errors
    ///
    /// [`Error::StringTooLong`] past [`STRING_BYTES_BOUND`].
    pub fn make_pure_string(&mut self, bytes: &[u8], multibyte: bool) -> Result<LispObject> {
        if bytes.len() > STRING_BYTES_BOUND {
            return Err(Error::StringTooLong {
                requested: bytes.len(),
            });
        }
        let nchars = if multibyte {
            count_chars(bytes)
        } else {
            bytes.len()
        };
        let data = match self.pure.find_string_data(bytes) {
            Some(data) => Some(data),
            None => self.pure.alloc_bytes(bytes.len() + 1).inspect(|&data| {
                // SAFETY: `data` has room for the bytes and a NUL.
                unsafe {
                    ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
                    *data.add(bytes.len()) = 0;
                }
            }),
        };
        let header = data.and_then(|data| {
            self.pure_cell(LispString {
                size: nchars,
                size_byte: if multibyte {
                    bytes.len() as isize
                } else {
                    -1
                },
                data,
                intervals: NIL,
            })
        });
        match header {
            Some(slot) => Ok(LispObject::from_address(slot as usize, LispType::String)),
            None => {
                let string = self.alloc_string_unchecked(nchars, bytes.len(), multibyte);
                let s = self.xstring(string)?;
                // SAFETY: fresh data of exactly `bytes.len()` bytes.
                unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), s.data, bytes.len()) };
                Ok(self.pin(string))
            }
        }
    }

    /// A read-only pair. Both fields are copied to pure space first.
    ///
    /// # Errors
    ///
    /// As for [`Heap::purecopy`].
    pub fn pure_cons(&mut self, car: LispObject, cdr: LispObject) -> Result<LispObject> {
        let car = self.purecopy(car)?;
        let cdr = self.purecopy(cdr)?;
        Ok(self.pure_cons_raw(car, cdr))
    }

    fn pure_cons_raw(&mut self, car: LispObject, cdr: LispObject) -> LispObject {
        match self.pure_cell(Cons { car, cdr }) {
            Some(slot) => LispObject::from_address(slot as usize, LispType::Cons),
            None => {
                let cell = self.allocate_pair(car, cdr);
                self.pin(cell)
            }
        }
    }

    /// A read-only float.
    pub fn make_pure_float(&mut self, value: f64) -> LispObject {
        match self.pure_cell(LispFloat(value)) {
            Some(slot) => LispObject::from_address(slot as usize, LispType::Float),
            None => {
                let float = self.allocate_float(value);
                self.pin(float)
            }
        }
    }

    /// Room for a pure vector-like of `words` words after the header.
    fn pure_vectorlike(&mut self, header: VectorHeader, words: usize) -> Option<*mut VectorHeader> {
        let v = self
            .pure
            .alloc_lisp(HEADER_SIZE + words * WORD_SIZE, WORD_SIZE)?
            .cast::<VectorHeader>();
        // SAFETY: fresh room for the header and `words` slots.
        unsafe {
            v.write(header);
            for i in 0..words {
                contents(v).add(i).write(NIL);
            }
        }
        Some(v)
    }

    pub(crate) fn make_pure_zero_vector(&mut self) -> LispObject {
        match self.pure_vectorlike(VectorHeader::plain(0), 0) {
            Some(v) => LispObject::from_address(v as usize, LispType::Vectorlike),
            None => {
                let v = self.alloc_vectorlike(0);
                // SAFETY: room for the header.
                unsafe { v.write(VectorHeader::plain(0)) };
                self.pin(LispObject::from_address(v as usize, LispType::Vectorlike))
            }
        }
    }

    /// A read-only vector holding pure copies of `items`.
    ///
    /// # Errors
    ///
    /// As for [`Heap::purecopy`].
    pub fn make_pure_vector(&mut self, items: &[LispObject]) -> Result<LispObject> {
        let items = items
            .iter()
            .map(|&item| self.purecopy(item))
            .collect::<Result<Vec<_>>>()?;
        self.pure_vector_of(VectorHeader::plain(items.len()), &items)
    }

    fn pure_vector_of(&mut self, header: VectorHeader, items: &[LispObject]) -> Result<LispObject> {
        if items.is_empty() && header.pvec_type().is_none() {
            return Ok(self.zero_vector);
        }
        let v = match self.pure_vectorlike(header, items.len()) {
            Some(v) => v,
            None => {
                let v = self.alloc_vectorlike(items.len());
                // SAFETY: room for the header and `items.len()` slots.
                unsafe { v.write(header) };
                self.pin(LispObject::from_address(v as usize, LispType::Vectorlike));
                v
            }
        };
        // SAFETY: the vector has exactly `items.len()` slots.
        unsafe { ptr::copy_nonoverlapping(items.as_ptr(), contents(v), items.len()) };
        Ok(LispObject::from_address(v as usize, LispType::Vectorlike))
    }

    /// A pure copy of `obj`, deep for pairs and vectors. Symbols are not
    /// copied but pinned, since pure objects refer to them without
    /// keeping them alive.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for markers, overlays, buffers, hash tables,
    /// char tables and bool vectors.
    pub fn purecopy(&mut self, obj: LispObject) -> Result<LispObject> {
        if obj.is_immediate() || self.pure.contains(obj.address()) {
            return Ok(obj);
        }
        match obj.lisp_type() {
            LispType::Symbol => {
                self.pin_symbol(obj);
                Ok(obj)
            }
            LispType::String => {
                let multibyte = self.string_multibyte_p(obj)?;
                let bytes = self.string_bytes(obj)?.to_vec();
                self.make_pure_string(&bytes, multibyte)
            }
            LispType::Float => {
                let value = self.float_value(obj)?;
                Ok(self.make_pure_float(value))
            }
            LispType::Cons => {
                let mut cars = Vec::new();
                let mut tail = obj;
                while tail.is_cons() && !self.pure.contains(tail.address()) {
                    let cell = *self.xcons(tail)?;
                    cars.push(self.purecopy(cell.car)?);
                    tail = cell.cdr;
                }
                let mut list = self.purecopy(tail)?;
                for car in cars.into_iter().rev() {
                    list = self.pure_cons_raw(car, list);
                }
                Ok(list)
            }
            LispType::Vectorlike => {
                let kind = self.pvec_type(obj);
                if !matches!(kind, None | Some(PvecType::Compiled | PvecType::Record)) {
                    return Err(wrong_type("pure-copyable object", obj.lisp_type()));
                }
                let len = self.vector_len(obj)?;
                let mut items = Vec::with_capacity(len);
                for i in 0..len {
                    let item = self.aref(obj, i)?;
                    items.push(self.purecopy(item)?);
                }
                let header = match kind {
                    Some(kind) => VectorHeader::pseudo(kind, len, 0),
                    None => VectorHeader::plain(len),
                };
                self.pure_vector_of(header, &items)
            }
            LispType::Misc | LispType::Fixnum => {
                Err(wrong_type("pure-copyable object", obj.lisp_type()))
            }
        }
    }

    /// Bytes of pure space used by Lisp cells and by string data, and bytes
    /// that did not fit.
    #[must_use]
    pub fn pure_space_usage(&self) -> (usize, usize, usize) {
        (self.pure.lisp_used(), self.pure.bytes_used(), self.pure.overflow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapConfig;

    #[test]
    fn horspool_finds_terminated_matches() {
        let hay = b"foobar\0baz\0";
        assert_eq!(horspool(hay, b"bar"), Some(3));
        assert_eq!(horspool(hay, b"baz"), Some(7));
        assert_eq!(horspool(hay, b"foo"), None);
        assert_eq!(horspool(hay, b""), Some(6));
        assert_eq!(horspool(b"", b"x"), None);
    }

    #[test]
    fn pure_strings_share_data() {
        let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
        let a = heap.make_pure_string(b"set-buffer", false).unwrap();
        let (_, bytes_before, _) = heap.pure_space_usage();
        let b = heap.make_pure_string(b"buffer", false).unwrap();
        let (_, bytes_after, _) = heap.pure_space_usage();
        assert_eq!(bytes_before, bytes_after);
        assert!(heap.pure_p(a) && heap.pure_p(b));
        assert_eq!(heap.string_bytes(b).unwrap(), b"buffer");
        assert_eq!(heap.set_string_byte(a, 0, b'x'), Err(Error::ImmutableObject));
    }

    #[test]
    fn purecopy_is_deep() {
        let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
        let s = heap.make_string("x").unwrap();
        let f = heap.allocate_float(1.5);
        let v = heap.allocate_vector(2, s).unwrap();
        let list = heap.list(&[s, f, v]);
        let copy = heap.purecopy(list).unwrap();
        assert!(heap.pure_p(copy));
        let items = heap.list_to_vec(copy).unwrap();
        assert!(items.iter().all(|&item| heap.pure_p(item)));
        assert_eq!(heap.float_value(items[1]), Ok(1.5));
        assert!(heap.pure_p(heap.aref(items[2], 1).unwrap()));
        assert_eq!(heap.setcar(copy, NIL), Err(Error::ImmutableObject));
    }

    #[test]
    fn markers_cannot_be_purified() {
        let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
        let m = heap.allocate_marker();
        assert!(matches!(heap.purecopy(m), Err(Error::WrongType { .. })));
    }

    #[test]
    fn overflow_falls_back_to_pinned_heap_objects() {
        let mut heap = Heap::new(HeapConfig::new().scan_stack(false).pure_size(0));
        let s = heap.make_pure_string(b"abc", false).unwrap();
        assert!(!heap.pure_p(s));
        heap.collect_garbage();
        assert_eq!(heap.string_bytes(s).unwrap(), b"abc");
    }
}
