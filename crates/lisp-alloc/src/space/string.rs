//! Strings.
//!
//! A string is a fixed-size header cell plus a data record holding the
//! bytes. Records of small strings are packed into 8 KiB sblocks that are
//! compacted after every collection; a string over [`LARGE_STRING_BYTES`]
//! gets an sblock of its own.
//!
//! A data record is laid out as
//!
//! ```text
//! +-----------------+--------+---------------+-----+---------+
//! | back-pointer    | nbytes | bytes ...     | NUL | cookie? |
//! +-----------------+--------+---------------+-----+---------+
//! ```
//!
//! A null back-pointer marks a dead record. Records die when their header
//! is swept or when the string gets new contents of another length.

use std::alloc::Layout;
use std::mem::size_of;
use std::ptr;

use super::block::{cell_mut, cell_ref, CellKind, CellSpace, Slot, SweepCounts};
use crate::error::{wrong_type, Error, Result};
use crate::heap::Heap;
use crate::input::BlockInput;
use crate::mem_tree::MemType;
use crate::memory::{byte_layout, SystemMemory};
use crate::object::{LispObject, LispType, MOST_POSITIVE_FIXNUM, NIL};

/// Size of an sblock holding small strings.
pub const SBLOCK_SIZE: usize = 8188;

/// Strings with more bytes than this get their own sblock.
pub const LARGE_STRING_BYTES: usize = 1024;

const SDATA_DATA_OFFSET: usize = size_of::<SData>();
const SBLOCK_DATA_OFFSET: usize = size_of::<SBlock>();

/// Room for the overrun cookie when checking is enabled.
const GC_STRING_EXTRA: usize = if cfg!(feature = "checking") { 4 } else { 0 };

const OVERRUN_COOKIE: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// Largest byte count a string may have.
pub const STRING_BYTES_BOUND: usize = {
    let by_size = isize::MAX as usize - GC_STRING_EXTRA - SBLOCK_DATA_OFFSET - SDATA_DATA_OFFSET;
    let by_fixnum = MOST_POSITIVE_FIXNUM as usize;
    (if by_size < by_fixnum { by_size } else { by_fixnum }) - 1
};

const SMALL_SBLOCK_LAYOUT: Layout = match Layout::from_size_align(SBLOCK_SIZE, 8) {
    Ok(layout) => layout,
    Err(_) => panic!("bad sblock layout"),
};

/// Bytes taken by the data record of an `nbytes` string.
pub(crate) const fn sdata_size(nbytes: usize) -> usize {
    (SDATA_DATA_OFFSET + nbytes + 1 + GC_STRING_EXTRA + 7) & !7
}

fn large_sblock_layout(nbytes: usize) -> Layout {
    byte_layout(SBLOCK_DATA_OFFSET + sdata_size(nbytes), 8)
}

#[derive(Debug)]
pub(crate) struct LispString {
    /// Characters.
    pub(crate) size: usize,
    /// Bytes, or -1 for a unibyte string.
    pub(crate) size_byte: isize,
    pub(crate) data: *mut u8,
    /// Text properties as a plist.
    pub(crate) intervals: LispObject,
}

impl LispString {
    pub(crate) const fn nbytes(&self) -> usize {
        if self.size_byte < 0 {
            self.size
        } else {
            self.size_byte as usize
        }
    }

    pub(crate) const fn is_multibyte(&self) -> bool {
        self.size_byte >= 0
    }

    fn record(&self) -> *mut SData {
        (self.data as usize - SDATA_DATA_OFFSET) as *mut SData
    }
}

impl CellKind for LispString {
    const MEM_TYPE: MemType = MemType::String;
    const NAME: &'static str = "string";
}

pub(crate) type StringHeaderSpace = CellSpace<LispString>;

#[repr(C)]
struct SData {
    string: *mut Slot<LispString>,
    nbytes: usize,
}

#[repr(C)]
struct SBlock {
    next: *mut SBlock,
    next_free: *mut u8,
}

fn sblock_data(block: *mut SBlock) -> usize {
    block as usize + SBLOCK_DATA_OFFSET
}

fn record_bytes(record: *mut SData) -> *mut u8 {
    (record as usize + SDATA_DATA_OFFSET) as *mut u8
}

/// Characters in an internally encoded multibyte text.
pub(crate) fn count_chars(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b & 0xc0 != 0x80).count()
}

/// Panic if the cookie after a record was overwritten.
unsafe fn check_cookie(record: *mut SData) {
    if GC_STRING_EXTRA == 0 {
        return;
    }
    // SAFETY: the caller passes a record written by `StringData::allocate`.
    unsafe {
        let nbytes = (*record).nbytes;
        let cookie = record_bytes(record).add(nbytes + 1);
        let found = std::slice::from_raw_parts(cookie, OVERRUN_COOKIE.len());
        assert!(
            found == OVERRUN_COOKIE,
            "string overrun detected in record at {:#x}",
            record as usize
        );
    }
}

/// The sblocks holding string bytes.
pub(crate) struct StringData {
    /// Small sblocks, oldest first.
    oldest: *mut SBlock,
    current: *mut SBlock,
    large: *mut SBlock,
    small_count: usize,
    large_count: usize,
}

impl StringData {
    const fn new() -> Self {
        Self {
            oldest: ptr::null_mut(),
            current: ptr::null_mut(),
            large: ptr::null_mut(),
            small_count: 0,
            large_count: 0,
        }
    }

    /// A fresh record of `nbytes` with a null back-pointer, NUL-terminated.
    fn allocate(&mut self, nbytes: usize, mem: &mut SystemMemory) -> *mut SData {
        let _input = BlockInput::new();
        let needed = sdata_size(nbytes);
        let record;
        // SAFETY: sblocks are ours; every write stays inside the block,
        // which has room for `needed` bytes at `next_free`.
        unsafe {
            if nbytes > LARGE_STRING_BYTES {
                let block = mem.xmalloc(large_sblock_layout(nbytes)).cast::<SBlock>().as_ptr();
                record = sblock_data(block) as *mut SData;
                block.write(SBlock {
                    next: self.large,
                    next_free: (record as usize + needed) as *mut u8,
                });
                self.large = block;
                self.large_count += 1;
                #[cfg(feature = "tracing")]
                tracing::debug!(nbytes, "new large sblock");
            } else {
                let mut block = self.current;
                if block.is_null()
                    || block as usize + SBLOCK_SIZE - ((*block).next_free as usize) < needed
                {
                    let fresh = mem.xmalloc(SMALL_SBLOCK_LAYOUT).cast::<SBlock>().as_ptr();
                    fresh.write(SBlock {
                        next: ptr::null_mut(),
                        next_free: sblock_data(fresh) as *mut u8,
                    });
                    if block.is_null() {
                        self.oldest = fresh;
                    } else {
                        (*block).next = fresh;
                    }
                    self.current = fresh;
                    self.small_count += 1;
                    block = fresh;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(sblocks = self.small_count, "new sblock");
                }
                record = (*block).next_free.cast::<SData>();
                (*block).next_free = (*block).next_free.add(needed);
            }

            record.write(SData {
                string: ptr::null_mut(),
                nbytes,
            });
            let bytes = record_bytes(record);
            ptr::write_bytes(bytes, 0, nbytes + 1);
            if GC_STRING_EXTRA > 0 {
                ptr::copy_nonoverlapping(
                    OVERRUN_COOKIE.as_ptr(),
                    bytes.add(nbytes + 1),
                    OVERRUN_COOKIE.len(),
                );
            }
        }
        record
    }

    /// Give back large sblocks whose string died.
    fn free_large(&mut self, mem: &mut SystemMemory) {
        let mut link: *mut *mut SBlock = &raw mut self.large;
        // SAFETY: `link` points at the field holding `block`; blocks are ours.
        unsafe {
            let mut block = *link;
            while !block.is_null() {
                let next = (*block).next;
                let record = sblock_data(block) as *mut SData;
                if (*record).string.is_null() {
                    let layout = large_sblock_layout((*record).nbytes);
                    *link = next;
                    mem.xfree(ptr::NonNull::new_unchecked(block.cast()), layout);
                    self.large_count -= 1;
                } else {
                    link = &raw mut (*block).next;
                }
                block = next;
            }
        }
    }

    /// Slide live records towards the oldest sblock and free the sblocks
    /// left empty.
    fn compact(&mut self, mem: &mut SystemMemory) {
        if self.oldest.is_null() {
            return;
        }
        let _input = BlockInput::new();
        // SAFETY: the walk visits records of our sblocks in address order;
        // `to` never passes `from`, so `ptr::copy` handles any overlap, and
        // back-pointers of live records name live headers.
        unsafe {
            let mut tb = self.oldest;
            let mut tb_end = tb as usize + SBLOCK_SIZE;
            let mut to = sblock_data(tb);

            let mut block = self.oldest;
            while !block.is_null() {
                let end = (*block).next_free as usize;
                let mut from = sblock_data(block);
                while from < end {
                    let record = from as *mut SData;
                    check_cookie(record);
                    let size = sdata_size((*record).nbytes);
                    if !(*record).string.is_null() {
                        if to + size > tb_end {
                            (*tb).next_free = to as *mut u8;
                            tb = (*tb).next;
                            tb_end = tb as usize + SBLOCK_SIZE;
                            to = sblock_data(tb);
                        }
                        if from != to {
                            ptr::copy(from as *const u8, to as *mut u8, size);
                            let moved = to as *mut SData;
                            cell_mut::<LispString>((*moved).string as usize).data =
                                record_bytes(moved);
                        }
                        to += size;
                    }
                    from += size;
                }
                block = (*block).next;
            }

            let mut dead = (*tb).next;
            while !dead.is_null() {
                let next = (*dead).next;
                mem.xfree(ptr::NonNull::new_unchecked(dead.cast()), SMALL_SBLOCK_LAYOUT);
                self.small_count -= 1;
                dead = next;
            }
            (*tb).next_free = to as *mut u8;
            (*tb).next = ptr::null_mut();
            self.current = tb;
        }
    }

    /// Unused room in small sblocks: dead records plus the space after the
    /// last record.
    pub(crate) fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut block = self.oldest;
        // SAFETY: walks our sblocks and their records.
        unsafe {
            while !block.is_null() {
                let end = (*block).next_free as usize;
                total += block as usize + SBLOCK_SIZE - end;
                let mut from = sblock_data(block);
                while from < end {
                    let record = from as *mut SData;
                    let size = sdata_size((*record).nbytes);
                    if (*record).string.is_null() {
                        total += size;
                    }
                    from += size;
                }
                block = (*block).next;
            }
        }
        total
    }

    /// Panic unless every live small record agrees with its header.
    fn check_string_bytes(&self) {
        let mut block = self.oldest;
        // SAFETY: walks our sblocks; live back-pointers name live headers.
        unsafe {
            while !block.is_null() {
                let end = (*block).next_free as usize;
                let mut from = sblock_data(block);
                while from < end {
                    let record = from as *mut SData;
                    check_cookie(record);
                    if !(*record).string.is_null() {
                        let header = cell_ref::<LispString>((*record).string as usize);
                        assert_eq!(header.nbytes(), (*record).nbytes, "string byte count mismatch");
                        assert_eq!(header.data, record_bytes(record), "string data moved under its header");
                    }
                    from += sdata_size((*record).nbytes);
                }
                block = (*block).next;
            }
        }
    }

    fn release_all(&mut self, mem: &mut SystemMemory) {
        // SAFETY: every sblock is ours and freed once.
        unsafe {
            let mut block = self.oldest;
            while !block.is_null() {
                let next = (*block).next;
                mem.xfree(ptr::NonNull::new_unchecked(block.cast()), SMALL_SBLOCK_LAYOUT);
                block = next;
            }
            let mut block = self.large;
            while !block.is_null() {
                let next = (*block).next;
                let record = sblock_data(block) as *mut SData;
                let layout = large_sblock_layout((*record).nbytes);
                mem.xfree(ptr::NonNull::new_unchecked(block.cast()), layout);
                block = next;
            }
        }
        *self = Self::new();
    }

    pub(crate) const fn small_sblocks(&self) -> usize {
        self.small_count
    }

    pub(crate) const fn large_sblocks(&self) -> usize {
        self.large_count
    }
}

/// String headers plus their data.
pub(crate) struct StringSpace {
    pub(crate) headers: StringHeaderSpace,
    pub(crate) data: StringData,
    /// Bytes of live heap strings.
    pub(crate) bytes_in_use: usize,
}

impl StringSpace {
    pub(crate) const fn new() -> Self {
        Self {
            headers: StringHeaderSpace::new(),
            data: StringData::new(),
            bytes_in_use: 0,
        }
    }

    /// Free unmarked headers, drop their records, then compact.
    pub(crate) fn sweep(&mut self, mem: &mut SystemMemory, retain: usize) -> SweepCounts {
        let Self {
            headers,
            data,
            bytes_in_use,
        } = self;
        let counts = headers.sweep(mem, retain, |_, string| {
            // SAFETY: heap strings always own a record.
            unsafe { (*string.record()).string = ptr::null_mut() };
            *bytes_in_use -= string.nbytes();
        });
        data.free_large(mem);
        data.compact(mem);
        if cfg!(feature = "checking") {
            data.check_string_bytes();
        }
        counts
    }

    pub(crate) fn release_all(&mut self, mem: &mut SystemMemory) {
        self.headers.release_all(mem);
        self.data.release_all(mem);
        self.bytes_in_use = 0;
    }
}

impl Heap {
    fn alloc_string_object(
        &mut self,
        nchars: usize,
        nbytes: usize,
        multibyte: bool,
    ) -> Result<LispObject> {
        if nbytes > STRING_BYTES_BOUND {
            return Err(Error::StringTooLong { requested: nbytes });
        }
        if nbytes == 0 {
            return Ok(if multibyte {
                self.empty_multibyte
            } else {
                self.empty_unibyte
            });
        }
        Ok(self.alloc_string_unchecked(nchars, nbytes, multibyte))
    }

    /// A heap string of `nbytes` zero bytes, including the empty case.
    pub(crate) fn alloc_string_unchecked(
        &mut self,
        nchars: usize,
        nbytes: usize,
        multibyte: bool,
    ) -> LispObject {
        // Data first: if the header allocation fails, the record is simply dead.
        let record = self.strings.data.allocate(nbytes, &mut self.mem);
        let header = LispString {
            size: nchars,
            size_byte: if multibyte { nbytes as isize } else { -1 },
            data: record_bytes(record),
            intervals: NIL,
        };
        let slot = self.strings.headers.allocate(header, &mut self.mem);
        // SAFETY: `record` was just allocated for this string.
        unsafe { (*record).string = slot };
        self.strings.bytes_in_use += nbytes;
        self.consing_since_gc += StringHeaderSpace::SLOT_SIZE + sdata_size(nbytes);
        LispObject::from_address(slot as usize, LispType::String)
    }

    /// A string holding a copy of `bytes`.
    ///
    /// A multibyte string's character count is the number of bytes that do
    /// not continue a multibyte sequence. Empty strings are shared.
    ///
    /// # Errors
    ///
    /// [`Error::StringTooLong`] if `bytes` is longer than
    /// [`STRING_BYTES_BOUND`].
    pub fn allocate_string(&mut self, bytes: &[u8], multibyte: bool) -> Result<LispObject> {
        let nchars = if multibyte {
            count_chars(bytes)
        } else {
            bytes.len()
        };
        let string = self.alloc_string_object(nchars, bytes.len(), multibyte)?;
        if !bytes.is_empty() {
            // SAFETY: the new string has exactly `bytes.len()` bytes.
            unsafe {
                let header = cell_ref::<LispString>(string.address());
                ptr::copy_nonoverlapping(bytes.as_ptr(), header.data, bytes.len());
            }
        }
        Ok(string)
    }

    /// A string with the text of `text`, multibyte unless it is ASCII.
    ///
    /// # Errors
    ///
    /// As for [`Heap::allocate_string`].
    pub fn make_string(&mut self, text: &str) -> Result<LispObject> {
        self.allocate_string(text.as_bytes(), !text.is_ascii())
    }

    /// A unibyte string of `nbytes` zero bytes.
    ///
    /// # Errors
    ///
    /// [`Error::StringTooLong`] past [`STRING_BYTES_BOUND`].
    pub fn make_uninit_string(&mut self, nbytes: usize) -> Result<LispObject> {
        self.alloc_string_object(nbytes, nbytes, false)
    }

    /// A multibyte string of `nchars` characters in `nbytes` zero bytes.
    ///
    /// # Errors
    ///
    /// [`Error::StringTooLong`] past [`STRING_BYTES_BOUND`];
    /// [`Error::OutOfRange`] if `nchars` exceeds `nbytes`.
    pub fn make_uninit_multibyte_string(
        &mut self,
        nchars: usize,
        nbytes: usize,
    ) -> Result<LispObject> {
        if nchars > nbytes {
            return Err(Error::OutOfRange {
                index: nchars,
                len: nbytes,
            });
        }
        self.alloc_string_object(nchars, nbytes, true)
    }

    pub(crate) fn xstring(&self, obj: LispObject) -> Result<&LispString> {
        if !obj.is_string() {
            return Err(wrong_type("string", obj.lisp_type()));
        }
        // SAFETY: a string-tagged reference denotes a live or pure header.
        Ok(unsafe { cell_ref::<LispString>(obj.address()) })
    }

    fn xstring_mut(&mut self, obj: LispObject) -> Result<&mut LispString> {
        if !obj.is_string() {
            return Err(wrong_type("string", obj.lisp_type()));
        }
        self.check_impure(obj)?;
        if obj == self.empty_unibyte || obj == self.empty_multibyte {
            return Err(Error::ImmutableObject);
        }
        // SAFETY: as in `xstring`, made exclusive by `&mut self`.
        Ok(unsafe { cell_mut::<LispString>(obj.address()) })
    }

    /// The bytes of a string, without the trailing NUL.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for a non-string.
    pub fn string_bytes(&self, string: LispObject) -> Result<&[u8]> {
        let header = self.xstring(string)?;
        // SAFETY: `data` holds `nbytes` initialized bytes that stay put
        // until the next collection, which needs `&mut self`.
        Ok(unsafe { std::slice::from_raw_parts(header.data, header.nbytes()) })
    }

    /// Number of characters in a string.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for a non-string.
    pub fn string_chars(&self, string: LispObject) -> Result<usize> {
        Ok(self.xstring(string)?.size)
    }

    /// Whether a string is multibyte.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for a non-string.
    pub fn string_multibyte_p(&self, string: LispObject) -> Result<bool> {
        Ok(self.xstring(string)?.is_multibyte())
    }

    /// Overwrite one byte in place.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] past the end, [`Error::ImmutableObject`] for
    /// pure or shared empty strings.
    pub fn set_string_byte(&mut self, string: LispObject, index: usize, byte: u8) -> Result<()> {
        let header = self.xstring_mut(string)?;
        let len = header.nbytes();
        if index >= len {
            return Err(Error::OutOfRange { index, len });
        }
        // SAFETY: `index` is within the string's bytes.
        unsafe { *header.data.add(index) = byte };
        Ok(())
    }

    /// Replace the contents of a string, keeping its identity and
    /// multibyteness.
    ///
    /// Contents of another length move to a fresh record; the old one is
    /// left dead for the next compaction.
    ///
    /// # Errors
    ///
    /// As for [`Heap::set_string_byte`], plus [`Error::StringTooLong`].
    pub fn set_string_contents(&mut self, string: LispObject, bytes: &[u8]) -> Result<()> {
        if bytes.len() > STRING_BYTES_BOUND {
            return Err(Error::StringTooLong {
                requested: bytes.len(),
            });
        }
        let old_nbytes = self.xstring_mut(string)?.nbytes();
        if old_nbytes != bytes.len() {
            let record = self.strings.data.allocate(bytes.len(), &mut self.mem);
            let header = self.xstring_mut(string)?;
            // SAFETY: the old record belongs to this header; the new one was
            // just allocated.
            unsafe {
                (*header.record()).string = ptr::null_mut();
                (*record).string = string.address() as *mut Slot<LispString>;
            }
            header.data = record_bytes(record);
            if header.is_multibyte() {
                header.size_byte = bytes.len() as isize;
            }
            self.strings.bytes_in_use = self.strings.bytes_in_use - old_nbytes + bytes.len();
            self.consing_since_gc += sdata_size(bytes.len());
        }
        let header = self.xstring_mut(string)?;
        header.size = if header.is_multibyte() {
            count_chars(bytes)
        } else {
            bytes.len()
        };
        // SAFETY: the record has room for exactly `bytes.len()` bytes.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), header.data, bytes.len()) };
        Ok(())
    }

    /// The text-property list of a string.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for a non-string.
    pub fn string_properties(&self, string: LispObject) -> Result<LispObject> {
        Ok(self.xstring(string)?.intervals)
    }

    /// Replace the text-property list of a string.
    ///
    /// # Errors
    ///
    /// As for [`Heap::set_string_byte`].
    pub fn set_string_properties(&mut self, string: LispObject, plist: LispObject) -> Result<()> {
        self.xstring_mut(string)?.intervals = plist;
        Ok(())
    }
}
