//! Vectors and pseudovectors.
//!
//! Every vector-like object starts with a one-word [`VectorHeader`]. For a
//! plain vector it holds the slot count; for a pseudovector it packs the
//! kind, the number of traced slots and the number of opaque words after
//! them:
//!
//! ```text
//!  63   62          29..24     23..12        11..0
//! +----+--------+---------+-------------+------------+
//! |mark|pseudo=1| kind    | rest words  | traced     |
//! +----+--------+---------+-------------+------------+
//! ```
//!
//! Vectors of up to [`VBLOCK_BYTES_MAX`] bytes are carved out of 4 KiB
//! vector blocks, with one free list per size; bigger ones are allocated on
//! their own.

use std::alloc::Layout;
use std::mem::size_of;
use std::panic::panic_any;
use std::ptr::{self, NonNull};

use crate::config::WORD_SIZE;
use crate::error::{wrong_type, Error, MemoryExhausted, Result};
use crate::heap::Heap;
use crate::input::BlockInput;
use crate::mem_tree::{MemEntry, MemType};
use crate::memory::{byte_layout, SystemMemory};
use crate::object::{LispObject, LispType, MOST_POSITIVE_FIXNUM, NIL};

pub(crate) const ARRAY_MARK_FLAG: usize = 1 << 63;
pub(crate) const PSEUDOVECTOR_FLAG: usize = 1 << 62;

const PSEUDOVECTOR_SIZE_BITS: u32 = 12;
const PSEUDOVECTOR_REST_BITS: u32 = 12;
const PSEUDOVECTOR_AREA_BITS: u32 = PSEUDOVECTOR_SIZE_BITS + PSEUDOVECTOR_REST_BITS;

/// Largest traced-slot count a pseudovector header can hold.
pub const PSEUDOVECTOR_SIZE_MAX: usize = (1 << PSEUDOVECTOR_SIZE_BITS) - 1;
/// Largest opaque-word count a pseudovector header can hold.
pub const PSEUDOVECTOR_REST_MAX: usize = (1 << PSEUDOVECTOR_REST_BITS) - 1;

const PSEUDOVECTOR_REST_MASK: usize = PSEUDOVECTOR_REST_MAX << PSEUDOVECTOR_SIZE_BITS;
const PVEC_TYPE_MASK: usize = 0x3f << PSEUDOVECTOR_AREA_BITS;

pub(crate) const HEADER_SIZE: usize = size_of::<VectorHeader>();

/// Largest slot count of a plain vector.
pub const VECTOR_ELTS_MAX: usize = {
    let by_size = (isize::MAX as usize - HEADER_SIZE) / WORD_SIZE;
    let by_fixnum = MOST_POSITIVE_FIXNUM as usize;
    if by_size < by_fixnum {
        by_size
    } else {
        by_fixnum
    }
};

/// Kinds of pseudovector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PvecType {
    /// Free space inside a vector block.
    Free = 0,
    /// An asynchronous subprocess.
    Process,
    /// A frame.
    Frame,
    /// A window.
    Window,
    /// A packed bit vector.
    BoolVector,
    /// A buffer.
    Buffer,
    /// A hash table.
    HashTable,
    /// A terminal.
    Terminal,
    /// A saved window configuration.
    WindowConfiguration,
    /// Any other kind without a dedicated tag.
    Other,
    /// A byte-compiled function.
    Compiled,
    /// A character table.
    CharTable,
    /// A sub-table of a character table.
    SubCharTable,
    /// A record.
    Record,
}

const PVEC_TYPES: [PvecType; 14] = [
    PvecType::Free,
    PvecType::Process,
    PvecType::Frame,
    PvecType::Window,
    PvecType::BoolVector,
    PvecType::Buffer,
    PvecType::HashTable,
    PvecType::Terminal,
    PvecType::WindowConfiguration,
    PvecType::Other,
    PvecType::Compiled,
    PvecType::CharTable,
    PvecType::SubCharTable,
    PvecType::Record,
];

/// Index of the constants vector in a compiled function.
pub(crate) const COMPILED_CONSTANTS: usize = 2;

/// Fewest slots a compiled function has.
const COMPILED_MIN_SLOTS: usize = 4;

#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct VectorHeader {
    pub(crate) size: usize,
}

impl VectorHeader {
    pub(crate) const fn plain(len: usize) -> Self {
        Self { size: len }
    }

    pub(crate) const fn pseudo(kind: PvecType, traced: usize, rest: usize) -> Self {
        Self {
            size: PSEUDOVECTOR_FLAG
                | ((kind as usize) << PSEUDOVECTOR_AREA_BITS)
                | (rest << PSEUDOVECTOR_SIZE_BITS)
                | traced,
        }
    }

    const fn unmarked(&self) -> usize {
        self.size & !ARRAY_MARK_FLAG
    }

    pub(crate) const fn is_pseudo(&self) -> bool {
        self.size & PSEUDOVECTOR_FLAG != 0
    }

    /// The kind of a pseudovector, or `None` for a plain vector.
    pub(crate) const fn pvec_type(&self) -> Option<PvecType> {
        if !self.is_pseudo() {
            return None;
        }
        let index = (self.size & PVEC_TYPE_MASK) >> PSEUDOVECTOR_AREA_BITS;
        if index < PVEC_TYPES.len() {
            Some(PVEC_TYPES[index])
        } else {
            Some(PvecType::Other)
        }
    }

    pub(crate) const fn is_free(&self) -> bool {
        matches!(self.pvec_type(), Some(PvecType::Free))
    }

    /// Slots holding Lisp references.
    pub(crate) const fn traced(&self) -> usize {
        if self.is_pseudo() {
            self.size & PSEUDOVECTOR_SIZE_MAX
        } else {
            self.unmarked()
        }
    }

    const fn rest(&self) -> usize {
        (self.size & PSEUDOVECTOR_REST_MASK) >> PSEUDOVECTOR_SIZE_BITS
    }

    pub(crate) const fn is_marked(&self) -> bool {
        self.size & ARRAY_MARK_FLAG != 0
    }

    pub(crate) fn set_mark(&mut self) {
        self.size |= ARRAY_MARK_FLAG;
    }

    pub(crate) fn clear_mark(&mut self) {
        self.size &= !ARRAY_MARK_FLAG;
    }
}

/// The slots following a header.
#[inline]
pub(crate) fn contents(vector: *mut VectorHeader) -> *mut LispObject {
    (vector as usize + HEADER_SIZE) as *mut LispObject
}

/// Bytes occupied by the vector at `vector`.
///
/// # Safety
///
/// `vector` must point at an initialized vector-like object.
pub(crate) unsafe fn vector_nbytes(vector: *const VectorHeader) -> usize {
    // SAFETY: forwarded from the caller.
    let header = unsafe { &*vector };
    match header.pvec_type() {
        None => HEADER_SIZE + header.unmarked() * WORD_SIZE,
        Some(PvecType::BoolVector) => {
            // SAFETY: a bool vector's first word is its bit count.
            let bits = unsafe { *(contents(vector as *mut VectorHeader) as *const usize) };
            HEADER_SIZE + WORD_SIZE + bits.div_ceil(usize::BITS as usize) * WORD_SIZE
        }
        Some(_) => HEADER_SIZE + (header.traced() + header.rest()) * WORD_SIZE,
    }
}

// ============================================================================
// Vector blocks
// ============================================================================

pub(crate) const VECTOR_BLOCK_SIZE: usize = 4096;

/// Usable bytes of a vector block; its last word links the block chain.
pub(crate) const VECTOR_BLOCK_BYTES: usize = VECTOR_BLOCK_SIZE - WORD_SIZE;

const ROUNDUP_SIZE: usize = WORD_SIZE;

const fn vroundup(n: usize) -> usize {
    (n + ROUNDUP_SIZE - 1) & !(ROUNDUP_SIZE - 1)
}

/// Bytes of a vector-like object with `words` words after the header, if
/// that is a vector the heap can hold.
pub(crate) const fn vectorlike_nbytes(words: usize) -> Option<usize> {
    if words > VECTOR_ELTS_MAX {
        return None;
    }
    Some(HEADER_SIZE + words * WORD_SIZE)
}

/// Smallest vector carved from a block: a header and one slot.
pub const VBLOCK_BYTES_MIN: usize = vroundup(HEADER_SIZE + WORD_SIZE);

/// Largest vector carved from a block.
pub const VBLOCK_BYTES_MAX: usize = vroundup(VECTOR_BLOCK_BYTES / 2 - WORD_SIZE);

const VECTOR_MAX_FREE_LIST_INDEX: usize = (VECTOR_BLOCK_BYTES - VBLOCK_BYTES_MIN) / ROUNDUP_SIZE + 1;

const fn vindex(nbytes: usize) -> usize {
    (nbytes - VBLOCK_BYTES_MIN) / ROUNDUP_SIZE
}

const VECTOR_BLOCK_LAYOUT: Layout = match Layout::from_size_align(VECTOR_BLOCK_SIZE, 8) {
    Ok(layout) => layout,
    Err(_) => panic!("bad vector block layout"),
};

#[repr(C)]
struct LargeVector {
    next: *mut LargeVector,
}

const LARGE_VECTOR_OFFSET: usize = size_of::<LargeVector>();

fn large_vector_layout(nbytes: usize) -> Layout {
    byte_layout(LARGE_VECTOR_OFFSET + nbytes, 8)
}

/// Link to the next vector block, stored in the block's last word.
fn block_next(block: *mut u8) -> *mut *mut u8 {
    (block as usize + VECTOR_BLOCK_BYTES) as *mut *mut u8
}

/// Counts from a walk over all vectors.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VectorCensus {
    pub(crate) vectors: usize,
    pub(crate) slots_used: usize,
    pub(crate) slots_free: usize,
    pub(crate) blocks: usize,
    pub(crate) large: usize,
}

pub(crate) struct VectorSpace {
    /// Newest block first.
    blocks: *mut u8,
    nblocks: usize,
    free_lists: Box<[*mut VectorHeader]>,
    large: *mut LargeVector,
    nlarge: usize,
}

impl VectorSpace {
    pub(crate) fn new() -> Self {
        Self {
            blocks: ptr::null_mut(),
            nblocks: 0,
            free_lists: vec![ptr::null_mut(); VECTOR_MAX_FREE_LIST_INDEX].into_boxed_slice(),
            large: ptr::null_mut(),
            nlarge: 0,
        }
    }

    /// Memory for an `nbytes` vector. The caller writes the header.
    pub(crate) fn allocate(&mut self, nbytes: usize, mem: &mut SystemMemory) -> *mut VectorHeader {
        let _input = BlockInput::new();
        if (VBLOCK_BYTES_MIN..=VBLOCK_BYTES_MAX).contains(&nbytes) {
            self.allocate_from_block(nbytes, mem)
        } else {
            self.allocate_large(nbytes, mem)
        }
    }

    /// Turn `nbytes` at `vector` into a free vector on its free list.
    fn setup_on_free_list(&mut self, vector: *mut VectorHeader, nbytes: usize) {
        debug_assert_eq!(nbytes % ROUNDUP_SIZE, 0);
        let index = vindex(nbytes);
        // SAFETY: `vector` spans `nbytes` >= VBLOCK_BYTES_MIN bytes of a block.
        unsafe {
            vector.write(VectorHeader::pseudo(
                PvecType::Free,
                0,
                (nbytes - HEADER_SIZE) / WORD_SIZE,
            ));
            contents(vector)
                .cast::<*mut VectorHeader>()
                .write(self.free_lists[index]);
        }
        self.free_lists[index] = vector;
    }

    fn pop_free(&mut self, index: usize) -> Option<*mut VectorHeader> {
        let vector = self.free_lists[index];
        if vector.is_null() {
            return None;
        }
        // SAFETY: free vectors keep their successor in their first slot.
        self.free_lists[index] = unsafe { *contents(vector).cast::<*mut VectorHeader>() };
        Some(vector)
    }

    fn allocate_from_block(&mut self, nbytes: usize, mem: &mut SystemMemory) -> *mut VectorHeader {
        if let Some(vector) = self.pop_free(vindex(nbytes)) {
            return vector;
        }

        // Split a bigger free vector, leaving at least a minimal one behind.
        for index in vindex(nbytes + VBLOCK_BYTES_MIN)..VECTOR_MAX_FREE_LIST_INDEX {
            if let Some(vector) = self.pop_free(index) {
                let restbytes = index * ROUNDUP_SIZE + VBLOCK_BYTES_MIN - nbytes;
                let rest = (vector as usize + nbytes) as *mut VectorHeader;
                self.setup_on_free_list(rest, restbytes);
                return vector;
            }
        }

        let block = mem
            .lisp_malloc(VECTOR_BLOCK_LAYOUT, MemType::VectorBlock)
            .as_ptr();
        // SAFETY: the link word lies inside the fresh block.
        unsafe { block_next(block).write(self.blocks) };
        self.blocks = block;
        self.nblocks += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(blocks = self.nblocks, "new vector block");

        let vector = block.cast::<VectorHeader>();
        let restbytes = VECTOR_BLOCK_BYTES - nbytes;
        let rest = (block as usize + nbytes) as *mut VectorHeader;
        self.setup_on_free_list(rest, restbytes);
        vector
    }

    fn allocate_large(&mut self, nbytes: usize, mem: &mut SystemMemory) -> *mut VectorHeader {
        let layout = large_vector_layout(nbytes);
        let lv = mem.lisp_malloc(layout, MemType::Vectorlike).cast::<LargeVector>();
        // SAFETY: fresh allocation with room for the link and the vector.
        unsafe { lv.as_ptr().write(LargeVector { next: self.large }) };
        self.large = lv.as_ptr();
        self.nlarge += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(nbytes, "new large vector");
        (lv.as_ptr() as usize + LARGE_VECTOR_OFFSET) as *mut VectorHeader
    }

    /// Is `addr` exactly a live vector inside the range `entry`?
    pub(crate) fn is_live(&self, entry: MemEntry, addr: usize) -> bool {
        match entry.mem_type {
            MemType::Vectorlike => addr == entry.start + LARGE_VECTOR_OFFSET,
            MemType::VectorBlock => {
                let end = entry.start + VECTOR_BLOCK_BYTES;
                if addr >= end {
                    return false;
                }
                let mut vector = entry.start;
                while vector <= addr {
                    let header = vector as *const VectorHeader;
                    if vector == addr {
                        // SAFETY: block vectors tile the block.
                        return !unsafe { &*header }.is_free();
                    }
                    // SAFETY: as above.
                    vector += unsafe { vector_nbytes(header) };
                }
                false
            }
            _ => false,
        }
    }

    /// Free unmarked vectors, coalescing neighbours, and clear the marks of
    /// the rest.
    pub(crate) fn sweep(&mut self, mem: &mut SystemMemory) -> VectorCensus {
        let _input = BlockInput::new();
        let mut census = VectorCensus::default();
        self.free_lists.fill(ptr::null_mut());

        let mut link: *mut *mut u8 = &raw mut self.blocks;
        // SAFETY: `link` points at the word holding `block`; vectors tile
        // each block, so stepping by `vector_nbytes` visits each header.
        unsafe {
            let mut block = *link;
            while !block.is_null() {
                let start = block as usize;
                let end = start + VECTOR_BLOCK_BYTES;
                let mut free_this_block = false;
                let mut vector = start;
                while vector < end {
                    let header = vector as *mut VectorHeader;
                    if (*header).is_marked() {
                        (*header).clear_mark();
                        let nbytes = vector_nbytes(header);
                        census.vectors += 1;
                        census.slots_used += (nbytes - HEADER_SIZE) / WORD_SIZE;
                        vector += nbytes;
                        continue;
                    }
                    let mut total_bytes = 0;
                    let mut next = vector;
                    loop {
                        let nbytes = vector_nbytes(next as *const VectorHeader);
                        total_bytes += nbytes;
                        next += nbytes;
                        if next >= end || (*(next as *const VectorHeader)).is_marked() {
                            break;
                        }
                    }
                    if vector == start && total_bytes == VECTOR_BLOCK_BYTES {
                        free_this_block = true;
                    } else {
                        self.setup_on_free_list(header, total_bytes);
                        census.slots_free += total_bytes / WORD_SIZE;
                    }
                    vector = next;
                }

                let next_block = *block_next(block);
                if free_this_block {
                    *link = next_block;
                    mem.lisp_free(NonNull::new_unchecked(block), VECTOR_BLOCK_LAYOUT);
                    self.nblocks -= 1;
                } else {
                    link = block_next(block);
                    census.blocks += 1;
                }
                block = next_block;
            }

            let mut link: *mut *mut LargeVector = &raw mut self.large;
            let mut lv = *link;
            while !lv.is_null() {
                let next = (*lv).next;
                let header = (lv as usize + LARGE_VECTOR_OFFSET) as *mut VectorHeader;
                let nbytes = vector_nbytes(header);
                if (*header).is_marked() {
                    (*header).clear_mark();
                    census.vectors += 1;
                    census.slots_used += (nbytes - HEADER_SIZE) / WORD_SIZE;
                    census.large += 1;
                    link = &raw mut (*lv).next;
                } else {
                    *link = next;
                    mem.lisp_free(NonNull::new_unchecked(lv.cast()), large_vector_layout(nbytes));
                    self.nlarge -= 1;
                }
                lv = next;
            }
        }
        census
    }

    /// Counts over every vector, without changing anything.
    pub(crate) fn census(&self) -> VectorCensus {
        let mut census = VectorCensus {
            blocks: self.nblocks,
            large: self.nlarge,
            ..VectorCensus::default()
        };
        // SAFETY: vectors tile each block; large vectors are initialized.
        unsafe {
            let mut block = self.blocks;
            while !block.is_null() {
                let end = block as usize + VECTOR_BLOCK_BYTES;
                let mut vector = block as usize;
                while vector < end {
                    let header = vector as *const VectorHeader;
                    let nbytes = vector_nbytes(header);
                    if (*header).is_free() {
                        census.slots_free += nbytes / WORD_SIZE;
                    } else {
                        census.vectors += 1;
                        census.slots_used += (nbytes - HEADER_SIZE) / WORD_SIZE;
                    }
                    vector += nbytes;
                }
                block = *block_next(block);
            }
            let mut lv = self.large;
            while !lv.is_null() {
                let header = (lv as usize + LARGE_VECTOR_OFFSET) as *const VectorHeader;
                census.vectors += 1;
                census.slots_used += (vector_nbytes(header) - HEADER_SIZE) / WORD_SIZE;
                lv = (*lv).next;
            }
        }
        census
    }

    /// Clear the mark of every vector without freeing anything.
    pub(crate) fn clear_marks(&mut self) {
        // SAFETY: vectors tile each block; large vectors are initialized.
        unsafe {
            let mut block = self.blocks;
            while !block.is_null() {
                let end = block as usize + VECTOR_BLOCK_BYTES;
                let mut vector = block as usize;
                while vector < end {
                    let header = vector as *mut VectorHeader;
                    (*header).clear_mark();
                    vector += vector_nbytes(header);
                }
                block = *block_next(block);
            }
            let mut lv = self.large;
            while !lv.is_null() {
                (*((lv as usize + LARGE_VECTOR_OFFSET) as *mut VectorHeader)).clear_mark();
                lv = (*lv).next;
            }
        }
    }

    pub(crate) fn release_all(&mut self, mem: &mut SystemMemory) {
        // SAFETY: every block and large vector is ours and freed once.
        unsafe {
            let mut block = self.blocks;
            while !block.is_null() {
                let next = *block_next(block);
                mem.lisp_free(NonNull::new_unchecked(block), VECTOR_BLOCK_LAYOUT);
                block = next;
            }
            let mut lv = self.large;
            while !lv.is_null() {
                let next = (*lv).next;
                let header = (lv as usize + LARGE_VECTOR_OFFSET) as *const VectorHeader;
                let layout = large_vector_layout(vector_nbytes(header));
                mem.lisp_free(NonNull::new_unchecked(lv.cast()), layout);
                lv = next;
            }
        }
        self.blocks = ptr::null_mut();
        self.nblocks = 0;
        self.large = ptr::null_mut();
        self.nlarge = 0;
        self.free_lists.fill(ptr::null_mut());
    }
}

// ============================================================================
// Heap API
// ============================================================================

impl Heap {
    /// Memory for a vector-like object of `words` words after the header.
    ///
    /// Callers check `words` against [`VECTOR_ELTS_MAX`] first; a size past
    /// it unwinds as exhaustion rather than wrapping.
    pub(crate) fn alloc_vectorlike(&mut self, words: usize) -> *mut VectorHeader {
        let Some(nbytes) = vectorlike_nbytes(words) else {
            panic_any(MemoryExhausted {
                requested: usize::MAX,
            })
        };
        let vector = self.vectors.allocate(nbytes, &mut self.mem);
        self.consing_since_gc += nbytes;
        vector
    }

    /// A pseudovector with `traced` nil slots followed by `rest` zero words.
    pub(crate) fn alloc_pseudovector_raw(
        &mut self,
        kind: PvecType,
        traced: usize,
        rest: usize,
    ) -> *mut VectorHeader {
        let vector = self.alloc_vectorlike(traced + rest);
        // SAFETY: the allocation spans the header plus `traced + rest` words.
        unsafe {
            vector.write(VectorHeader::pseudo(kind, traced, rest));
            ptr::write_bytes(contents(vector), 0, traced + rest);
            for i in 0..traced {
                contents(vector).add(i).write(NIL);
            }
        }
        vector
    }

    /// A vector of `len` slots, each holding `fill`. Zero-length vectors
    /// are shared.
    ///
    /// # Errors
    ///
    /// [`Error::VectorTooLarge`] past [`VECTOR_ELTS_MAX`].
    pub fn allocate_vector(&mut self, len: usize, fill: LispObject) -> Result<LispObject> {
        if len == 0 {
            return Ok(self.zero_vector);
        }
        if len > VECTOR_ELTS_MAX {
            return Err(Error::VectorTooLarge { requested: len });
        }
        let vector = self.alloc_vectorlike(len);
        // SAFETY: the allocation spans the header plus `len` slots.
        unsafe {
            vector.write(VectorHeader::plain(len));
            for i in 0..len {
                contents(vector).add(i).write(fill);
            }
        }
        Ok(LispObject::from_address(vector as usize, LispType::Vectorlike))
    }

    /// A pseudovector of `total_words` words after the header, of which the
    /// first `traced` hold Lisp references (initialized to nil) and the rest
    /// are opaque (zeroed).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPseudovector`] if the counts do not fit the header,
    /// if `traced` exceeds `total_words`, if `total_words` is zero, or if
    /// `kind` needs a layout this call cannot set up (free space, bool
    /// vectors, buffers, hash tables).
    pub fn allocate_pseudovector(
        &mut self,
        total_words: usize,
        traced: usize,
        kind: PvecType,
    ) -> Result<LispObject> {
        let invalid = Error::InvalidPseudovector {
            traced,
            total: total_words,
        };
        if total_words == 0
            || traced > total_words
            || traced > PSEUDOVECTOR_SIZE_MAX
            || total_words - traced > PSEUDOVECTOR_REST_MAX
        {
            return Err(invalid);
        }
        if matches!(
            kind,
            PvecType::Free | PvecType::BoolVector | PvecType::Buffer | PvecType::HashTable
        ) {
            return Err(invalid);
        }
        let vector = self.alloc_pseudovector_raw(kind, traced, total_words - traced);
        Ok(LispObject::from_address(vector as usize, LispType::Vectorlike))
    }

    /// A record of type `record_type` with `nslots` more slots set to
    /// `init`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPseudovector`] if the record does not fit the header.
    pub fn make_record(
        &mut self,
        record_type: LispObject,
        nslots: usize,
        init: LispObject,
    ) -> Result<LispObject> {
        let Some(total) = nslots.checked_add(1) else {
            return Err(Error::InvalidPseudovector {
                traced: nslots,
                total: nslots,
            });
        };
        let record = self.allocate_pseudovector(total, total, PvecType::Record)?;
        let vector = record.as_ptr::<VectorHeader>();
        // SAFETY: the record has `nslots + 1` slots.
        unsafe {
            contents(vector).write(record_type);
            for i in 1..=nslots {
                contents(vector).add(i).write(init);
            }
        }
        Ok(record)
    }

    /// A compiled function holding `slots`. Slot 2 is the constants vector.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPseudovector`] for fewer than four or more than
    /// [`PSEUDOVECTOR_SIZE_MAX`] slots.
    pub fn make_byte_code(&mut self, slots: &[LispObject]) -> Result<LispObject> {
        if slots.len() < COMPILED_MIN_SLOTS {
            return Err(Error::InvalidPseudovector {
                traced: slots.len(),
                total: slots.len(),
            });
        }
        let function = self.allocate_pseudovector(slots.len(), slots.len(), PvecType::Compiled)?;
        let vector = function.as_ptr::<VectorHeader>();
        // SAFETY: the function has exactly `slots.len()` slots.
        unsafe { ptr::copy_nonoverlapping(slots.as_ptr(), contents(vector), slots.len()) };
        Ok(function)
    }

    /// A bool vector of `nbits` bits, all `init`.
    ///
    /// # Errors
    ///
    /// [`Error::VectorTooLarge`] if the bits do not fit a vector.
    pub fn make_bool_vector(&mut self, nbits: usize, init: bool) -> Result<LispObject> {
        let words = nbits.div_ceil(usize::BITS as usize);
        if words >= VECTOR_ELTS_MAX {
            return Err(Error::VectorTooLarge { requested: words + 1 });
        }
        let vector = self.alloc_vectorlike(1 + words);
        let fill = if init { usize::MAX } else { 0 };
        // SAFETY: the allocation spans the header, the count and `words` words.
        unsafe {
            vector.write(VectorHeader::pseudo(PvecType::BoolVector, 0, 0));
            let data = contents(vector).cast::<usize>();
            data.write(nbits);
            for i in 0..words {
                data.add(1 + i).write(fill);
            }
            let tail = nbits % usize::BITS as usize;
            if init && tail != 0 {
                data.add(words).write((1 << tail) - 1);
            }
        }
        Ok(LispObject::from_address(vector as usize, LispType::Vectorlike))
    }

    fn xbool_vector(&self, obj: LispObject) -> Result<*mut usize> {
        if self.pvec_type(obj) != Some(PvecType::BoolVector) {
            return Err(wrong_type("bool-vector", obj.lisp_type()));
        }
        Ok(contents(obj.as_ptr::<VectorHeader>()).cast::<usize>())
    }

    /// Number of bits in a bool vector.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for anything but a bool vector.
    pub fn bool_vector_len(&self, obj: LispObject) -> Result<usize> {
        let data = self.xbool_vector(obj)?;
        // SAFETY: the first word of a bool vector is its bit count.
        Ok(unsafe { *data })
    }

    /// One bit of a bool vector.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`], or [`Error::OutOfRange`] past the last bit.
    pub fn bool_vector_ref(&self, obj: LispObject, index: usize) -> Result<bool> {
        let data = self.xbool_vector(obj)?;
        // SAFETY: the count word is followed by enough words for every bit.
        unsafe {
            let len = *data;
            if index >= len {
                return Err(Error::OutOfRange { index, len });
            }
            let word = *data.add(1 + index / usize::BITS as usize);
            Ok(word & (1 << (index % usize::BITS as usize)) != 0)
        }
    }

    /// Set one bit of a bool vector.
    ///
    /// # Errors
    ///
    /// As for [`Heap::bool_vector_ref`], plus [`Error::ImmutableObject`].
    pub fn bool_vector_set(&mut self, obj: LispObject, index: usize, value: bool) -> Result<()> {
        let data = self.xbool_vector(obj)?;
        self.check_impure(obj)?;
        // SAFETY: as in `bool_vector_ref`.
        unsafe {
            let len = *data;
            if index >= len {
                return Err(Error::OutOfRange { index, len });
            }
            let word = data.add(1 + index / usize::BITS as usize);
            let bit = 1 << (index % usize::BITS as usize);
            if value {
                *word |= bit;
            } else {
                *word &= !bit;
            }
        }
        Ok(())
    }

    /// The kind of a pseudovector; `None` for plain vectors and non-vectors.
    #[must_use]
    pub fn pvec_type(&self, obj: LispObject) -> Option<PvecType> {
        if !obj.is_vectorlike() {
            return None;
        }
        // SAFETY: a vectorlike reference points at a header.
        unsafe { &*obj.as_ptr::<VectorHeader>() }.pvec_type()
    }

    /// The header of a vector whose slots `aref` may touch, with its slot
    /// count.
    fn xslots(&self, obj: LispObject) -> Result<(*mut VectorHeader, usize)> {
        if !obj.is_vectorlike() {
            return Err(wrong_type("vector", obj.lisp_type()));
        }
        let vector = obj.as_ptr::<VectorHeader>();
        // SAFETY: a vectorlike reference points at a header.
        let header = unsafe { &*vector };
        match header.pvec_type() {
            Some(
                PvecType::Free | PvecType::BoolVector | PvecType::Buffer | PvecType::HashTable,
            ) => Err(wrong_type("vector", obj.lisp_type())),
            _ => Ok((vector, header.traced())),
        }
    }

    /// Number of Lisp slots of a vector, record, compiled function or other
    /// pseudovector.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] for non-vectors and for kinds without plain
    /// slots (bool vectors, buffers, hash tables).
    pub fn vector_len(&self, vector: LispObject) -> Result<usize> {
        Ok(self.xslots(vector)?.1)
    }

    /// Slot `index` of a vector.
    ///
    /// # Errors
    ///
    /// As for [`Heap::vector_len`], plus [`Error::OutOfRange`].
    pub fn aref(&self, vector: LispObject, index: usize) -> Result<LispObject> {
        let (header, len) = self.xslots(vector)?;
        if index >= len {
            return Err(Error::OutOfRange { index, len });
        }
        // SAFETY: `index` is below the slot count.
        Ok(unsafe { *contents(header).add(index) })
    }

    /// Store into slot `index` of a vector.
    ///
    /// # Errors
    ///
    /// As for [`Heap::aref`], plus [`Error::ImmutableObject`] for pure
    /// vectors.
    pub fn aset(&mut self, vector: LispObject, index: usize, value: LispObject) -> Result<()> {
        let (header, len) = self.xslots(vector)?;
        self.check_impure(vector)?;
        if index >= len {
            return Err(Error::OutOfRange { index, len });
        }
        // SAFETY: `index` is below the slot count.
        unsafe { contents(header).add(index).write(value) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_sizes_do_not_wrap() {
        assert_eq!(vectorlike_nbytes(0), Some(HEADER_SIZE));
        assert_eq!(vectorlike_nbytes(3), Some(HEADER_SIZE + 3 * WORD_SIZE));
        assert!(vectorlike_nbytes(VECTOR_ELTS_MAX).is_some());
        assert_eq!(vectorlike_nbytes(VECTOR_ELTS_MAX + 1), None);
        assert_eq!(vectorlike_nbytes(usize::MAX / 4), None);
    }

    #[test]
    fn geometry() {
        assert_eq!(VBLOCK_BYTES_MIN, 16);
        assert_eq!(VBLOCK_BYTES_MAX, 2040);
        assert_eq!(VECTOR_MAX_FREE_LIST_INDEX, 510);
        assert_eq!(vindex(VECTOR_BLOCK_BYTES), VECTOR_MAX_FREE_LIST_INDEX - 1);
    }

    #[test]
    fn header_fields() {
        let header = VectorHeader::pseudo(PvecType::Record, 3, 5);
        assert!(header.is_pseudo());
        assert_eq!(header.pvec_type(), Some(PvecType::Record));
        assert_eq!(header.traced(), 3);
        assert_eq!(header.rest(), 5);
        let plain = VectorHeader::plain(7);
        assert_eq!(plain.pvec_type(), None);
        assert_eq!(plain.traced(), 7);
        assert_eq!(unsafe { vector_nbytes(&plain) }, 64);
    }

    #[test]
    fn marks_do_not_disturb_sizes() {
        let mut header = VectorHeader::pseudo(PvecType::Compiled, 4, 0);
        header.set_mark();
        assert!(header.is_marked());
        assert_eq!(header.traced(), 4);
        assert_eq!(header.pvec_type(), Some(PvecType::Compiled));
        header.clear_mark();
        assert!(!header.is_marked());
    }

    #[test]
    fn block_allocation_splits_and_sweep_coalesces() {
        let mut mem = SystemMemory::new(None);
        let mut space = VectorSpace::new();
        let a = space.allocate(32, &mut mem);
        unsafe { a.write(VectorHeader::plain(3)) };
        let b = space.allocate(32, &mut mem);
        unsafe { b.write(VectorHeader::plain(3)) };
        assert_eq!(b as usize - a as usize, 32);

        let census = space.census();
        assert_eq!(census.blocks, 1);
        assert_eq!(census.vectors, 2);
        assert_eq!(census.slots_free, (VECTOR_BLOCK_BYTES - 64) / WORD_SIZE);

        // Keep `b`; `a` becomes a free vector of its own.
        unsafe { (*b).set_mark() };
        let census = space.sweep(&mut mem);
        assert_eq!(census.vectors, 1);
        assert_eq!(census.slots_free, (VECTOR_BLOCK_BYTES - 32) / WORD_SIZE);
        assert!(unsafe { &*a }.is_free());
        let reused = space.allocate(32, &mut mem);
        assert_eq!(reused, a);

        // Nothing marked: the whole block goes back.
        let census = space.sweep(&mut mem);
        assert_eq!(census.blocks, 0);
        assert_eq!(mem.tree.len(), 1);
    }

    #[test]
    fn large_vectors_live_on_their_own() {
        let mut mem = SystemMemory::new(None);
        let mut space = VectorSpace::new();
        let nbytes = HEADER_SIZE + 1000 * WORD_SIZE;
        let v = space.allocate(nbytes, &mut mem);
        unsafe { v.write(VectorHeader::plain(1000)) };
        let entry = mem.tree.find(v as usize).unwrap();
        assert_eq!(entry.mem_type, MemType::Vectorlike);
        assert!(space.is_live(entry, v as usize));
        assert!(!space.is_live(entry, v as usize + 8));
        let census = space.sweep(&mut mem);
        assert_eq!(census.large, 0);
        assert!(mem.tree.find(v as usize).is_none());
    }
}
