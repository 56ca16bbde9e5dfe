//! Validating raw words as heap references.
//!
//! Conservative stack scanning sees plain machine words. A word is taken to
//! refer to an object only if the address classifier places it inside a
//! heap block and that block's kind confirms a live object starts exactly
//! there. Each word is tried twice: as a tagged reference, and as a bare
//! pointer to the start of an object.

use crate::heap::Heap;
use crate::mem_tree::{MemEntry, MemType};
use crate::object::{LispObject, LispType, GCALIGNMENT};
use crate::space::buffer::Buffer;

/// What [`Heap::is_valid_reference`] can tell about a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Validity {
    /// A live object, an immediate, or a pure object.
    Valid,
    /// Not a reference to a live object.
    Invalid,
    /// A real object in a state accessors reject: a killed buffer or one
    /// of the special buffers.
    Special,
    /// The address could not be probed.
    Unknown,
}

/// The tag an object of `mem_type` carries.
const fn lisp_type_of(mem_type: MemType) -> Option<LispType> {
    match mem_type {
        MemType::Cons => Some(LispType::Cons),
        MemType::String => Some(LispType::String),
        MemType::Misc => Some(LispType::Misc),
        MemType::Symbol => Some(LispType::Symbol),
        MemType::Float => Some(LispType::Float),
        MemType::Vectorlike | MemType::VectorBlock | MemType::Buffer => Some(LispType::Vectorlike),
        MemType::Spare => None,
    }
}

/// Can `addr` be read? `None` if the probe itself failed.
///
/// The kernel reports `EFAULT` instead of faulting when asked to write
/// unreadable memory to a pipe.
fn probe_readable(addr: usize) -> Option<bool> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: plain syscalls on descriptors we own; the kernel validates
    // the source address.
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            return None;
        }
        let written = libc::write(fds[1], addr as *const libc::c_void, 16);
        libc::close(fds[0]);
        libc::close(fds[1]);
        Some(written == 16)
    }
}

impl Heap {
    /// Does a live object start exactly at `addr` inside `entry`?
    fn live_object_at(&self, entry: MemEntry, addr: usize) -> bool {
        match entry.mem_type {
            MemType::Cons => self.conses.is_live(entry.start, addr),
            MemType::String => self.strings.headers.is_live(entry.start, addr),
            MemType::Misc => self.miscs.is_live(entry.start, addr),
            MemType::Symbol => self.symbols.is_live(entry.start, addr),
            MemType::Float => self.floats.is_live(entry.start, addr),
            MemType::Vectorlike | MemType::VectorBlock => self.vectors.is_live(entry, addr),
            MemType::Buffer => {
                // SAFETY: a buffer range starts with an allocated buffer.
                addr == entry.start && unsafe { (*(addr as *const Buffer)).is_live() }
            }
            MemType::Spare => false,
        }
    }

    /// The object `word` denotes as a tagged reference.
    fn tagged_candidate(&self, word: usize) -> Option<LispObject> {
        // SAFETY: the word is only inspected, never dereferenced here.
        let obj = unsafe { LispObject::from_bits(word) };
        if obj.is_immediate() {
            return None;
        }
        let addr = obj.address();
        let entry = self.mem.tree.find(addr)?;
        (lisp_type_of(entry.mem_type) == Some(obj.lisp_type()) && self.live_object_at(entry, addr))
            .then_some(obj)
    }

    /// The object `word` points to the start of, as an untagged pointer.
    fn pointer_candidate(&self, word: usize) -> Option<LispObject> {
        if word % GCALIGNMENT != 0 {
            return None;
        }
        let entry = self.mem.tree.find(word)?;
        let ty = lisp_type_of(entry.mem_type)?;
        self.live_object_at(entry, word)
            .then(|| LispObject::from_address(word, ty))
    }

    /// The live heap object a stack word may refer to.
    pub(crate) fn conservative_candidate(&self, word: usize) -> Option<LispObject> {
        self.tagged_candidate(word)
            .or_else(|| self.pointer_candidate(word))
    }

    /// The kind of heap block `obj` points into, if any.
    #[must_use]
    pub fn mem_type_of(&self, obj: LispObject) -> Option<MemType> {
        if obj.is_immediate() {
            return None;
        }
        self.mem.tree.find(obj.address()).map(|entry| entry.mem_type)
    }

    /// Check whether `obj` is a well-formed reference to a live object.
    /// Meant for debugging aids rather than the allocator's own use.
    #[must_use]
    pub fn is_valid_reference(&self, obj: LispObject) -> Validity {
        if obj.is_immediate() {
            return Validity::Valid;
        }
        let addr = obj.address();
        if self.pure.contains(addr) {
            return Validity::Valid;
        }
        if self.buffers.is_special(addr) {
            return Validity::Special;
        }
        let Some(entry) = self.mem.tree.find(addr) else {
            return match probe_readable(addr) {
                None => Validity::Unknown,
                Some(_) => Validity::Invalid,
            };
        };
        if lisp_type_of(entry.mem_type) != Some(obj.lisp_type()) {
            return Validity::Invalid;
        }
        if entry.mem_type == MemType::Buffer {
            return if addr != entry.start {
                Validity::Invalid
            } else if self.live_object_at(entry, addr) {
                Validity::Valid
            } else {
                Validity::Special
            };
        }
        if self.live_object_at(entry, addr) {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}
