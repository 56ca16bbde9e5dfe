//! Buffers.
//!
//! Buffers are vector-like but allocated one by one and kept on a single
//! chain of all buffers. A buffer whose name is nil has been killed; it stays
//! allocated until nothing refers to it.

use std::alloc::Layout;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use super::block::Slot;
use super::misc::Misc;
use super::vector::{PvecType, VectorHeader};
use crate::config::WORD_SIZE;
use crate::error::{wrong_type, Result};
use crate::heap::Heap;
use crate::input::BlockInput;
use crate::mem_tree::MemType;
use crate::memory::SystemMemory;
use crate::object::{LispObject, LispType, NIL};

/// Slots following the header that hold Lisp references and are traced
/// like vector slots: name, file name, directory, mark and local variables.
const BUFFER_TRACED_SLOTS: usize = 5;

const BUFFER_WORDS: usize = size_of::<Buffer>() / WORD_SIZE - 1;

const BUFFER_LAYOUT: Layout = Layout::new::<Buffer>();

#[repr(C)]
pub(crate) struct Buffer {
    pub(crate) header: VectorHeader,
    pub(crate) name: LispObject,
    pub(crate) filename: LispObject,
    pub(crate) directory: LispObject,
    pub(crate) mark: LispObject,
    pub(crate) local_var_alist: LispObject,
    /// Filtered before it is marked.
    pub(crate) undo_list: LispObject,
    pub(crate) overlays_before: LispObject,
    pub(crate) overlays_after: LispObject,
    pub(crate) overlay_center: isize,
    pub(crate) markers: *mut Slot<Misc>,
    /// For an indirect buffer, the buffer whose text it shares.
    pub(crate) base_buffer: *mut Buffer,
    pub(crate) next: *mut Buffer,
}

impl Buffer {
    fn new(name: LispObject, mark: LispObject, base_buffer: *mut Self) -> Self {
        Self {
            header: VectorHeader::pseudo(
                PvecType::Buffer,
                BUFFER_TRACED_SLOTS,
                BUFFER_WORDS - BUFFER_TRACED_SLOTS,
            ),
            name,
            filename: NIL,
            directory: NIL,
            mark,
            local_var_alist: NIL,
            undo_list: NIL,
            overlays_before: NIL,
            overlays_after: NIL,
            overlay_center: 1,
            markers: ptr::null_mut(),
            base_buffer,
            next: ptr::null_mut(),
        }
    }

    pub(crate) const fn is_live(&self) -> bool {
        !self.name.is_nil()
    }

    /// Point every marker on the chain nowhere.
    ///
    /// # Safety
    ///
    /// The chain must hold live marker cells.
    unsafe fn detach_markers(&mut self) {
        let mut marker = self.markers;
        while !marker.is_null() {
            // SAFETY: the chain holds live markers.
            marker = match unsafe { &mut *marker } {
                Slot::Live(Misc::Marker(m)) => {
                    let next = m.next;
                    m.buffer = ptr::null_mut();
                    m.next = ptr::null_mut();
                    next
                }
                _ => break,
            };
        }
        self.markers = ptr::null_mut();
    }
}

pub(crate) struct BufferSpace {
    /// Newest first.
    pub(crate) all: *mut Buffer,
    count: usize,
    /// Holds the default values of per-buffer variables.
    pub(crate) defaults: *mut Buffer,
    /// Holds the symbols of per-buffer variables.
    pub(crate) local_symbols: *mut Buffer,
}

impl BufferSpace {
    pub(crate) const fn new() -> Self {
        Self {
            all: ptr::null_mut(),
            count: 0,
            defaults: ptr::null_mut(),
            local_symbols: ptr::null_mut(),
        }
    }

    /// Allocate the two special buffers. They are not on the chain and not
    /// known to the address classifier.
    pub(crate) fn init_special(&mut self, mem: &mut SystemMemory) {
        for special in [&mut self.defaults, &mut self.local_symbols] {
            let b = mem.xmalloc(BUFFER_LAYOUT).cast::<Buffer>().as_ptr();
            // SAFETY: fresh allocation of the right layout.
            unsafe { b.write(Buffer::new(NIL, NIL, ptr::null_mut())) };
            *special = b;
        }
    }

    pub(crate) fn is_special(&self, addr: usize) -> bool {
        addr == self.defaults as usize || addr == self.local_symbols as usize
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = *mut Buffer> + '_ {
        let mut b = self.all;
        std::iter::from_fn(move || {
            if b.is_null() {
                return None;
            }
            let current = b;
            // SAFETY: the chain holds allocated buffers.
            b = unsafe { (*b).next };
            Some(current)
        })
    }

    /// Free unmarked buffers and unmark the rest.
    pub(crate) fn sweep(&mut self, mem: &mut SystemMemory) -> usize {
        let _input = BlockInput::new();
        let mut link: *mut *mut Buffer = &raw mut self.all;
        // SAFETY: `link` points at the field holding `b`; markers still on
        // a dying buffer's chain are live, since dead ones were unchained
        // when misc cells were swept.
        unsafe {
            let mut b = *link;
            while !b.is_null() {
                let next = (*b).next;
                if (*b).header.is_marked() {
                    (*b).header.clear_mark();
                    link = &raw mut (*b).next;
                } else {
                    *link = next;
                    (*b).detach_markers();
                    mem.lisp_free(NonNull::new_unchecked(b.cast()), BUFFER_LAYOUT);
                    self.count -= 1;
                }
                b = next;
            }
            for special in [self.defaults, self.local_symbols] {
                if !special.is_null() {
                    (*special).header.clear_mark();
                }
            }
        }
        self.count
    }

    /// Clear the mark of every buffer, the special ones included.
    pub(crate) fn clear_marks(&mut self) {
        // SAFETY: every buffer on the chain and both special buffers are
        // allocated.
        unsafe {
            let mut b = self.all;
            while !b.is_null() {
                (*b).header.clear_mark();
                b = (*b).next;
            }
            for special in [self.defaults, self.local_symbols] {
                if !special.is_null() {
                    (*special).header.clear_mark();
                }
            }
        }
    }

    pub(crate) const fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn release_all(&mut self, mem: &mut SystemMemory) {
        // SAFETY: every buffer is ours and freed once; markers are not
        // touched since their cells are released separately.
        unsafe {
            let mut b = self.all;
            while !b.is_null() {
                let next = (*b).next;
                mem.lisp_free(NonNull::new_unchecked(b.cast()), BUFFER_LAYOUT);
                b = next;
            }
            for special in [self.defaults, self.local_symbols] {
                if let Some(p) = NonNull::new(special) {
                    mem.xfree(p.cast(), BUFFER_LAYOUT);
                }
            }
        }
        self.all = ptr::null_mut();
        self.count = 0;
        self.defaults = ptr::null_mut();
        self.local_symbols = ptr::null_mut();
    }
}

impl Heap {
    pub(crate) fn xbuffer(&self, obj: LispObject) -> Result<*mut Buffer> {
        if self.pvec_type(obj) == Some(PvecType::Buffer) {
            Ok(obj.as_ptr::<Buffer>())
        } else {
            Err(wrong_type("buffer", obj.lisp_type()))
        }
    }

    pub(crate) fn xlive_buffer(&self, obj: LispObject) -> Result<*mut Buffer> {
        let b = self.xbuffer(obj)?;
        // SAFETY: `b` is an allocated buffer.
        if unsafe { (*b).is_live() } {
            Ok(b)
        } else {
            Err(wrong_type("live buffer", LispType::Vectorlike))
        }
    }

    fn allocate_buffer(&mut self, name: LispObject, base: *mut Buffer) -> LispObject {
        let mark = self.allocate_marker();
        let b = self
            .mem
            .lisp_malloc(BUFFER_LAYOUT, MemType::Buffer)
            .cast::<Buffer>()
            .as_ptr();
        // SAFETY: fresh allocation of the right layout.
        unsafe {
            b.write(Buffer::new(name, mark, base));
            (*b).next = self.buffers.all;
        }
        self.buffers.all = b;
        self.buffers.count += 1;
        self.consing_since_gc += BUFFER_LAYOUT.size();
        #[cfg(feature = "tracing")]
        tracing::debug!(buffers = self.buffers.count, "new buffer");
        LispObject::from_address(b as usize, LispType::Vectorlike)
    }

    /// A new live buffer named `name`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] if `name` is not a string.
    pub fn make_buffer(&mut self, name: LispObject) -> Result<LispObject> {
        if !name.is_string() {
            return Err(wrong_type("string", name.lisp_type()));
        }
        Ok(self.allocate_buffer(name, ptr::null_mut()))
    }

    /// A new buffer sharing the text of `base`, or of `base`'s own base if
    /// `base` is itself indirect.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] if `base` is not a live buffer or `name`
    /// is not a string.
    pub fn make_indirect_buffer(&mut self, base: LispObject, name: LispObject) -> Result<LispObject> {
        if !name.is_string() {
            return Err(wrong_type("string", name.lisp_type()));
        }
        let mut b = self.xlive_buffer(base)?;
        // SAFETY: `b` is a live buffer; base buffers stay allocated while an
        // indirect buffer refers to them.
        unsafe {
            if !(*b).base_buffer.is_null() {
                b = (*b).base_buffer;
            }
        }
        Ok(self.allocate_buffer(name, b))
    }

    /// Kill `buffer` and any indirect buffers sharing its text: clear the
    /// name, point its markers nowhere, drop its overlays and undo list.
    /// Returns false if it was already dead.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn kill_buffer(&mut self, buffer: LispObject) -> Result<bool> {
        let b = self.xbuffer(buffer)?;
        // SAFETY: `b` is an allocated buffer.
        if !unsafe { (*b).is_live() } {
            return Ok(false);
        }
        let indirect: Vec<*mut Buffer> = self
            .buffers
            .iter()
            // SAFETY: chain members are allocated buffers.
            .filter(|&other| unsafe { (*other).base_buffer } == b)
            .collect();
        for other in indirect {
            self.kill_buffer(LispObject::from_address(other as usize, LispType::Vectorlike))?;
        }
        // SAFETY: as above; the marker chain holds live markers.
        unsafe {
            (*b).name = NIL;
            (*b).detach_markers();
            (*b).overlays_before = NIL;
            (*b).overlays_after = NIL;
            (*b).undo_list = NIL;
        }
        Ok(true)
    }

    /// True for a buffer that has not been killed.
    #[must_use]
    pub fn buffer_live_p(&self, obj: LispObject) -> bool {
        self.xlive_buffer(obj).is_ok()
    }

    /// The name of `buffer`; nil once killed.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn buffer_name(&self, buffer: LispObject) -> Result<LispObject> {
        let b = self.xbuffer(buffer)?;
        // SAFETY: `b` is an allocated buffer.
        Ok(unsafe { (*b).name })
    }

    /// The base buffer of an indirect buffer, or nil.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn buffer_base_buffer(&self, buffer: LispObject) -> Result<LispObject> {
        let b = self.xbuffer(buffer)?;
        // SAFETY: `b` is an allocated buffer.
        let base = unsafe { (*b).base_buffer };
        Ok(if base.is_null() {
            NIL
        } else {
            LispObject::from_address(base as usize, LispType::Vectorlike)
        })
    }

    /// The mark of `buffer`, a marker.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn buffer_mark(&self, buffer: LispObject) -> Result<LispObject> {
        let b = self.xbuffer(buffer)?;
        // SAFETY: `b` is an allocated buffer.
        Ok(unsafe { (*b).mark })
    }

    /// The undo list of `buffer`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn buffer_undo_list(&self, buffer: LispObject) -> Result<LispObject> {
        let b = self.xbuffer(buffer)?;
        // SAFETY: `b` is an allocated buffer.
        Ok(unsafe { (*b).undo_list })
    }

    /// Replace the undo list of `buffer`. Entries of the form
    /// `(MARKER . ADJUSTMENT)` do not keep their marker alive.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn set_buffer_undo_list(&mut self, buffer: LispObject, list: LispObject) -> Result<()> {
        let b = self.xbuffer(buffer)?;
        // SAFETY: `b` is an allocated buffer.
        unsafe { (*b).undo_list = list };
        Ok(())
    }

    /// The `(SYMBOL . VALUE)` alist of `buffer`'s local bindings.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn buffer_local_variables(&self, buffer: LispObject) -> Result<LispObject> {
        let b = self.xbuffer(buffer)?;
        // SAFETY: `b` is an allocated buffer.
        Ok(unsafe { (*b).local_var_alist })
    }

    /// Set the file name and directory of `buffer`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::WrongType`] for non-buffers.
    pub fn set_buffer_file_name(
        &mut self,
        buffer: LispObject,
        filename: LispObject,
        directory: LispObject,
    ) -> Result<()> {
        let b = self.xbuffer(buffer)?;
        // SAFETY: `b` is an allocated buffer.
        unsafe {
            (*b).filename = filename;
            (*b).directory = directory;
        }
        Ok(())
    }

    /// Every live buffer, newest first.
    #[must_use]
    pub fn buffer_list(&self) -> Vec<LispObject> {
        self.buffers
            .iter()
            // SAFETY: chain members are allocated buffers.
            .filter(|&b| unsafe { (*b).is_live() })
            .map(|b| LispObject::from_address(b as usize, LispType::Vectorlike))
            .collect()
    }

    /// The buffer holding default values of per-buffer variables.
    #[must_use]
    pub fn buffer_defaults(&self) -> LispObject {
        LispObject::from_address(self.buffers.defaults as usize, LispType::Vectorlike)
    }

    /// The buffer holding the symbols of per-buffer variables.
    #[must_use]
    pub fn buffer_local_symbols(&self) -> LispObject {
        LispObject::from_address(self.buffers.local_symbols as usize, LispType::Vectorlike)
    }
}
