//! Memory obtained from the system on behalf of the heap.
//!
//! Every block the heap uses passes through [`SystemMemory`], which keeps
//! the byte count against the configured limit, registers Lisp blocks with
//! the address classifier, and owns the spare reserve that is given up the
//! first time memory runs out.

use std::alloc::Layout;
use std::panic::panic_any;
use std::ptr::NonNull;

use crate::error::MemoryExhausted;
use crate::input::BlockInput;
use crate::mem_tree::{MemTree, MemType};

/// Bytes held back to give the program room to recover from exhaustion.
pub const SPARE_MEMORY: usize = 1 << 14;

const SPARE_LAYOUT: Layout = match Layout::from_size_align(SPARE_MEMORY, 8) {
    Ok(layout) => layout,
    Err(_) => panic!("bad spare layout"),
};

/// Layout for `size` bytes at `align`, or an exhaustion unwind if no such
/// layout exists.
pub(crate) fn byte_layout(size: usize, align: usize) -> Layout {
    match Layout::from_size_align(size, align) {
        Ok(layout) => layout,
        Err(_) => panic_any(MemoryExhausted { requested: size }),
    }
}

pub(crate) struct SystemMemory {
    pub(crate) tree: MemTree,
    limit: Option<usize>,
    in_use: usize,
    spare: Option<NonNull<u8>>,
    memory_full: bool,
}

impl SystemMemory {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        let mut mem = Self {
            tree: MemTree::new(),
            limit,
            in_use: 0,
            spare: None,
            memory_full: false,
        };
        mem.refill_reserve();
        mem
    }

    fn obtain(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if let Some(limit) = self.limit {
            if self.in_use.saturating_add(layout.size()) > limit {
                return None;
            }
        }
        let ptr = sys_alloc::allocate(layout)?;
        self.in_use += layout.size();
        Some(ptr)
    }

    unsafe fn give_back(&mut self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the caller passes a block obtained with this layout.
        unsafe { sys_alloc::deallocate(ptr, layout) };
        self.in_use -= layout.size();
    }

    /// Memory that is not Lisp data: string data blocks and the like.
    pub(crate) fn xmalloc(&mut self, layout: Layout) -> NonNull<u8> {
        match self.obtain(layout) {
            Some(ptr) => ptr,
            None => self.memory_full(layout),
        }
    }

    /// # Safety
    ///
    /// `ptr` must come from [`Self::xmalloc`] with the same layout.
    pub(crate) unsafe fn xfree(&mut self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded from the caller.
        unsafe { self.give_back(ptr, layout) };
    }

    /// A block of Lisp data, registered with the address classifier.
    pub(crate) fn lisp_malloc(&mut self, layout: Layout, mem_type: MemType) -> NonNull<u8> {
        let _input = BlockInput::new();
        let ptr = self.xmalloc(layout);
        let start = ptr.as_ptr() as usize;
        self.tree.insert(start, start + layout.size(), mem_type);
        ptr
    }

    /// # Safety
    ///
    /// `ptr` must come from [`Self::lisp_malloc`] with the same layout, and
    /// nothing may refer to the block afterwards.
    pub(crate) unsafe fn lisp_free(&mut self, ptr: NonNull<u8>, layout: Layout) {
        let _input = BlockInput::new();
        self.tree.remove(ptr.as_ptr() as usize);
        // SAFETY: forwarded from the caller.
        unsafe { self.give_back(ptr, layout) };
    }

    /// Could a request of `size` bytes be satisfied right now?
    fn has_room_for(&mut self, size: usize) -> bool {
        let layout = byte_layout(size, 8);
        match self.obtain(layout) {
            Some(ptr) => {
                // SAFETY: just obtained with this layout.
                unsafe { self.give_back(ptr, layout) };
                true
            }
            None => false,
        }
    }

    #[cold]
    fn memory_full(&mut self, layout: Layout) -> ! {
        let requested = layout.size();
        // A large request can fail while plenty of memory remains.
        if requested > SPARE_MEMORY && self.has_room_for(SPARE_MEMORY) {
            #[cfg(feature = "tracing")]
            tracing::debug!(requested, "large allocation refused");
            panic_any(MemoryExhausted { requested });
        }
        self.memory_full = true;
        if let Some(spare) = self.spare.take() {
            self.tree.remove(spare.as_ptr() as usize);
            // SAFETY: the reserve was obtained with SPARE_LAYOUT.
            unsafe { self.give_back(spare, SPARE_LAYOUT) };
            #[cfg(feature = "tracing")]
            tracing::warn!(requested, "memory exhausted; spare reserve released");
            panic_any(MemoryExhausted { requested });
        }
        #[cfg(feature = "tracing")]
        tracing::error!(requested, "memory exhausted with no spare reserve left");
        std::alloc::handle_alloc_error(layout)
    }

    /// Try to get the spare reserve back. Clears the memory-full state on
    /// success.
    pub(crate) fn refill_reserve(&mut self) {
        if self.spare.is_none() {
            if let Some(ptr) = self.obtain(SPARE_LAYOUT) {
                let start = ptr.as_ptr() as usize;
                self.tree.insert(start, start + SPARE_MEMORY, MemType::Spare);
                self.spare = Some(ptr);
            }
        }
        if self.spare.is_some() {
            self.memory_full = false;
        }
    }

    pub(crate) const fn is_memory_full(&self) -> bool {
        self.memory_full
    }

    pub(crate) const fn spare_available(&self) -> bool {
        self.spare.is_some()
    }

    pub(crate) const fn bytes_in_use(&self) -> usize {
        self.in_use
    }
}

impl Drop for SystemMemory {
    fn drop(&mut self) {
        if let Some(spare) = self.spare.take() {
            // SAFETY: the reserve was obtained with SPARE_LAYOUT.
            unsafe { self.give_back(spare, SPARE_LAYOUT) };
        }
    }
}
