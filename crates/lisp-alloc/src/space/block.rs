//! Blocks of fixed-size cells.
//!
//! Pairs, floats, symbols, misc objects and string headers all live in
//! 4 KiB blocks aligned to their size, so the block owning a cell is found by
//! masking the cell's address. Each block starts with a [`BlockHeader`]
//! holding the chain link and the mark bitmap, followed by the cells.
//!
//! ```text
//! +------+-----------+--------+--------+-----+--------+
//! | next | marks[8]  | cell 0 | cell 1 | ... | cell N |
//! +------+-----------+--------+--------+-----+--------+
//! ```
//!
//! New blocks are handed out by bumping an index through the newest block;
//! cells freed by a sweep go on an intrusive free list that allocation
//! prefers.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use crate::input::BlockInput;
use crate::mem_tree::MemType;
use crate::memory::SystemMemory;

/// Size and alignment of a cell block.
pub const BLOCK_BYTES: usize = 4096;

const MARK_WORDS: usize = 8;

const BLOCK_LAYOUT: Layout = match Layout::from_size_align(BLOCK_BYTES, BLOCK_BYTES) {
    Ok(layout) => layout,
    Err(_) => panic!("bad block layout"),
};

#[repr(C)]
pub(crate) struct BlockHeader {
    next: *mut BlockHeader,
    marks: [u64; MARK_WORDS],
}

/// A cell: either a live object or a link in the free list.
pub(crate) enum Slot<T> {
    Live(T),
    Free(*mut Slot<T>),
}

/// Per-kind constants for a [`CellSpace`].
pub(crate) trait CellKind: Sized {
    const MEM_TYPE: MemType;
    const NAME: &'static str;
}

/// Counts left by a sweep.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SweepCounts {
    pub(crate) in_use: usize,
    pub(crate) free: usize,
    pub(crate) blocks_freed: usize,
}

const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Address of the block holding the cell at `addr`.
#[inline]
pub(crate) const fn block_of(addr: usize) -> usize {
    addr & !(BLOCK_BYTES - 1)
}

pub(crate) struct CellSpace<T: CellKind> {
    /// Newest block first.
    blocks: *mut BlockHeader,
    /// Next never-used cell in the newest block.
    index: usize,
    free_list: *mut Slot<T>,
    nblocks: usize,
    in_use: usize,
    free: usize,
    _kind: PhantomData<T>,
}

impl<T: CellKind> CellSpace<T> {
    pub(crate) const SLOT_SIZE: usize = size_of::<Slot<T>>();
    const CELLS_OFFSET: usize = round_up(size_of::<BlockHeader>(), align_of::<Slot<T>>());
    pub(crate) const CELLS_PER_BLOCK: usize = (BLOCK_BYTES - Self::CELLS_OFFSET) / Self::SLOT_SIZE;

    pub(crate) const fn new() -> Self {
        assert!(Self::CELLS_PER_BLOCK <= MARK_WORDS * 64);
        assert!(align_of::<Slot<T>>() >= crate::object::GCALIGNMENT);
        Self {
            blocks: ptr::null_mut(),
            index: 0,
            free_list: ptr::null_mut(),
            nblocks: 0,
            in_use: 0,
            free: 0,
            _kind: PhantomData,
        }
    }

    #[inline]
    fn cell_at(block: *mut BlockHeader, index: usize) -> *mut Slot<T> {
        (block as usize + Self::CELLS_OFFSET + index * Self::SLOT_SIZE) as *mut Slot<T>
    }

    #[inline]
    fn index_of(addr: usize) -> usize {
        (addr - block_of(addr) - Self::CELLS_OFFSET) / Self::SLOT_SIZE
    }

    pub(crate) fn allocate(&mut self, value: T, mem: &mut SystemMemory) -> *mut Slot<T> {
        let _input = BlockInput::new();
        let slot = if self.free_list.is_null() {
            if self.blocks.is_null() || self.index == Self::CELLS_PER_BLOCK {
                self.new_block(mem);
            }
            let slot = Self::cell_at(self.blocks, self.index);
            self.index += 1;
            slot
        } else {
            let slot = self.free_list;
            // SAFETY: free-list entries are free cells of our blocks.
            self.free_list = match unsafe { &*slot } {
                Slot::Free(next) => *next,
                Slot::Live(_) => panic!("live {} cell on the free list", T::NAME),
            };
            self.free -= 1;
            slot
        };
        // SAFETY: `slot` is an unused cell; `Slot::Free` has nothing to drop.
        unsafe { slot.write(Slot::Live(value)) };
        self.in_use += 1;
        slot
    }

    fn new_block(&mut self, mem: &mut SystemMemory) {
        let block = mem.lisp_malloc(BLOCK_LAYOUT, T::MEM_TYPE).cast::<BlockHeader>();
        // SAFETY: fresh block, large enough for the header.
        unsafe {
            block.as_ptr().write(BlockHeader {
                next: self.blocks,
                marks: [0; MARK_WORDS],
            });
        }
        self.blocks = block.as_ptr();
        self.index = 0;
        self.nblocks += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(kind = T::NAME, blocks = self.nblocks, "new cell block");
    }

    /// Set the mark of the cell at `addr`. Returns false if it was already
    /// marked.
    ///
    /// # Safety
    ///
    /// `addr` must be a cell of some `CellSpace<T>`.
    #[inline]
    pub(crate) unsafe fn set_mark(addr: usize) -> bool {
        let block = block_of(addr) as *mut BlockHeader;
        let i = Self::index_of(addr);
        // SAFETY: the caller guarantees `block` is one of our blocks.
        let word = unsafe { &mut (*block).marks[i / 64] };
        let bit = 1u64 << (i % 64);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        true
    }

    /// # Safety
    ///
    /// `addr` must be a cell of some `CellSpace<T>`.
    #[inline]
    pub(crate) unsafe fn is_marked(addr: usize) -> bool {
        let block = block_of(addr) as *const BlockHeader;
        let i = Self::index_of(addr);
        // SAFETY: the caller guarantees `block` is one of our blocks.
        unsafe { (*block).marks[i / 64] & (1 << (i % 64)) != 0 }
    }

    /// Is `addr` exactly a live cell of the block starting at `block`?
    pub(crate) fn is_live(&self, block: usize, addr: usize) -> bool {
        if addr < block + Self::CELLS_OFFSET {
            return false;
        }
        let offset = addr - block - Self::CELLS_OFFSET;
        if offset % Self::SLOT_SIZE != 0 {
            return false;
        }
        let i = offset / Self::SLOT_SIZE;
        if i >= Self::CELLS_PER_BLOCK || (block == self.blocks as usize && i >= self.index) {
            return false;
        }
        // SAFETY: `i` is a used cell inside the block.
        matches!(unsafe { &*(addr as *const Slot<T>) }, Slot::Live(_))
    }

    /// Clear every mark without freeing anything.
    pub(crate) fn clear_marks(&mut self) {
        let mut block = self.blocks;
        while !block.is_null() {
            // SAFETY: `block` is one of our blocks.
            unsafe {
                (*block).marks = [0; MARK_WORDS];
                block = (*block).next;
            }
        }
    }

    /// Free every unmarked cell and clear the marks of the rest.
    ///
    /// `reclaim` sees each dying object just before it is dropped. A block
    /// whose cells are all free is returned to the system once more than
    /// `retain` blocks' worth of free cells have been kept.
    pub(crate) fn sweep(
        &mut self,
        mem: &mut SystemMemory,
        retain: usize,
        mut reclaim: impl FnMut(*mut Slot<T>, &mut T),
    ) -> SweepCounts {
        let _input = BlockInput::new();
        let mut counts = SweepCounts::default();
        let mut free_list: *mut Slot<T> = ptr::null_mut();
        let mut lim = self.index;
        let mut link: *mut *mut BlockHeader = &raw mut self.blocks;
        // SAFETY: `link` always points at the field holding `block`.
        let mut block = unsafe { *link };

        while !block.is_null() {
            let chain_before = free_list;
            let mut this_free = 0;
            for i in 0..lim {
                let slot = Self::cell_at(block, i);
                let word = i / 64;
                let bit = 1u64 << (i % 64);
                // SAFETY: `block` is ours and cells below `lim` are initialized.
                unsafe {
                    if (*block).marks[word] & bit != 0 {
                        (*block).marks[word] &= !bit;
                        counts.in_use += 1;
                        continue;
                    }
                    if let Slot::Live(value) = &mut *slot {
                        reclaim(slot, value);
                    }
                    *slot = Slot::Free(free_list);
                }
                free_list = slot;
                this_free += 1;
            }
            // SAFETY: `block` is ours.
            let next = unsafe { (*block).next };

            if this_free == Self::CELLS_PER_BLOCK
                && counts.free > retain * Self::CELLS_PER_BLOCK
            {
                free_list = chain_before;
                if block == self.blocks {
                    self.index = Self::CELLS_PER_BLOCK;
                }
                // SAFETY: unlink, then give back a block nothing points into.
                unsafe {
                    *link = next;
                    mem.lisp_free(NonNull::new_unchecked(block.cast()), BLOCK_LAYOUT);
                }
                self.nblocks -= 1;
                counts.blocks_freed += 1;
            } else {
                counts.free += this_free;
                // SAFETY: `block` stays in the chain.
                link = unsafe { &raw mut (*block).next };
            }
            lim = Self::CELLS_PER_BLOCK;
            block = next;
        }

        self.free_list = free_list;
        self.in_use = counts.in_use;
        self.free = counts.free;
        counts
    }

    /// Drop every live object and give all blocks back.
    pub(crate) fn release_all(&mut self, mem: &mut SystemMemory) {
        let mut lim = self.index;
        let mut block = self.blocks;
        while !block.is_null() {
            for i in 0..lim {
                let slot = Self::cell_at(block, i);
                // SAFETY: cells below `lim` are initialized.
                unsafe { ptr::drop_in_place(slot) };
            }
            // SAFETY: `block` is ours and is not touched after being freed.
            unsafe {
                let next = (*block).next;
                mem.lisp_free(NonNull::new_unchecked(block.cast()), BLOCK_LAYOUT);
                block = next;
            }
            lim = Self::CELLS_PER_BLOCK;
        }
        self.blocks = ptr::null_mut();
        self.free_list = ptr::null_mut();
        self.index = 0;
        self.nblocks = 0;
        self.in_use = 0;
        self.free = 0;
    }

    pub(crate) const fn in_use(&self) -> usize {
        self.in_use
    }

    pub(crate) const fn free(&self) -> usize {
        self.free
    }

    pub(crate) const fn block_count(&self) -> usize {
        self.nblocks
    }
}

/// The object in a cell known to be live.
///
/// # Safety
///
/// `addr` must be the address of an initialized `Slot<T>` that outlives `'a`,
/// with no other reference to it in use.
#[inline]
pub(crate) unsafe fn cell_mut<'a, T>(addr: usize) -> &'a mut T {
    // SAFETY: forwarded from the caller.
    match unsafe { &mut *(addr as *mut Slot<T>) } {
        Slot::Live(value) => value,
        Slot::Free(_) => panic!("reference to a freed cell at {addr:#x}"),
    }
}

/// Shared form of [`cell_mut`].
///
/// # Safety
///
/// As for [`cell_mut`], minus the exclusivity.
#[inline]
pub(crate) unsafe fn cell_ref<'a, T>(addr: usize) -> &'a T {
    // SAFETY: forwarded from the caller.
    match unsafe { &*(addr as *const Slot<T>) } {
        Slot::Live(value) => value,
        Slot::Free(_) => panic!("reference to a freed cell at {addr:#x}"),
    }
}
