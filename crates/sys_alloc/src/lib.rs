//! System memory primitives for the Lisp heap.
//!
//! There are two ways to get memory from the operating system here:
//!
//! - [`allocate`] / [`deallocate`] hand out blocks with a caller-chosen
//!   alignment. Small requests go through the global allocator, big ones are
//!   mapped directly so that returning them gives the pages back at once.
//! - [`MmapOptions`] creates a long-lived anonymous region owned by an
//!   [`Mmap`] handle, unmapped on drop.

use std::alloc::Layout;
use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

pub use os::page_size;

/// Requests of at least this many bytes are served by `mmap`.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

fn uses_mmap(layout: Layout) -> bool {
    layout.size() >= MMAP_THRESHOLD && layout.align() <= page_size()
}

fn mapped_len(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// Obtain a block of memory for `layout`.
///
/// Returns `None` when the system refuses the request or when `layout` has
/// a zero size. The contents of the block are unspecified.
#[must_use]
pub fn allocate(layout: Layout) -> Option<NonNull<u8>> {
    if layout.size() == 0 {
        return None;
    }
    if uses_mmap(layout) {
        // SAFETY: a private anonymous mapping with no address hint does not
        // alias any existing memory.
        let ptr = unsafe { os::map_anon(mapped_len(layout.size()), false) }.ok()?;
        return NonNull::new(ptr);
    }
    // SAFETY: `layout` has a non-zero size.
    NonNull::new(unsafe { std::alloc::alloc(layout) })
}

/// Return a block obtained from [`allocate`].
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate`] for exactly this `layout`
/// and must not be used or released again afterwards.
pub unsafe fn deallocate(ptr: NonNull<u8>, layout: Layout) {
    if uses_mmap(layout) {
        // SAFETY: the caller guarantees this range came from `map_anon` with
        // the same rounded length.
        unsafe { os::unmap(ptr.as_ptr(), mapped_len(layout.size())) };
    } else {
        // SAFETY: the caller guarantees `ptr` came from the global allocator
        // with this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// A handle to an anonymous memory mapped region.
///
/// The region is unmapped when this handle is dropped. Fresh mappings are
/// zero-filled by the kernel.
pub struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    #[must_use]
    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty. Mappings are never empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if `addr` falls inside the mapping.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        addr >= start && addr < start + self.len
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a live mapping created by `map_anon`.
        unsafe { os::unmap(self.ptr.as_ptr(), self.len) };
    }
}

/// Configuration for creating an anonymous mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    populate: bool,
}

impl MmapOptions {
    /// Creates options with a zero length. A length must be set before
    /// mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
        }
    }

    /// Sets the length of the mapping in bytes. It is rounded up to whole
    /// pages when mapped.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets whether to prefault the page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Creates the anonymous mapping.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidInput` for a zero length, or with the OS error when
    /// `mmap` refuses.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let len = mapped_len(self.len);
        // SAFETY: no address hint, so the mapping cannot clobber anything.
        let ptr = unsafe { os::map_anon(len, self.populate)? };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Mmap { ptr, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocate_aligned_block() {
        let layout = Layout::from_size_align(4096, 4096).unwrap();
        let block = allocate(layout).expect("allocation failed");
        assert_eq!(block.as_ptr() as usize % 4096, 0);
        unsafe {
            ptr::write_volatile(block.as_ptr().add(4095), 7);
            assert_eq!(ptr::read_volatile(block.as_ptr().add(4095)), 7);
            deallocate(block, layout);
        }
    }

    #[test]
    fn test_allocate_large_block_is_mapped() {
        let layout = Layout::from_size_align(MMAP_THRESHOLD + 10, 8).unwrap();
        assert!(uses_mmap(layout));
        let block = allocate(layout).expect("allocation failed");
        assert_eq!(block.as_ptr() as usize % page_size(), 0);
        unsafe {
            ptr::write_volatile(block.as_ptr().add(MMAP_THRESHOLD + 9), 42);
            assert_eq!(ptr::read_volatile(block.as_ptr().add(MMAP_THRESHOLD + 9)), 42);
            deallocate(block, layout);
        }
    }

    #[test]
    fn test_zero_size_request_is_refused() {
        let layout = Layout::from_size_align(0, 8).unwrap();
        assert!(allocate(layout).is_none());
    }

    #[test]
    fn test_basic_map() {
        let len = page_size() + 1;
        let mmap = MmapOptions::new().len(len).map_anon().expect("failed to map");
        assert_eq!(mmap.len(), 2 * page_size());
        assert!(mmap.contains(mmap.ptr() as usize));
        assert!(!mmap.contains(mmap.ptr() as usize + mmap.len()));

        unsafe {
            assert_eq!(ptr::read_volatile(mmap.ptr()), 0, "fresh mappings are zeroed");
            ptr::write_volatile(mmap.ptr(), 42);
            assert_eq!(ptr::read_volatile(mmap.ptr()), 42);
        }
    }

    #[test]
    fn test_zero_length_map_fails() {
        let err = MmapOptions::new().map_anon().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
