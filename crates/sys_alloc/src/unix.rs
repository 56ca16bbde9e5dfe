use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: sysconf has no preconditions.
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Map `len` bytes of private anonymous memory.
///
/// # Safety
///
/// `len` must be a non-zero multiple of the page size.
pub unsafe fn map_anon(len: usize, populate: bool) -> io::Result<*mut u8> {
    let populate = if populate { MAP_POPULATE } else { 0 };
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | populate;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    // SAFETY: a null hint lets the kernel pick a free range.
    let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(ptr.cast())
}

/// Unmap a range returned by [`map_anon`].
///
/// # Safety
///
/// `ptr` and `len` must describe a mapping created by [`map_anon`] that is
/// no longer referenced.
pub unsafe fn unmap(ptr: *mut u8, len: usize) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        libc::munmap(ptr.cast(), len);
    }
}
