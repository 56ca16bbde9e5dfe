//! Native stack access for conservative root scanning.
//!
//! Callee-saved registers are spilled into a local array first, so a
//! reference held only in a register is seen along with the stack words.

use std::ops::Range;

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address).
    pub top: usize,
}

/// Stack bounds of the current thread, if the platform reports them.
#[cfg(all(target_os = "linux", not(miri)))]
#[must_use]
pub fn get_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: `attr` is initialized by `pthread_getattr_np` before use and
    // destroyed exactly once.
    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }
        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }
        Some(StackBounds {
            bottom: stackaddr as usize + stacksize,
            top: stackaddr as usize,
        })
    }
}

/// Stack bounds of the current thread, if the platform reports them.
#[cfg(any(not(target_os = "linux"), miri))]
#[must_use]
pub fn get_stack_bounds() -> Option<StackBounds> {
    None
}

/// Spill callee-saved registers, then call `scan` on each of them and on
/// every aligned word between the current stack pointer and the stack
/// bottom, except words stored inside `skip`. Returns false if the stack
/// bounds are unknown, in which case only the registers were scanned.
///
/// # Safety
///
/// Must run on the thread whose stack is scanned. `scan` receives raw
/// words and must treat them as untrusted.
#[inline(never)]
pub unsafe fn spill_registers_and_scan<F>(skip: Range<usize>, mut scan: F) -> bool
where
    F: FnMut(usize),
{
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    let mut regs = [0usize; 6];
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    // SAFETY: only reads registers into locals.
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
        );
    }
    #[cfg(any(not(target_arch = "x86_64"), miri))]
    let regs = [0usize; 32];
    std::hint::black_box(&regs);

    for &r in &regs {
        scan(r);
    }

    let Some(bounds) = get_stack_bounds() else {
        return false;
    };

    // Stacks grow down; a local's address is close enough to the pointer.
    let sp = std::ptr::addr_of!(scan) as usize;
    let mut current = sp & !(std::mem::align_of::<usize>() - 1);
    while current < bounds.bottom {
        if skip.contains(&current) {
            current = skip.end.next_multiple_of(std::mem::align_of::<usize>());
            continue;
        }
        // SAFETY: `current` lies in this thread's mapped stack.
        scan(unsafe { std::ptr::read_volatile(current as *const usize) });
        current += std::mem::size_of::<usize>();
    }
    true
}
