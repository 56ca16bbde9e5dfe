//! Block allocators and a mark-sweep collector for Lisp objects.
//!
//! `lisp-alloc` manages the memory of a Lisp interpreter: pairs, symbols,
//! strings, floats, vectors and pseudovectors, markers and overlays, and
//! buffers. Fixed-size objects live in aligned blocks with mark bitmaps;
//! vectors are carved out of shared blocks by size class; strings keep their
//! bytes in compacting string blocks. A non-moving mark-sweep collector
//! reclaims whatever is not reachable from the roots.
//!
//! # Quick Start
//!
//! ```
//! use lisp_alloc::{Heap, HeapConfig, NIL};
//!
//! let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
//! let foo = heap.make_string("foo").unwrap();
//! let bar = heap.make_string("bar").unwrap();
//! let pair = heap.allocate_pair(foo, bar);
//!
//! heap.protect(pair);
//! let metrics = heap.collect_garbage();
//! assert_eq!(metrics.heap.pairs.in_use, 1);
//! assert_eq!(heap.string_bytes(heap.cdr(pair).unwrap()).unwrap(), b"bar");
//! ```
//!
//! # Roots
//!
//! A collection marks everything reachable from:
//!
//! - cells registered with [`Heap::register_static_root`],
//! - references protected with [`Heap::protect`] or inside
//!   [`Heap::with_root_scope`],
//! - the dynamic binding stack ([`Heap::specbind`]),
//! - the obarray and the special buffers,
//! - with [`HeapConfig::scan_stack`] on, any word on the native stack that
//!   looks like a reference to a live object.
//!
//! # When collection runs
//!
//! Allocation never collects. Call [`Heap::collect_garbage`] explicitly, or
//! [`Heap::maybe_gc`] at safepoints: it collects once the bytes consed since
//! the last collection reach [`Heap::gc_threshold`].
//!
//! # Running out of memory
//!
//! Oversized requests come back as [`Error`]s. Running out of memory unwinds
//! with a [`MemoryExhausted`] payload after releasing a spare reserve; see
//! [`Heap::memory_full_p`].
//!
//! # Thread Safety
//!
//! A [`Heap`] is `!Send` and `!Sync`. It belongs to the thread that made
//! it, and the native stack scanned is that thread's.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

mod chartab;
mod config;
mod error;
mod gc;
mod hashtab;
mod heap;
mod mem_tree;
mod memory;
mod metrics;
mod obarray;
mod object;
mod roots;
mod scan;
mod space;
mod stack;
mod tracing;

/// Blocking asynchronous input around critical sections.
pub mod input;

pub use chartab::{CHAR_TABLE_EXTRA_SLOTS_MAX, MAX_CHAR};
pub use config::{
    HeapConfig, DEFAULT_PURE_SIZE, GC_DEFAULT_PERCENTAGE, GC_DEFAULT_THRESHOLD, WORD_SIZE,
};
pub use error::{Error, MemoryExhausted, Result};
pub use hashtab::{Weakness, DEFAULT_HASH_SIZE};
pub use heap::Heap;
pub use mem_tree::{MemEntry, MemTree, MemType};
pub use memory::SPARE_MEMORY;
pub use metrics::{global_metrics, GcMetrics, GlobalMetrics, HeapStats, KindStats};
pub use obarray::OBARRAY_SIZE;
pub use object::{
    LispObject, LispType, GCALIGNMENT, GCTYPEBITS, MOST_NEGATIVE_FIXNUM, MOST_POSITIVE_FIXNUM,
    NIL, T, UNBOUND,
};
pub use scan::Validity;
pub use space::block::BLOCK_BYTES;
pub use space::string::{LARGE_STRING_BYTES, SBLOCK_SIZE, STRING_BYTES_BOUND};
pub use space::vector::{
    PvecType, PSEUDOVECTOR_REST_MAX, PSEUDOVECTOR_SIZE_MAX, VBLOCK_BYTES_MAX, VBLOCK_BYTES_MIN,
    VECTOR_ELTS_MAX,
};
pub use stack::{get_stack_bounds, StackBounds};
pub use crate::tracing::GcId;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use crate::{Heap, LispObject, MemEntry};

    /// Every range registered with the address classifier, in address
    /// order.
    #[must_use]
    pub fn mem_entries(heap: &Heap) -> Vec<MemEntry> {
        heap.mem.tree.entries()
    }

    /// Does `obj` denote a live object of its block, as conservative
    /// scanning would judge it?
    #[must_use]
    pub fn is_live_object(heap: &Heap, obj: LispObject) -> bool {
        heap.conservative_candidate(obj.bits()) == Some(obj)
    }

    /// Blocks of pairs currently held.
    #[must_use]
    pub fn pair_blocks(heap: &Heap) -> usize {
        heap.conses.block_count()
    }
}
