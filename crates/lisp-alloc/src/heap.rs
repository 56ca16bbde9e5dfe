//! The heap: every allocator, the roots, and the collector state in one
//! context object.
//!
//! A `Heap` is tied to the thread that made it. Allocation never collects;
//! collection happens through [`Heap::collect_garbage`] or at the
//! evaluator's safepoints through [`Heap::maybe_gc`].

use std::fmt;
use std::ptr;

use crate::config::HeapConfig;
use crate::gc::GcState;
use crate::hashtab::HashTable;
use crate::memory::SystemMemory;
use crate::metrics::GcMetrics;
use crate::obarray::OBARRAY_SIZE;
use crate::object::{LispObject, LispType, BUILTIN_SYMBOL_NAMES, NIL};
use crate::roots::RootSet;
use crate::space::buffer::BufferSpace;
use crate::space::float::FloatSpace;
use crate::space::misc::MiscSpace;
use crate::space::pair::ConsSpace;
use crate::space::pure::PureSpace;
use crate::space::string::StringSpace;
use crate::space::symbol::{SymbolSpace, CHAIN_END};
use crate::space::vector::{contents, VectorHeader, VectorSpace};

/// All Lisp memory of one program.
///
/// ```
/// use lisp_alloc::{Heap, HeapConfig, NIL};
///
/// let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
/// let s = heap.make_string("foo").unwrap();
/// let pair = heap.allocate_pair(s, NIL);
/// heap.protect(pair);
/// heap.collect_garbage();
/// assert_eq!(heap.string_bytes(heap.car(pair).unwrap()).unwrap(), b"foo");
/// ```
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) mem: SystemMemory,
    pub(crate) conses: ConsSpace,
    pub(crate) floats: FloatSpace,
    pub(crate) symbols: SymbolSpace,
    pub(crate) miscs: MiscSpace,
    pub(crate) strings: StringSpace,
    pub(crate) vectors: VectorSpace,
    pub(crate) buffers: BufferSpace,
    pub(crate) pure: PureSpace,
    pub(crate) roots: RootSet,
    /// Every weak hash table made so far that a collection has not found
    /// dead.
    pub(crate) weak_tables: *mut HashTable,
    pub(crate) obarray: LispObject,
    /// Intern symbol names into pure space.
    pub(crate) purify: bool,
    pub(crate) empty_unibyte: LispObject,
    pub(crate) empty_multibyte: LispObject,
    pub(crate) zero_vector: LispObject,
    /// Name strings of `nil`, `t` and `unbound`.
    pub(crate) builtin_names: [LispObject; 3],
    pub(crate) consing_since_gc: usize,
    /// Share of the last live total that must be consed before collecting.
    pub(crate) gc_relative_threshold: usize,
    pub(crate) gc_inhibited: usize,
    pub(crate) gc_state: GcState,
    pub(crate) gcs_done: usize,
    pub(crate) last_metrics: Option<GcMetrics>,
}

impl Heap {
    /// A heap with the builtin objects in place: the empty strings, the
    /// shared empty vector, the names of the builtin symbols, the obarray
    /// and the two special buffers.
    ///
    /// # Panics
    ///
    /// Unwinds with [`crate::MemoryExhausted`] if the memory limit is too
    /// small to hold the builtin objects.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        let mem = SystemMemory::new(config.memory_limit);
        let pure = PureSpace::new(config.pure_size);
        let mut heap = Self {
            config,
            mem,
            conses: ConsSpace::new(),
            floats: FloatSpace::new(),
            symbols: SymbolSpace::new(),
            miscs: MiscSpace::new(),
            strings: StringSpace::new(),
            vectors: VectorSpace::new(),
            buffers: BufferSpace::new(),
            pure,
            roots: RootSet::new(),
            weak_tables: ptr::null_mut(),
            obarray: NIL,
            purify: false,
            empty_unibyte: NIL,
            empty_multibyte: NIL,
            zero_vector: NIL,
            builtin_names: [NIL; 3],
            consing_since_gc: 0,
            gc_relative_threshold: 0,
            gc_inhibited: 0,
            gc_state: GcState::Idle,
            gcs_done: 0,
            last_metrics: None,
        };
        heap.empty_unibyte = heap.make_pure_string(b"", false).unwrap_or(NIL);
        heap.empty_multibyte = heap.make_pure_string(b"", true).unwrap_or(NIL);
        heap.zero_vector = heap.make_pure_zero_vector();
        for (i, name) in BUILTIN_SYMBOL_NAMES.iter().enumerate() {
            heap.builtin_names[i] = heap.make_pure_string(name.as_bytes(), false).unwrap_or(NIL);
        }
        heap.obarray = heap.make_obarray();
        heap.buffers.init_special(&mut heap.mem);
        heap.consing_since_gc = 0;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            threshold = heap.gc_threshold(),
            scan_stack = heap.config.scans_stack(),
            "heap initialized"
        );
        heap
    }

    fn make_obarray(&mut self) -> LispObject {
        let vector = self.alloc_vectorlike(OBARRAY_SIZE);
        // SAFETY: the allocation spans the header plus every bucket.
        unsafe {
            vector.write(VectorHeader::plain(OBARRAY_SIZE));
            for i in 0..OBARRAY_SIZE {
                contents(vector).add(i).write(CHAIN_END);
            }
        }
        LispObject::from_address(vector as usize, LispType::Vectorlike)
    }

    /// The configuration the heap was made with, as since adjusted.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Set the minimum consing between automatic collections. Takes effect
    /// at once.
    pub fn set_gc_cons_threshold(&mut self, bytes: usize) {
        self.config.gc_cons_threshold = bytes;
    }

    /// Set the share of live bytes consed between automatic collections.
    /// Takes effect when the next collection computes its threshold.
    pub fn set_gc_cons_percentage(&mut self, percentage: f64) {
        self.config.gc_cons_percentage = percentage;
    }

    /// True after memory ran out, until a collection gets the spare
    /// reserve back.
    #[must_use]
    pub const fn memory_full_p(&self) -> bool {
        self.mem.is_memory_full()
    }

    /// True while the spare reserve is held.
    #[must_use]
    pub const fn spare_memory_available(&self) -> bool {
        self.mem.spare_available()
    }

    /// Bytes currently obtained from the system, the reserve included.
    #[must_use]
    pub const fn bytes_from_system(&self) -> usize {
        self.mem.bytes_in_use()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(gcs_done = self.gcs_done, "heap dropped");
        self.miscs.release_all(&mut self.mem);
        self.buffers.release_all(&mut self.mem);
        self.conses.release_all(&mut self.mem);
        self.floats.release_all(&mut self.mem);
        self.symbols.release_all(&mut self.mem);
        self.strings.release_all(&mut self.mem);
        self.vectors.release_all(&mut self.mem);
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("bytes_from_system", &self.mem.bytes_in_use())
            .field("consing_since_gc", &self.consing_since_gc)
            .field("gcs_done", &self.gcs_done)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::T;

    #[test]
    fn builtin_objects_exist_from_the_start() {
        let heap = Heap::new(HeapConfig::new().scan_stack(false));
        assert_eq!(heap.vector_len(heap.zero_vector), Ok(0));
        assert_eq!(heap.vector_len(heap.obarray()), Ok(OBARRAY_SIZE));
        assert_eq!(heap.string_bytes(heap.empty_unibyte).unwrap(), b"");
        assert_eq!(heap.string_multibyte_p(heap.empty_multibyte), Ok(true));
        let name = heap.symbol_name(T).unwrap();
        assert_eq!(heap.string_bytes(name).unwrap(), b"t");
        assert_eq!(heap.consing_since_gc(), 0);
    }

    #[test]
    fn builtins_survive_without_pure_space() {
        let mut heap = Heap::new(HeapConfig::new().scan_stack(false).pure_size(0));
        heap.collect_garbage();
        heap.collect_garbage();
        let name = heap.symbol_name(NIL).unwrap();
        assert_eq!(heap.string_bytes(name).unwrap(), b"nil");
        assert_eq!(heap.vector_len(heap.zero_vector), Ok(0));
        let s = heap.make_string("").unwrap();
        assert_eq!(s, heap.empty_unibyte);
    }

    #[test]
    fn knobs_adjust_the_config() {
        let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
        heap.set_gc_cons_threshold(1 << 24);
        heap.set_gc_cons_percentage(0.5);
        assert_eq!(heap.config().threshold(), 1 << 24);
        assert_eq!(heap.gc_threshold(), 1 << 24);
        assert!((heap.config().percentage() - 0.5).abs() < f64::EPSILON);
        assert!(!heap.memory_full_p());
        assert!(heap.spare_memory_available());
    }
}
