//! Running a collection, and deciding when to run one.

use std::mem::size_of;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::time::Instant;

use super::mark::GcVisitor;
use crate::config::GC_DEFAULT_THRESHOLD;
use crate::heap::Heap;
use crate::input::BlockInput;
use crate::metrics::{global_metrics, GcMetrics, PhaseTimer};
use crate::object::{LispObject, LispType};
use crate::space::pair::ConsSpace;
use crate::stack::spill_registers_and_scan;
#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_phase_end, log_phase_end_mark, log_phase_start, trace_gc_collection, trace_phase,
};
#[cfg(feature = "tracing")]
use crate::tracing::GcPhase;
use crate::tracing::next_gc_id;

/// Where the collector is. Always back to `Idle` when a collection returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcState {
    Idle,
    Marking,
    Sweeping,
}

/// Consing that triggers a collection while memory is full.
const MEMORY_FULL_CONS_THRESHOLD: usize = ConsSpace::CELLS_PER_BLOCK * ConsSpace::SLOT_SIZE;

impl Heap {
    /// Collect garbage now.
    ///
    /// Marks everything reachable from the roots (registered statics, the
    /// shadow stack, dynamic bindings, the obarray, the special buffers and,
    /// unless disabled, the native stack), resolves undo lists and weak
    /// tables, then sweeps every kind of object.
    ///
    /// # Panics
    ///
    /// If called while a collection is already running.
    pub fn collect_garbage(&mut self) -> GcMetrics {
        assert!(
            self.gc_state == GcState::Idle,
            "garbage collection re-entered"
        );
        let _input = BlockInput::new();
        match catch_unwind(AssertUnwindSafe(|| self.run_collection())) {
            Ok(metrics) => metrics,
            Err(payload) => {
                self.abandon_collection();
                resume_unwind(payload)
            }
        }
    }

    /// Put the collector back to idle after a collection unwound, with no
    /// mark left set.
    fn abandon_collection(&mut self) {
        self.conses.clear_marks();
        self.floats.clear_marks();
        self.symbols.clear_marks();
        self.miscs.clear_marks();
        self.strings.headers.clear_marks();
        self.vectors.clear_marks();
        self.buffers.clear_marks();
        self.gc_state = GcState::Idle;
        #[cfg(feature = "tracing")]
        tracing::warn!(gcs_done = self.gcs_done, "collection abandoned");
    }

    fn run_collection(&mut self) -> GcMetrics {
        let gc_id = next_gc_id();
        let bytes_consed = self.consing_since_gc;
        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection(gc_id, bytes_consed);

        let start = Instant::now();
        #[cfg(feature = "tracing")]
        let before_bytes = self.mem.bytes_in_use();
        let mut timer = PhaseTimer::new();

        self.gc_state = GcState::Marking;
        let _objects_marked = self.mark_phase(&mut timer);

        timer.start();
        let weak_entries_removed = {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::Weak);
            self.sweep_weak_tables()
        };
        timer.end_weak();

        self.gc_state = GcState::Sweeping;
        timer.start();
        let _summary = {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::Sweep);
            #[cfg(feature = "tracing")]
            log_phase_start(GcPhase::Sweep, before_bytes);
            let summary = self.sweep();
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Sweep, self.mem.bytes_in_use());
            summary
        };
        timer.end_sweep();

        self.consing_since_gc = 0;
        self.mem.refill_reserve();
        let heap = self.stats();
        let bytes_live = heap.live_bytes();
        self.gc_relative_threshold = relative_threshold(self.config.gc_cons_percentage, bytes_live);
        self.gcs_done += 1;
        self.gc_state = GcState::Idle;

        let metrics = GcMetrics {
            gc_id: gc_id.0,
            duration: start.elapsed(),
            mark_duration: timer.mark,
            weak_duration: timer.weak,
            sweep_duration: timer.sweep,
            bytes_consed,
            bytes_live,
            next_threshold: self.gc_threshold(),
            weak_entries_removed,
            heap,
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(
            gc_id = gc_id.0,
            bytes_live,
            blocks_freed = _summary.blocks_freed,
            pairs = _summary.pairs,
            vectors = _summary.vectors,
            duration_us = u64::try_from(metrics.duration.as_micros()).unwrap_or(u64::MAX),
            "gc_complete"
        );
        global_metrics().record(&metrics);
        self.last_metrics = Some(metrics);
        metrics
    }

    /// Mark from every root, then settle undo lists and weak tables.
    fn mark_phase(&self, timer: &mut PhaseTimer) -> usize {
        let mut visitor = GcVisitor::new(self);

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::Mark);
            #[cfg(feature = "tracing")]
            log_phase_start(GcPhase::Mark, self.mem.bytes_in_use());
            self.mark_roots(&mut visitor);
            if self.config.scans_stack() {
                let start = std::ptr::from_ref(self) as usize;
                // SAFETY: the heap is only used from the thread that owns it,
                // and candidates are validated before they are marked.
                unsafe {
                    spill_registers_and_scan(start..start + size_of::<Self>(), |word| {
                        visitor.visit_candidate(word);
                    });
                }
            }
            visitor.process_worklist();
            #[cfg(feature = "tracing")]
            log_phase_end_mark(GcPhase::Mark, visitor.objects_marked);
        }
        timer.end_mark();

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::Weak);
            visitor.finish_marking();
        }
        timer.end_weak();
        visitor.objects_marked
    }

    fn mark_roots(&self, visitor: &mut GcVisitor<'_>) {
        self.roots.for_each(|obj| visitor.visit(obj));
        visitor.visit(self.obarray);
        visitor.visit(self.zero_vector);
        visitor.visit(self.empty_unibyte);
        visitor.visit(self.empty_multibyte);
        for name in self.builtin_names {
            visitor.visit(name);
        }
        for special in [self.buffers.defaults, self.buffers.local_symbols] {
            if !special.is_null() {
                visitor.visit(LispObject::from_address(special as usize, LispType::Vectorlike));
            }
        }
    }

    /// Consing that triggers the next automatic collection.
    #[must_use]
    pub fn gc_threshold(&self) -> usize {
        if self.mem.is_memory_full() {
            return MEMORY_FULL_CONS_THRESHOLD;
        }
        self.config
            .gc_cons_threshold
            .max(GC_DEFAULT_THRESHOLD / 10)
            .max(self.gc_relative_threshold)
    }

    /// Bytes allocated since the last collection.
    #[must_use]
    pub const fn consing_since_gc(&self) -> usize {
        self.consing_since_gc
    }

    /// Collections run on this heap.
    #[must_use]
    pub const fn gcs_done(&self) -> usize {
        self.gcs_done
    }

    /// Collect if enough has been consed since the last collection and
    /// collection is not held off. Meant for the evaluator's dispatch loop;
    /// allocation itself never collects.
    pub fn maybe_gc(&mut self) -> Option<GcMetrics> {
        if self.gc_inhibited > 0 || self.gc_state != GcState::Idle {
            return None;
        }
        (self.consing_since_gc >= self.gc_threshold()).then(|| self.collect_garbage())
    }

    /// Run `f` with automatic collection held off. Explicit calls to
    /// [`Heap::collect_garbage`] still collect. Nests.
    pub fn without_gc<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.gc_inhibited += 1;
        let result = catch_unwind(AssertUnwindSafe(|| f(self)));
        self.gc_inhibited -= 1;
        match result {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    }

    /// True while [`Heap::without_gc`] is holding collection off.
    #[must_use]
    pub const fn gc_inhibited(&self) -> bool {
        self.gc_inhibited > 0
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn relative_threshold(percentage: f64, live_bytes: usize) -> usize {
    // Saturates, and NaN gives zero.
    (percentage.max(0.0) * live_bytes as f64) as usize
}
