//! Collection tracing support.
//!
//! With the `tracing` feature, every collection runs inside a `gc_collect`
//! span carrying its [`GcId`], with one nested `gc_phase` span per phase.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one collection, unique within the process and increasing
/// from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcId(pub u64);

static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

/// Take the next collection id.
pub(crate) fn next_gc_id() -> GcId {
    GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
}

/// Phases of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcPhase {
    /// Marking from the roots.
    Mark,
    /// Undo-list filtering and weak hash tables.
    Weak,
    /// Freeing unmarked objects.
    Sweep,
}

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use tracing::{span, Level};

    use super::{GcId, GcPhase};

    /// Span for a whole collection.
    pub(crate) fn trace_gc_collection(gc_id: GcId, bytes_consed: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", gc_id = gc_id.0, bytes_consed).entered()
    }

    /// Span for one phase.
    pub(crate) fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    pub(crate) fn log_phase_start(phase: GcPhase, bytes_before: usize) {
        tracing::debug!(phase = ?phase, bytes_before, "phase_start");
    }

    pub(crate) fn log_phase_end_mark(phase: GcPhase, objects_marked: usize) {
        tracing::debug!(phase = ?phase, objects_marked, "phase_end");
    }

    pub(crate) fn log_phase_end(phase: GcPhase, bytes_after: usize) {
        tracing::debug!(phase = ?phase, bytes_after, "phase_end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase() {
        let a = next_gc_id();
        let b = next_gc_id();
        assert!(b > a);
        assert!(a.0 >= 1);
    }
}
