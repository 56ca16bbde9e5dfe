//! The sweep phase.

use crate::heap::Heap;
use crate::space::misc::{unchain_marker, Misc};

/// Objects left after a sweep, per kind.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SweepSummary {
    pub(crate) pairs: usize,
    pub(crate) floats: usize,
    pub(crate) symbols: usize,
    pub(crate) misc: usize,
    pub(crate) strings: usize,
    pub(crate) vectors: usize,
    pub(crate) buffers: usize,
    pub(crate) blocks_freed: usize,
}

impl Heap {
    /// Free everything left unmarked and clear every mark.
    ///
    /// Strings go first so compaction runs before anything else reuses
    /// headers. Misc cells go before buffers: a dying marker must be
    /// unchained while its buffer is still allocated.
    pub(crate) fn sweep(&mut self) -> SweepSummary {
        let retain = self.config.retained_free_blocks;
        let mut summary = SweepSummary::default();

        let strings = self.strings.sweep(&mut self.mem, retain);
        summary.strings = strings.in_use;
        summary.blocks_freed += strings.blocks_freed;

        let pairs = self.conses.sweep(&mut self.mem, retain, |_, _| {});
        summary.pairs = pairs.in_use;
        summary.blocks_freed += pairs.blocks_freed;

        let floats = self.floats.sweep(&mut self.mem, retain, |_, _| {});
        summary.floats = floats.in_use;
        summary.blocks_freed += floats.blocks_freed;

        let symbols = self.symbols.sweep(&mut self.mem, retain, |_, _| {});
        summary.symbols = symbols.in_use;
        summary.blocks_freed += symbols.blocks_freed;

        let misc = self.miscs.sweep(&mut self.mem, retain, |slot, misc| {
            if matches!(misc, Misc::Marker(_)) {
                // SAFETY: the slot still holds the live marker; its buffer is
                // swept later, and earlier dead markers are already off the
                // chain.
                unsafe { unchain_marker(slot) };
            }
        });
        summary.misc = misc.in_use;
        summary.blocks_freed += misc.blocks_freed;

        summary.buffers = self.buffers.sweep(&mut self.mem);
        summary.vectors = self.vectors.sweep(&mut self.mem).vectors;
        summary
    }
}
