//! Collection metrics and heap statistics.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::config::WORD_SIZE;
use crate::heap::Heap;
use crate::space::buffer::Buffer;
use crate::space::float::FloatSpace;
use crate::space::misc::MiscSpace;
use crate::space::pair::ConsSpace;
use crate::space::string::StringHeaderSpace;
use crate::space::symbol::SymbolSpace;
use crate::space::vector::HEADER_SIZE;
use crate::tracing::GcId;

/// Counts for one kind of object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    /// Bytes per object, not counting variable-size payloads.
    pub cell_size: usize,
    /// Objects in use.
    pub in_use: usize,
    /// Cells on free lists.
    pub free: usize,
}

impl KindStats {
    const fn bytes(&self) -> usize {
        self.cell_size * self.in_use
    }
}

/// A snapshot of how the heap's memory is used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Pairs.
    pub pairs: KindStats,
    /// Heap symbols.
    pub symbols: KindStats,
    /// Markers and overlays.
    pub misc: KindStats,
    /// String headers.
    pub strings: KindStats,
    /// Boxed floats.
    pub floats: KindStats,
    /// Vector-like objects other than buffers; `cell_size` is the header.
    pub vectors: KindStats,
    /// Allocated buffers, killed or not.
    pub buffers: KindStats,
    /// Bytes of live string data.
    pub string_bytes: usize,
    /// Words of vector contents in use.
    pub vector_slots_used: usize,
    /// Words sitting free inside vector blocks.
    pub vector_slots_free: usize,
    /// Pair blocks.
    pub pair_blocks: usize,
    /// Symbol blocks.
    pub symbol_blocks: usize,
    /// Misc blocks.
    pub misc_blocks: usize,
    /// String header blocks.
    pub string_blocks: usize,
    /// Float blocks.
    pub float_blocks: usize,
    /// Shared vector blocks.
    pub vector_blocks: usize,
    /// Vectors allocated on their own.
    pub large_vectors: usize,
    /// String data blocks shared by small strings.
    pub small_sblocks: usize,
    /// String data blocks holding one large string each.
    pub large_sblocks: usize,
    /// Unused room at the end of small sblocks.
    pub string_data_free_bytes: usize,
}

impl HeapStats {
    /// Bytes held by live objects, the quantity collection thresholds scale
    /// with.
    #[must_use]
    pub const fn live_bytes(&self) -> usize {
        self.pairs.bytes()
            + self.symbols.bytes()
            + self.misc.bytes()
            + self.strings.bytes()
            + self.string_bytes
            + self.floats.bytes()
            + self.vectors.bytes()
            + self.vector_slots_used * WORD_SIZE
            + self.buffers.bytes()
    }
}

/// What one collection did.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcMetrics {
    /// Identifier of the collection.
    pub gc_id: u64,
    /// Wall time of the whole collection.
    pub duration: Duration,
    /// Time spent marking from the roots.
    pub mark_duration: Duration,
    /// Time spent on undo lists and weak tables.
    pub weak_duration: Duration,
    /// Time spent sweeping.
    pub sweep_duration: Duration,
    /// Bytes allocated since the previous collection.
    pub bytes_consed: usize,
    /// Bytes live once the collection finished.
    pub bytes_live: usize,
    /// Consing that will trigger the next automatic collection.
    pub next_threshold: usize,
    /// Weak table entries removed.
    pub weak_entries_removed: usize,
    /// Heap usage after the collection.
    pub heap: HeapStats,
}

/// Times the phases of one collection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhaseTimer {
    pub(crate) mark: Duration,
    pub(crate) weak: Duration,
    pub(crate) sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    pub(crate) const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            weak: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    pub(crate) fn end_mark(&mut self) {
        self.mark = self.take();
    }

    /// Weak work comes in two pieces, so this one adds up.
    pub(crate) fn end_weak(&mut self) {
        let elapsed = self.take();
        self.weak += elapsed;
    }

    pub(crate) fn end_sweep(&mut self) {
        self.sweep = self.take();
    }
}

/// Process-wide totals over every heap and collection.
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    bytes_consed: AtomicUsize,
    weak_entries_removed: AtomicUsize,
    pause_ns: AtomicU64,
    last_gc_id: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            bytes_consed: AtomicUsize::new(0),
            weak_entries_removed: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            last_gc_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, metrics: &GcMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.bytes_consed
            .fetch_add(metrics.bytes_consed, Ordering::Relaxed);
        self.weak_entries_removed
            .fetch_add(metrics.weak_entries_removed, Ordering::Relaxed);
        let nanos = u64::try_from(metrics.duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(nanos, Ordering::Relaxed);
        self.last_gc_id.fetch_max(metrics.gc_id, Ordering::Relaxed);
    }

    /// Collections run so far.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Bytes consed before all those collections.
    #[inline]
    #[must_use]
    pub fn total_bytes_consed(&self) -> usize {
        self.bytes_consed.load(Ordering::Relaxed)
    }

    /// Weak table entries removed.
    #[inline]
    #[must_use]
    pub fn total_weak_entries_removed(&self) -> usize {
        self.weak_entries_removed.load(Ordering::Relaxed)
    }

    /// Time spent collecting, in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Highest collection id recorded.
    #[inline]
    #[must_use]
    pub fn last_gc_id(&self) -> GcId {
        GcId(self.last_gc_id.load(Ordering::Relaxed))
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Cumulative metrics for the whole process.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

impl Heap {
    /// Current heap usage. Counts are exact after a collection; between
    /// collections dead objects still count as in use.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let census = self.vectors.census();
        HeapStats {
            pairs: KindStats {
                cell_size: ConsSpace::SLOT_SIZE,
                in_use: self.conses.in_use(),
                free: self.conses.free(),
            },
            symbols: KindStats {
                cell_size: SymbolSpace::SLOT_SIZE,
                in_use: self.symbols.in_use(),
                free: self.symbols.free(),
            },
            misc: KindStats {
                cell_size: MiscSpace::SLOT_SIZE,
                in_use: self.miscs.in_use(),
                free: self.miscs.free(),
            },
            strings: KindStats {
                cell_size: StringHeaderSpace::SLOT_SIZE,
                in_use: self.strings.headers.in_use(),
                free: self.strings.headers.free(),
            },
            floats: KindStats {
                cell_size: FloatSpace::SLOT_SIZE,
                in_use: self.floats.in_use(),
                free: self.floats.free(),
            },
            vectors: KindStats {
                cell_size: HEADER_SIZE,
                in_use: census.vectors,
                free: 0,
            },
            buffers: KindStats {
                cell_size: size_of::<Buffer>(),
                in_use: self.buffers.count(),
                free: 0,
            },
            string_bytes: self.strings.bytes_in_use,
            vector_slots_used: census.slots_used,
            vector_slots_free: census.slots_free,
            pair_blocks: self.conses.block_count(),
            symbol_blocks: self.symbols.block_count(),
            misc_blocks: self.miscs.block_count(),
            string_blocks: self.strings.headers.block_count(),
            float_blocks: self.floats.block_count(),
            vector_blocks: census.blocks,
            large_vectors: census.large,
            small_sblocks: self.strings.data.small_sblocks(),
            large_sblocks: self.strings.data.large_sblocks(),
            string_data_free_bytes: self.strings.data.free_bytes(),
        }
    }

    /// Metrics of the most recent collection, if any ran.
    #[must_use]
    pub const fn last_gc_metrics(&self) -> Option<GcMetrics> {
        self.last_metrics
    }
}
