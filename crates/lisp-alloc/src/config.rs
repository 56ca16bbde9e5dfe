//! Heap configuration.

use std::env;
use std::str::FromStr;

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Default number of bytes consed between automatic collections.
pub const GC_DEFAULT_THRESHOLD: usize = 100_000 * WORD_SIZE;

/// Default share of live bytes that must be consed before the next
/// automatic collection.
pub const GC_DEFAULT_PERCENTAGE: f64 = 0.1;

/// Default size of pure space.
pub const DEFAULT_PURE_SIZE: usize = 256 * 1024;

/// Configuration for a [`crate::Heap`].
///
/// Built with chained setters:
///
/// ```
/// use lisp_alloc::HeapConfig;
///
/// let config = HeapConfig::new()
///     .gc_cons_threshold(1 << 20)
///     .gc_cons_percentage(0.2)
///     .scan_stack(false);
/// assert_eq!(config.threshold(), 1 << 20);
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    pub(crate) gc_cons_threshold: usize,
    pub(crate) gc_cons_percentage: f64,
    pub(crate) scan_stack: bool,
    pub(crate) memory_limit: Option<usize>,
    pub(crate) retained_free_blocks: usize,
    pub(crate) pure_size: usize,
    pub(crate) mark_loop_halt: Option<usize>,
}

impl HeapConfig {
    /// The default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gc_cons_threshold: GC_DEFAULT_THRESHOLD,
            gc_cons_percentage: GC_DEFAULT_PERCENTAGE,
            scan_stack: true,
            memory_limit: None,
            retained_free_blocks: 1,
            pure_size: DEFAULT_PURE_SIZE,
            mark_loop_halt: None,
        }
    }

    /// Read overrides from the environment, falling back to defaults.
    ///
    /// Recognized variables: `LISP_ALLOC_GC_CONS_THRESHOLD`,
    /// `LISP_ALLOC_GC_CONS_PERCENTAGE`, `LISP_ALLOC_SCAN_STACK` (`0` or
    /// `false` disables scanning) and `LISP_ALLOC_MEMORY_LIMIT`. Values that
    /// fail to parse are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(threshold) = env_value("LISP_ALLOC_GC_CONS_THRESHOLD") {
            config.gc_cons_threshold = threshold;
        }
        if let Some(percentage) = env_value("LISP_ALLOC_GC_CONS_PERCENTAGE") {
            config.gc_cons_percentage = percentage;
        }
        if let Ok(scan) = env::var("LISP_ALLOC_SCAN_STACK") {
            config.scan_stack = !matches!(scan.trim(), "0" | "false" | "no");
        }
        if let Some(limit) = env_value("LISP_ALLOC_MEMORY_LIMIT") {
            config.memory_limit = Some(limit);
        }
        config
    }

    /// Minimum bytes consed between automatic collections.
    #[must_use]
    pub const fn gc_cons_threshold(mut self, bytes: usize) -> Self {
        self.gc_cons_threshold = bytes;
        self
    }

    /// Share of the live bytes after a collection that must be consed
    /// before the next automatic one.
    #[must_use]
    pub const fn gc_cons_percentage(mut self, percentage: f64) -> Self {
        self.gc_cons_percentage = percentage;
        self
    }

    /// Whether collections scan the native stack for references.
    #[must_use]
    pub const fn scan_stack(mut self, scan: bool) -> Self {
        self.scan_stack = scan;
        self
    }

    /// Cap the bytes obtained from the system for Lisp data. Requests past
    /// the cap fail as if the system allocator had failed.
    #[must_use]
    pub const fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Blocks' worth of free cells kept before wholly free cell blocks are
    /// returned to the system.
    #[must_use]
    pub const fn retained_free_blocks(mut self, blocks: usize) -> Self {
        self.retained_free_blocks = blocks;
        self
    }

    /// Bytes of pure space. Zero disables pure space.
    #[must_use]
    pub const fn pure_size(mut self, bytes: usize) -> Self {
        self.pure_size = bytes;
        self
    }

    /// Panic after this many consecutive pair links are traced from one
    /// object. Meant for chasing corrupted or runaway lists.
    #[must_use]
    pub const fn mark_loop_halt(mut self, links: usize) -> Self {
        self.mark_loop_halt = Some(links);
        self
    }

    /// The configured minimum threshold.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.gc_cons_threshold
    }

    /// The configured percentage.
    #[must_use]
    pub const fn percentage(&self) -> f64 {
        self.gc_cons_percentage
    }

    /// Whether the native stack is scanned.
    #[must_use]
    pub const fn scans_stack(&self) -> bool {
        self.scan_stack
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.trim().parse().ok()
}
