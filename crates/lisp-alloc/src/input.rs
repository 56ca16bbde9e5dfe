//! Blocking asynchronous input around allocator critical sections.
//!
//! Free lists and the address classifier are updated in short critical
//! sections. A signal handler that runs in the middle of one must not see a
//! half-linked list, so while input is blocked a signal is only recorded,
//! and its handler runs when the outermost [`BlockInput`] guard is dropped.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    /// Depth of nested `BlockInput` guards on this thread.
    static INTERRUPT_INPUT_BLOCKED: Cell<usize> = const { Cell::new(0) };
    /// A signal arrived while input was blocked.
    static PENDING_SIGNALS: Cell<bool> = const { Cell::new(false) };
    /// Handler run for pending signals.
    static SIGNAL_HANDLER: Cell<Option<fn()>> = const { Cell::new(None) };
}

/// Scoped guard that blocks input until dropped.
///
/// Guards nest. Dropping the outermost one runs the handler for any signal
/// that arrived in between. The guard is not `Send`: it is tied to the
/// thread whose input it blocks.
pub struct BlockInput {
    _not_send: PhantomData<*const ()>,
}

impl BlockInput {
    /// Block input on this thread.
    #[must_use]
    pub fn new() -> Self {
        INTERRUPT_INPUT_BLOCKED.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for BlockInput {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockInput {
    fn drop(&mut self) {
        let depth = INTERRUPT_INPUT_BLOCKED.with(|depth| {
            let d = depth.get() - 1;
            depth.set(d);
            d
        });
        if depth == 0 && PENDING_SIGNALS.with(|p| p.replace(false)) {
            run_handler();
        }
    }
}

/// True while a [`BlockInput`] guard is alive on this thread.
#[must_use]
pub fn input_blocked_p() -> bool {
    INTERRUPT_INPUT_BLOCKED.with(Cell::get) > 0
}

/// Install the handler run for signals, replacing any previous one.
pub fn set_signal_handler(handler: fn()) {
    SIGNAL_HANDLER.with(|h| h.set(Some(handler)));
}

/// Deliver a signal: run the handler now, or defer it while input is
/// blocked.
pub fn deliver_signal() {
    if input_blocked_p() {
        PENDING_SIGNALS.with(|p| p.set(true));
    } else {
        run_handler();
    }
}

/// True if a deferred signal is waiting for input to be unblocked.
#[must_use]
pub fn pending_signals() -> bool {
    PENDING_SIGNALS.with(Cell::get)
}

fn run_handler() {
    if let Some(handler) = SIGNAL_HANDLER.with(Cell::get) {
        handler();
    }
}
