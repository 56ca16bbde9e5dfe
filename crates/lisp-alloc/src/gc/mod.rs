//! The mark-sweep collector.
//!
//! - `mark`: the worklist visitor and per-kind tracing rules
//! - `weak`: undo-list filtering and weak hash tables, settled after marking
//! - `sweep`: freeing unmarked objects kind by kind
//! - `collect`: the collection entry point and the automatic trigger

mod collect;
mod mark;
mod sweep;
mod weak;

pub(crate) use collect::GcState;
