//! Per-kind allocators.
//!
//! Fixed-size kinds share the block machinery in `block`. Vectors, strings
//! and buffers have allocators of their own, and `pure` holds the read-only
//! arena.

pub(crate) mod block;
pub(crate) mod buffer;
pub(crate) mod float;
pub(crate) mod misc;
pub(crate) mod pair;
pub(crate) mod pure;
pub(crate) mod string;
pub(crate) mod symbol;
pub(crate) mod vector;
