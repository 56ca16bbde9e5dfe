//! Error types.
//!
//! Only requests that can be rejected before any memory is touched come back
//! as [`Error`]. Running out of memory unwinds with [`MemoryExhausted`]
//! instead, because no caller can make progress without the memory.

use std::fmt;

use crate::object::LispType;

/// A recoverable error from the allocation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A string byte count exceeds what a string header can describe.
    StringTooLong {
        /// Bytes requested.
        requested: usize,
    },
    /// A vector slot count exceeds what a vector header can describe.
    VectorTooLarge {
        /// Slots requested.
        requested: usize,
    },
    /// Pseudovector sizes that do not fit the header's size fields.
    InvalidPseudovector {
        /// Slots the collector should trace.
        traced: usize,
        /// Total slots, traced and opaque.
        total: usize,
    },
    /// An object of the wrong kind was passed to an accessor.
    WrongType {
        /// What the accessor needed.
        expected: &'static str,
        /// The kind it got.
        found: LispType,
    },
    /// An index past the end of a vector, string or char-table.
    OutOfRange {
        /// The index given.
        index: usize,
        /// The valid length.
        len: usize,
    },
    /// Attempt to modify a pure object or builtin symbol.
    ImmutableObject,
    /// Aliasing would make a symbol an alias of itself.
    CyclicAlias,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StringTooLong { requested } => {
                write!(f, "maximum string size exceeded ({requested} bytes requested)")
            }
            Self::VectorTooLarge { requested } => {
                write!(f, "maximum vector size exceeded ({requested} slots requested)")
            }
            Self::InvalidPseudovector { traced, total } => {
                write!(f, "invalid pseudovector size: {traced} traced of {total} slots")
            }
            Self::WrongType { expected, found } => {
                write!(f, "wrong type argument: expected {expected}, got {found:?}")
            }
            Self::OutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            Self::ImmutableObject => f.write_str("attempt to modify a read-only object"),
            Self::CyclicAlias => f.write_str("cyclic variable aliasing"),
        }
    }
}

impl std::error::Error for Error {}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Panic payload raised when the heap runs out of memory.
///
/// The first exhaustion releases the spare reserve before unwinding, so a
/// caller that catches this has some room to report the failure and drop
/// data. See [`crate::Heap::spare_memory_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryExhausted {
    /// Size of the request that failed.
    pub requested: usize,
}

impl fmt::Display for MemoryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory exhausted ({} bytes requested)", self.requested)
    }
}

impl std::error::Error for MemoryExhausted {}

pub(crate) const fn wrong_type(expected: &'static str, found: LispType) -> Error {
    Error::WrongType { expected, found }
}
