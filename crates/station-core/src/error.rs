//! Error types shared by the core value types.
//!
//! These are all programming or configuration errors: correct callers never
//! see them at run time, which is why none of them carries recovery data.

use thiserror::Error;

/// Errors raised by [`SparseSet`](crate::SparseSet) mutation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseSetError {
    /// A range was given with `begin >= end`.
    #[error("Invalid range [{begin}..{end}): begin must be smaller than end")]
    InvalidRange {
        /// Requested first element
        begin: u64,
        /// Requested end (exclusive)
        end: u64,
    },

    /// The set holds more ranges than the marshalling target can store.
    #[error("Sparse set with {ranges} ranges does not fit in {capacity} slots")]
    CapacityExceeded {
        /// Number of ranges in the set
        ranges: usize,
        /// Number of ranges the target can hold
        capacity: usize,
    },

    /// A marshalled buffer did not describe a valid set.
    #[error("Corrupt marshalled sparse set: {0}")]
    Corrupt(&'static str),
}

/// Errors raised by [`TimeStamp`](crate::TimeStamp) arithmetic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeError {
    /// Adding a delta left the representable range.
    #[error("Timestamp overflow: {count} + {delta}")]
    Overflow {
        /// Starting sample count
        count: i64,
        /// Delta that was added
        delta: i64,
    },
}

/// Invalid station or buffer geometry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// Sample width other than 4, 8 or 16 bits.
    #[error("Unsupported sample width: {0} bits (expected 4, 8 or 16)")]
    UnsupportedBitMode(u32),

    /// Station clock other than 160 or 200 MHz.
    #[error("Unsupported station clock: {0} Hz (expected 160 or 200 MHz)")]
    UnsupportedClock(u32),

    /// A geometry field was zero or out of range.
    #[error("Invalid buffer settings: {0}")]
    Invalid(String),
}
