//! Error types shared across all Spillway crates.

use thiserror::Error;

/// Convenience alias for results produced by Spillway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by buffer transitions and the device allocator.
///
/// All errors are synchronous and local to the call that triggered them.
/// A failed transition never leaves partial state behind: either the move
/// fully completes (including freeing the source side) or the buffer keeps
/// its prior residency with nothing freed.
#[derive(Debug, Error)]
pub enum Error {
    /// A spill was requested on a buffer that must not move: its raw
    /// address has been exposed, it is shared between live owners, or it
    /// is already spilled.
    #[error("unspillable buffer: {reason}")]
    InvalidTransition {
        /// Why the buffer cannot be moved.
        reason: &'static str,
    },

    /// The device allocator could not satisfy an allocation. Fatal to the
    /// requesting transition; there is no fallback tier.
    #[error("device allocation of {requested} bytes failed")]
    ResourceExhaustion {
        /// Size of the allocation that failed, in bytes.
        requested: usize,
    },

    /// An address was handed to the allocator that it does not own.
    #[error("invalid device address: {0:#x}")]
    InvalidAddress(u64),

    /// An internal invariant was broken.
    #[error("internal error: {0}")]
    Internal(String),
}
