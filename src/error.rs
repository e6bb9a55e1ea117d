//! Error types for the deferred heap.

use thiserror::Error;

/// Failures of the raw storage layer.
///
/// Programming errors (double registration, marking unallocated memory,
/// deallocating a non-start address) are not represented here: they are
/// invariant violations and panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Degenerate layout request: zero-sized page, non-power-of-two
    /// alignment, or an overflowing size computation.
    #[error("bad allocation request")]
    BadRequest,

    /// The backing storage refused to grant a new page.
    #[error("out of memory")]
    Oom,
}
