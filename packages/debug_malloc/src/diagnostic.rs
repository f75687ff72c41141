use thiserror::Error;

use crate::{CallSite, GuardDamage};

/// A memory bug found by the tracker.
///
/// Diagnostics never interrupt the program. Each one is written as a line of text to the
/// tracker's output and emitted as a `tracing` warning, then the operation that found it
/// carries on as described on each variant.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
#[expect(
    variant_size_differences,
    reason = "corruption details are only built when a bug is found"
)]
pub enum Diagnostic {
    /// The guard bytes around a tracked payload were overwritten, meaning something wrote
    /// outside the payload bounds.
    ///
    /// The site is where the block was allocated, not where the stray write happened. A free
    /// that finds this still releases the block.
    #[error(
        "heap data corrupt near {address:#x} (size {size}, seq #{sequence}): {damage} overwritten, allocated at {site}"
    )]
    CorruptionDetected {
        /// Payload address of the damaged block.
        address: usize,
        /// Payload size of the damaged block.
        size: usize,
        /// Sequence number of the damaged block.
        sequence: u64,
        /// Where the damaged block was allocated.
        site: CallSite,
        /// Which guard was overwritten.
        damage: GuardDamage,
    },

    /// A free referenced an address that the tracker never handed out or already released.
    ///
    /// The address is not passed to the raw allocator.
    #[error("free: invalid pointer {address:#x} (never allocated or already freed)")]
    InvalidOrDoubleFree {
        /// The address passed to free.
        address: usize,
    },

    /// A reallocation referenced an address with no live tracked allocation.
    ///
    /// The request is still forwarded to the raw allocator and the result is untracked.
    #[error("realloc: invalid pointer {address:#x}, forwarding untracked")]
    InvalidRealloc {
        /// The address passed to reallocate.
        address: usize,
    },

    /// A free referenced a block that was handed out while tracking was suspended.
    ///
    /// The block is passed to the raw allocator.
    #[error("free: untracked pointer {address:#x}, forwarding untracked")]
    UntrackedFree {
        /// The address passed to free.
        address: usize,
    },

    /// The use counter was decremented more often than it was incremented.
    ///
    /// The imbalance is not corrected. It is reported on every check until it is resolved.
    #[error("use count imbalance: depth is {depth}, more unuse than use calls")]
    UnmatchedUseCount {
        /// The current (negative) use depth.
        depth: i64,
    },
}
