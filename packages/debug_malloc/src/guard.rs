//! Canary bytes written around every tracked payload.
//!
//! A tracked block obtained from the raw allocator is laid out as follows:
//!
//! ```text
//! | front guard | payload (size bytes) | rear guard |
//! ^ block       ^ payload
//! ```
//!
//! The front guard is exactly as large as the alignment the raw allocator guarantees, so the
//! payload keeps that alignment. The rear guard starts right after the last payload byte and is
//! therefore not aligned in general.

use std::fmt;
use std::ptr::{self, NonNull};
use std::slice;

/// Bytes of canary on each side of a payload.
pub(crate) const GUARD_SIZE: usize = 16;

/// Total guard bytes added to each tracked block.
pub(crate) const GUARD_OVERHEAD: usize = GUARD_SIZE * 2;

/// Fill value of both guards.
pub(crate) const GUARD_PATTERN: u8 = 0xFD;

/// Which guard of a tracked block no longer holds the expected pattern.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum GuardDamage {
    /// Bytes immediately before the payload were overwritten (buffer underflow).
    Front,

    /// Bytes immediately after the payload were overwritten (buffer overflow).
    Rear,

    /// Both guards were overwritten.
    Both,
}

impl fmt::Display for GuardDamage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Front => write!(f, "front guard"),
            Self::Rear => write!(f, "rear guard"),
            Self::Both => write!(f, "front and rear guards"),
        }
    }
}

/// Size of the raw block needed to hold a payload of `payload_size` bytes plus its guards.
///
/// Returns `None` if the sum does not fit in `usize`.
#[must_use]
pub(crate) fn block_size(payload_size: usize) -> Option<usize> {
    payload_size.checked_add(GUARD_OVERHEAD)
}

/// Writes both guards into a fresh block and returns the payload pointer.
///
/// # Safety
///
/// `block` must be valid for writes of `block_size(payload_size)` bytes.
pub(crate) unsafe fn arm(block: NonNull<u8>, payload_size: usize) -> NonNull<u8> {
    // SAFETY: The front guard is the first GUARD_SIZE bytes of the block, which the caller
    // guarantees to be writable.
    unsafe {
        ptr::write_bytes(block.as_ptr(), GUARD_PATTERN, GUARD_SIZE);
    }

    // SAFETY: The block is at least GUARD_OVERHEAD bytes, so this stays in bounds.
    let payload = unsafe { block.add(GUARD_SIZE) };

    // SAFETY: Forwarding the caller's guarantee, the rear guard ends at the end of the block.
    unsafe {
        arm_rear(payload, payload_size);
    }

    payload
}

/// Rewrites the rear guard after the payload has been resized in place or moved.
///
/// The front guard travels with the block contents on reallocation, so it needs no rewrite.
///
/// # Safety
///
/// `payload` must have been returned by [`arm`] for a block that is now valid for writes of
/// `block_size(payload_size)` bytes.
pub(crate) unsafe fn arm_rear(payload: NonNull<u8>, payload_size: usize) {
    // SAFETY: The rear guard starts right after the payload, inside the block.
    let rear = unsafe { payload.add(payload_size) };

    // SAFETY: The caller guarantees GUARD_SIZE writable bytes after the payload.
    unsafe {
        ptr::write_bytes(rear.as_ptr(), GUARD_PATTERN, GUARD_SIZE);
    }
}

/// Recovers the start of the raw block from a payload pointer handed out by [`arm`].
///
/// # Safety
///
/// `payload` must have been returned by [`arm`].
#[must_use]
pub(crate) unsafe fn block_of(payload: NonNull<u8>) -> NonNull<u8> {
    // SAFETY: Every payload sits GUARD_SIZE bytes into its block.
    unsafe { payload.sub(GUARD_SIZE) }
}

/// Verifies both guards of a tracked payload without modifying anything.
///
/// Returns `None` if both guards are intact.
///
/// # Safety
///
/// `payload` must have been returned by [`arm`] for a payload of `payload_size` bytes and the
/// block must still be allocated.
#[must_use]
pub(crate) unsafe fn inspect(payload: NonNull<u8>, payload_size: usize) -> Option<GuardDamage> {
    // SAFETY: Forwarding the caller's guarantee.
    let block = unsafe { block_of(payload) };

    // SAFETY: The front guard is the first GUARD_SIZE bytes of a live block.
    let front = unsafe { slice::from_raw_parts(block.as_ptr().cast_const(), GUARD_SIZE) };

    // SAFETY: The rear guard starts right after the payload, inside the block.
    let rear_start = unsafe { payload.add(payload_size) };

    // SAFETY: The rear guard is the last GUARD_SIZE bytes of a live block.
    let rear = unsafe { slice::from_raw_parts(rear_start.as_ptr().cast_const(), GUARD_SIZE) };

    let front_intact = is_intact(front);
    let rear_intact = is_intact(rear);

    match (front_intact, rear_intact) {
        (true, true) => None,
        (false, true) => Some(GuardDamage::Front),
        (true, false) => Some(GuardDamage::Rear),
        (false, false) => Some(GuardDamage::Both),
    }
}

fn is_intact(guard: &[u8]) -> bool {
    guard.iter().all(|b| *b == GUARD_PATTERN)
}
