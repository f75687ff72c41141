use std::fmt::Debug;
use std::ptr::NonNull;

/// The allocator that physically supplies and reclaims memory for a [`Tracker`][crate::Tracker].
///
/// The tracker never manages memory itself. It asks the raw allocator for blocks slightly
/// larger than requested (to make room for corruption guards) and hands them back on free.
/// Blocks handed out while tracking is suspended are passed through unmodified, so the raw
/// allocator must accept `free()` and `realloc()` of any block it returned, without needing
/// to know the block size. This is the C `malloc` family contract.
///
/// Implementations must not call back into the tracker that owns them.
///
/// # Safety
///
/// Implementations must return blocks aligned at least to 16 bytes that are valid for reads
/// and writes of the requested size, and must keep them valid until they are freed or
/// reallocated.
pub unsafe trait RawAllocator: Debug + Send + Sync + 'static {
    /// Allocates a block of `size` bytes, returning `None` if no memory is available.
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Resizes a block, preserving its contents up to the smaller of the old and new sizes.
    ///
    /// Returns `None` if no memory is available, in which case the original block is unchanged.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by this allocator and not yet freed.
    unsafe fn realloc(&self, block: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by this allocator and not yet freed.
    unsafe fn free(&self, block: NonNull<u8>);
}

/// Raw allocator that forwards to the C runtime's `malloc`, `realloc` and `free`.
///
/// This is the allocator that instrumented C code would otherwise call directly, so memory
/// passed through it untracked remains fully compatible with the host program.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibcAllocator;

// Real C runtime calls are excluded from coverage measurement because every tracker test
// exercises them anyway and the failure paths cannot be triggered on demand.
#[cfg_attr(coverage_nightly, coverage(off))]
// SAFETY: The C runtime returns blocks aligned for any fundamental type (16 bytes on the
// platforms we support) and keeps them valid until freed.
unsafe impl RawAllocator for LibcAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        // malloc(0) may legally return null, which we would misreport as a failure.
        let size = size.max(1);

        // SAFETY: No safety requirements beyond passing a valid size.
        NonNull::new(unsafe { libc::malloc(size) }.cast())
    }

    unsafe fn realloc(&self, block: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        // realloc(p, 0) may free the block, which must never happen behind our back.
        let size = size.max(1);

        // SAFETY: The caller guarantees that the block came from this allocator.
        NonNull::new(unsafe { libc::realloc(block.as_ptr().cast(), size) }.cast())
    }

    unsafe fn free(&self, block: NonNull<u8>) {
        // SAFETY: The caller guarantees that the block came from this allocator.
        unsafe {
            libc::free(block.as_ptr().cast());
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(LibcAllocator: Send, Sync);

    #[test]
    fn malloc_zero_returns_block() {
        let block = LibcAllocator.malloc(0).unwrap();

        // SAFETY: The block came from the same allocator.
        unsafe {
            LibcAllocator.free(block);
        }
    }

    #[test]
    fn realloc_preserves_prefix() {
        let block = LibcAllocator.malloc(4).unwrap();

        // SAFETY: The block is 4 bytes long.
        unsafe {
            block.as_ptr().copy_from_nonoverlapping([1_u8, 2, 3, 4].as_ptr(), 4);
        }

        // SAFETY: The block came from the same allocator.
        let grown = unsafe { LibcAllocator.realloc(block, 4096) }.unwrap();

        let mut prefix = [0_u8; 4];
        // SAFETY: The grown block is at least 4 bytes long.
        unsafe {
            grown.as_ptr().copy_to_nonoverlapping(prefix.as_mut_ptr(), 4);
        }
        assert_eq!(prefix, [1, 2, 3, 4]);

        // SAFETY: The grown block came from the same allocator.
        unsafe {
            LibcAllocator.free(grown);
        }
    }

    #[test]
    fn blocks_are_sixteen_byte_aligned() {
        let block = LibcAllocator.malloc(3).unwrap();

        assert_eq!(block.as_ptr() as usize % 16, 0);

        // SAFETY: The block came from the same allocator.
        unsafe {
            LibcAllocator.free(block);
        }
    }
}
