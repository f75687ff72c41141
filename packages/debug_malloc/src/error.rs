use thiserror::Error;

/// Errors returned to the caller of a tracked allocation.
///
/// Memory bugs found by the tracker are never errors. They are reported as
/// [`Diagnostic`][crate::Diagnostic]s and execution continues.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The raw allocator could not supply a block large enough for the payload and its guards.
    ///
    /// Nothing is tracked and nothing is reported, the same as a failed `malloc()`.
    #[error("could not allocate {size} bytes")]
    AllocationFailed {
        /// The payload size that was requested.
        size: usize,
    },
}

/// A specialized `Result` type for tracked allocations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn allocation_failed_names_size() {
        let error = Error::AllocationFailed { size: 1024 };

        assert_eq!(error.to_string(), "could not allocate 1024 bytes");
    }
}
