//! Suspension of tracking, either process-wide or for the current thread only.
//!
//! The process-wide use depth lives in the tracker state (it is guarded by the same lock as the
//! allocation table). This module provides the scoped tokens around it and the thread-local
//! depth the tracker raises while it runs application callbacks.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use crate::{RawAllocator, Tracker};

thread_local! {
    static THREAD_SUSPENSION_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether tracking is suspended for the current thread.
pub(crate) fn current_thread_suspended() -> bool {
    THREAD_SUSPENSION_DEPTH.with(|depth| depth.get() > 0)
}

/// Process-wide suspension of tracking, released when dropped.
///
/// Returned by [`Tracker::suspend()`]. While at least one suspension is alive, allocations
/// made through the tracker on any thread are passed through to the raw allocator untracked.
/// Suspensions nest: tracking resumes when the last one is dropped.
#[must_use = "tracking resumes as soon as the suspension is dropped"]
pub struct Suspension<'a, A: RawAllocator> {
    tracker: &'a Tracker<A>,
}

impl<'a, A: RawAllocator> Suspension<'a, A> {
    pub(crate) fn new(tracker: &'a Tracker<A>) -> Self {
        tracker.increment_use();
        Self { tracker }
    }
}

impl<A: RawAllocator> Drop for Suspension<'_, A> {
    fn drop(&mut self) {
        self.tracker.decrement_use();
    }
}

impl<A: RawAllocator> fmt::Debug for Suspension<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension").finish_non_exhaustive()
    }
}

/// Suspension of tracking for the current thread only, released when dropped.
///
/// Allocations made through any tracker on this thread are passed through untracked while the
/// token is alive. Other threads are not affected. The token cannot leave the thread that
/// created it.
///
/// # Examples
///
/// ```
/// use debug_malloc::{LibcAllocator, Tracker, suspend_current_thread};
///
/// let tracker = Tracker::builder().autocheck(false).build(LibcAllocator);
///
/// {
///     let _suspension = suspend_current_thread();
///     let block = tracker.allocate_here(64).unwrap();
///
///     assert_eq!(tracker.current_mem_alloc(), 0);
///
///     // SAFETY: The block came from this tracker and is freed once.
///     unsafe { tracker.free(block.as_ptr()) };
/// }
/// ```
#[must_use = "tracking resumes as soon as the suspension is dropped"]
#[derive(Debug)]
pub struct ThreadSuspension {
    _not_send: PhantomData<*const ()>,
}

impl ThreadSuspension {
    fn new() -> Self {
        THREAD_SUSPENSION_DEPTH.with(|depth| depth.set(depth.get().saturating_add(1)));

        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for ThreadSuspension {
    fn drop(&mut self) {
        THREAD_SUSPENSION_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Suspends tracking on the current thread until the returned token is dropped.
pub fn suspend_current_thread() -> ThreadSuspension {
    ThreadSuspension::new()
}
