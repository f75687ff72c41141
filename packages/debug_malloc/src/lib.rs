#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A debugging allocation tracker that finds memory leaks, heap corruption and invalid frees.
//!
//! This crate provides [`Tracker`], which sits between an application and the allocator that
//! really supplies memory (a [`RawAllocator`], by default the C runtime's `malloc` family via
//! [`LibcAllocator`]). Every allocation made through the tracker is recorded together with its
//! size, the source location that requested it and optionally a stack trace. The payload is
//! surrounded by guard bytes that reveal out-of-bounds writes.
//!
//! # Key Features
//!
//! - **Leak detection**: [`Tracker::check_leaks()`] lists every allocation still live, in
//!   allocation order, with its call site and stack trace.
//! - **Corruption guards**: damaged guard bytes are reported when a block is freed or resized,
//!   or on demand by [`Tracker::check_corruption()`].
//! - **Invalid and double free detection**: freeing something the tracker never handed out (or
//!   already took back) is reported instead of corrupting the heap.
//! - **Suspension**: [`Tracker::suspend()`] and [`suspend_current_thread()`] exempt a region of
//!   code from tracking, for example a third-party call whose allocations outlive the check.
//! - **Pluggable callbacks**: a [`TracePrinter`] symbolizes stack traces and a
//!   [`LeakWhitelist`] excludes expected leaks.
//! - **Statistics**: [`Tracker::current_mem_alloc()`] and [`Tracker::total_alloc_count()`].
//!
//! Problems are reported as text to a configurable output (standard error by default) and as
//! `tracing` events. The tracker never panics or aborts because of a bug it found.
//!
//! # Examples
//!
//! ```
//! use debug_malloc::{CallSite, LibcAllocator, Tracker};
//!
//! let tracker = Tracker::builder()
//!     .autocheck(false)
//!     .output(std::io::sink())
//!     .build(LibcAllocator);
//!
//! let block = tracker.allocate_at(16, CallSite::new("parser.c", 120)).unwrap();
//! assert_eq!(tracker.current_mem_alloc(), 16);
//!
//! // Writing one byte too many damages the rear guard.
//! // SAFETY: The write lands in the guard bytes right after the 16-byte payload.
//! unsafe { block.add(16).write(0) };
//! assert_eq!(tracker.check_corruption(), 1);
//!
//! // SAFETY: The block came from this tracker and is freed once.
//! unsafe { tracker.free(block.as_ptr()) };
//!
//! assert_eq!(tracker.check_leaks(), 0);
//! ```
//!
//! Reallocating keeps the identity of an allocation:
//!
//! ```
//! use debug_malloc::{CallSite, LibcAllocator, Tracker};
//!
//! let tracker = Tracker::builder().autocheck(false).build(LibcAllocator);
//!
//! let block = tracker.allocate_here(8).unwrap();
//!
//! // SAFETY: The block came from this tracker.
//! let block = unsafe { tracker.reallocate(block.as_ptr(), 800, CallSite::caller()) }
//!     .unwrap()
//!     .unwrap();
//!
//! assert_eq!(tracker.current_mem_alloc(), 800);
//! assert_eq!(tracker.total_alloc_count(), 1);
//! assert_eq!(tracker.live_allocations()[0].sequence(), 1);
//!
//! // SAFETY: The block came from this tracker and is freed once.
//! unsafe { tracker.free(block.as_ptr()) };
//! ```
//!
//! # Shutdown
//!
//! When the tracker is dropped (or [`Tracker::shutdown()`] is called) with autocheck enabled,
//! it runs a final leak check. Programs that cannot drop their tracker, such as C programs
//! using a global one through the `debug_malloc_ffi` package, call shutdown at exit.

mod builder;
mod control;
mod diagnostic;
mod error;
mod guard;
mod raw_allocator;
mod record;
mod report;
mod stack_trace;
#[cfg(test)]
mod test_util;
mod tracker;
mod use_counter;

pub use builder::*;
pub use control::{Control, LeakWhitelist};
pub use diagnostic::*;
pub use error::*;
pub use guard::GuardDamage;
pub use raw_allocator::*;
pub use record::{AllocationInfo, CallSite};
pub use stack_trace::{StackBoundary, StackTrace, TracePrinter};
pub use tracker::Tracker;
pub use use_counter::{Suspension, ThreadSuspension, suspend_current_thread};
