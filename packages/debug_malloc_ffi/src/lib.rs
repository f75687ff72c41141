#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! C ABI for the `debug_malloc` allocation tracker.
//!
//! The functions exported here operate on one process-wide [`Tracker`][debug_malloc::Tracker]
//! over the C runtime allocator, created on first use. C code calls them through
//! `include/debug_malloc.h`, usually via macros that supply `__FILE__` and `__LINE__`:
//!
//! ```c
//! #define malloc(size) debug_malloc((size), __FILE__, __LINE__)
//! #define realloc(ptr, size) debug_realloc((ptr), (size), __FILE__, __LINE__)
//! #define free(ptr) debug_free(ptr)
//! ```
//!
//! Reports go to standard error unless redirected with `debug_malloc_set_output()`. If
//! autocheck is enabled, leaks are checked when the program exits normally, or earlier when
//! `debug_malloc_finalize()` is called.
//!
//! Only Unix-like targets are supported, as C streams over standard error are opened by file
//! descriptor.

mod api;
mod callbacks;
mod stdio;

pub use api::*;
pub use callbacks::{LeakWhitelistCallback, StacktracePrintCallback};
pub(crate) use callbacks::{CLeakWhitelist, CTracePrinter};
