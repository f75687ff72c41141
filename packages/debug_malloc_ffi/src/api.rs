use std::ffi::{CStr, c_char, c_int, c_void};
use std::io;
use std::ptr::{self, NonNull};
use std::sync::LazyLock;

use debug_malloc::{CallSite, LibcAllocator, StackBoundary, Tracker};
use tracing::debug;

use crate::stdio::{StdioStream, set_output_stream};
use crate::{CLeakWhitelist, CTracePrinter, LeakWhitelistCallback, StacktracePrintCallback};

static TRACKER: LazyLock<Tracker<LibcAllocator>> = LazyLock::new(|| {
    // SAFETY: The handler is a plain function that stays valid for the life of the process.
    if unsafe { libc::atexit(shutdown_at_exit) } != 0 {
        debug!("could not register exit handler, leaks are only checked on finalize");
    }

    Tracker::system()
});

#[cfg_attr(test, mutants::skip)] // Only runs when the process exits.
extern "C" fn shutdown_at_exit() {
    _ = TRACKER.shutdown();
}

/// The process-wide tracker behind the C functions.
///
/// Rust code linked into the same program can use it directly, for example to read
/// [`live_allocations()`][Tracker::live_allocations].
pub fn global_tracker() -> &'static Tracker<LibcAllocator> {
    &TRACKER
}

/// # Safety
///
/// `file` must be null or a NUL-terminated string that stays valid for the rest of the
/// program, such as `__FILE__`.
unsafe fn call_site(file: *const c_char, line: c_int) -> CallSite {
    let line = u32::try_from(line).unwrap_or(0);

    if file.is_null() {
        return CallSite::from_parts(None, line);
    }

    // SAFETY: Forwarding the caller's guarantee, including the 'static lifetime.
    let file: &'static CStr = unsafe { CStr::from_ptr(file) };

    CallSite::from_parts(file.to_str().ok(), line)
}

fn to_c_int(count: usize) -> c_int {
    c_int::try_from(count).unwrap_or(c_int::MAX)
}

/// Allocates `size` bytes, recording `file` and `line` as the call site.
///
/// Returns null if no memory is available.
///
/// # Safety
///
/// `file` must be null or a NUL-terminated string that stays valid for the rest of the
/// program, such as `__FILE__`.
#[unsafe(no_mangle)]
#[inline(never)]
pub unsafe extern "C" fn debug_malloc(
    size: usize,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    // SAFETY: Forwarding the caller's guarantee.
    let site = unsafe { call_site(file, line) };

    TRACKER
        .allocate_from(size, site, StackBoundary::here())
        .map_or(ptr::null_mut(), |block| block.as_ptr().cast())
}

/// Resizes a block, recording `file` and `line` as its new call site.
///
/// A null `ptr` allocates, a zero `size` frees and returns null. Returns null if no memory is
/// available, in which case `ptr` stays valid.
///
/// # Safety
///
/// `ptr` must be null or a block returned by `debug_malloc()` or `debug_realloc()` that has
/// not been freed. `file` has the same requirements as for `debug_malloc()`.
#[unsafe(no_mangle)]
#[inline(never)]
pub unsafe extern "C" fn debug_realloc(
    ptr: *mut c_void,
    size: usize,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    // SAFETY: Forwarding the caller's guarantee.
    let site = unsafe { call_site(file, line) };

    let boundary = StackBoundary::here();

    // SAFETY: Forwarding the caller's guarantee.
    match unsafe { TRACKER.reallocate_from(ptr.cast(), size, site, boundary) } {
        Ok(Some(block)) => block.as_ptr().cast(),
        Ok(None) | Err(_) => ptr::null_mut(),
    }
}

/// Releases a block. Null is ignored, invalid and double frees are reported.
///
/// # Safety
///
/// `ptr` must be null or a pointer the application wants released or diagnosed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn debug_free(ptr: *mut c_void) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe {
        TRACKER.free(ptr.cast());
    }
}

/// Suspends tracking until the matching `debug_malloc_unuse()`.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_use() {
    TRACKER.increment_use();
}

/// Ends a suspension started by `debug_malloc_use()`.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_unuse() {
    TRACKER.decrement_use();
}

/// Reports all live tracked allocations and returns how many are not whitelisted.
#[unsafe(no_mangle)]
pub extern "C" fn check_leaks() -> c_int {
    to_c_int(TRACKER.check_leaks())
}

/// Verifies the guards of all live tracked allocations and returns how many are damaged.
#[unsafe(no_mangle)]
pub extern "C" fn check_mem_corruption() -> c_int {
    to_c_int(TRACKER.check_corruption())
}

/// Total payload bytes of all live tracked allocations.
#[unsafe(no_mangle)]
pub extern "C" fn get_current_mem_alloc() -> usize {
    TRACKER.current_mem_alloc()
}

/// Number of tracked allocations made since the program started.
#[unsafe(no_mangle)]
pub extern "C" fn get_total_mem_alloc_cnt() -> usize {
    TRACKER.total_alloc_count()
}

/// Sets whether leaks are checked when the program exits. Enabled by default.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_set_autocheck(enabled: bool) {
    TRACKER.control().set_autocheck(enabled);
}

/// Whether leaks are checked when the program exits.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_get_autocheck() -> bool {
    TRACKER.control().autocheck()
}

/// Sets whether reports include whitelisted leaks and progress lines. Disabled by default.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_set_verbose(enabled: bool) {
    TRACKER.control().set_verbose(enabled);
}

/// Whether reports include whitelisted leaks and progress lines.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_get_verbose() -> bool {
    TRACKER.control().verbose()
}

/// Redirects reports to `fp`. Null restores standard error.
///
/// # Safety
///
/// `fp` must be null or an open stream that stays open until the output is redirected again
/// or the program ends.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn debug_malloc_set_output(fp: *mut libc::FILE) {
    match NonNull::new(fp) {
        Some(file) => {
            // SAFETY: Forwarding the caller's guarantee.
            let stream = unsafe { StdioStream::new(file) };
            TRACKER.control().set_output(stream);
        }
        None => TRACKER.control().set_output(io::stderr()),
    }

    set_output_stream(fp);
}

/// Sets the program name included in leak reports, typically `argv[0]`. Null removes it.
///
/// # Safety
///
/// `name` must be null or a NUL-terminated string. It is copied.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn debug_malloc_set_progname(name: *const c_char) {
    if name.is_null() {
        TRACKER.control().clear_program_name();
        return;
    }

    // SAFETY: Forwarding the caller's guarantee.
    let name = unsafe { CStr::from_ptr(name) };
    TRACKER.control().set_program_name(name.to_string_lossy());
}

/// Sets how many return addresses are captured per allocation. Zero disables capture.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_set_stack_trace_depth(depth: usize) {
    TRACKER.control().set_stack_trace_depth(depth);
}

/// Registers the function that prints stack traces in leak reports. Null removes it, after
/// which raw addresses are printed.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_set_stacktrace_print_callback(
    callback: Option<StacktracePrintCallback>,
) {
    match callback {
        Some(callback) => TRACKER
            .control()
            .set_trace_printer(CTracePrinter::new(callback)),
        None => TRACKER.control().clear_trace_printer(),
    }
}

/// Registers the function that excludes expected leaks from leak reports. Null removes it.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_set_leak_whitelist_callback(
    callback: Option<LeakWhitelistCallback>,
) {
    match callback {
        Some(callback) => TRACKER
            .control()
            .set_leak_whitelist(CLeakWhitelist::new(callback)),
        None => TRACKER.control().clear_leak_whitelist(),
    }
}

/// Ends tracking and runs the exit leak check now instead of at exit.
///
/// Returns the number of leaks found, or -1 if autocheck is disabled or tracking already
/// ended. Later allocations are passed through untracked.
#[unsafe(no_mangle)]
pub extern "C" fn debug_malloc_finalize() -> c_int {
    TRACKER.shutdown().map_or(-1, to_c_int)
}
