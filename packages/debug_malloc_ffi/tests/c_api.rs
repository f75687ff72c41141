//! Integration tests for the C ABI of `debug_malloc`.
//!
//! All functions share one process-wide tracker, so everything runs as one sequential test.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use debug_malloc_ffi::{
    check_leaks, check_mem_corruption, debug_free, debug_malloc, debug_malloc_finalize,
    debug_malloc_get_autocheck, debug_malloc_get_verbose, debug_malloc_set_autocheck,
    debug_malloc_set_leak_whitelist_callback, debug_malloc_set_output, debug_malloc_set_progname,
    debug_malloc_set_stack_trace_depth, debug_malloc_set_stacktrace_print_callback,
    debug_malloc_set_verbose, debug_malloc_unuse, debug_malloc_use, debug_realloc,
    get_current_mem_alloc, get_total_mem_alloc_cnt, global_tracker,
};

const FILE: &CStr = c"client.c";

static PRINTED_TRACES: AtomicUsize = AtomicUsize::new(0);

/// A temporary C stream that reports are redirected to while it is alive.
struct CapturedOutput {
    file: NonNull<libc::FILE>,
}

impl CapturedOutput {
    fn install() -> Self {
        // SAFETY: No requirements.
        let file = NonNull::new(unsafe { libc::tmpfile() }).unwrap();

        // SAFETY: The stream stays open until this value is dropped, which restores stderr
        // before closing it.
        unsafe { debug_malloc_set_output(file.as_ptr()) };

        Self { file }
    }

    fn text(&self) -> String {
        // SAFETY: The stream is open.
        unsafe { libc::fflush(self.file.as_ptr()) };
        // SAFETY: The stream is open.
        unsafe { libc::rewind(self.file.as_ptr()) };

        let mut bytes = Vec::new();
        let mut chunk = [0_u8; 256];

        loop {
            // SAFETY: The chunk is valid for its length and the stream is open.
            let read = unsafe {
                libc::fread(chunk.as_mut_ptr().cast(), 1, chunk.len(), self.file.as_ptr())
            };

            if read == 0 {
                break;
            }

            bytes.extend_from_slice(chunk.get(..read).unwrap());
        }

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Drop for CapturedOutput {
    fn drop(&mut self) {
        // SAFETY: Null restores standard error.
        unsafe { debug_malloc_set_output(ptr::null_mut()) };
        // SAFETY: The tracker no longer refers to the stream.
        unsafe { libc::fclose(self.file.as_ptr()) };
    }
}

fn malloc_at(size: usize, line: c_int) -> *mut c_void {
    // SAFETY: The file name is a static string.
    unsafe { debug_malloc(size, FILE.as_ptr(), line) }
}

/// Name of the function containing the code at `address`.
fn function_name(address: usize) -> String {
    let mut name = String::new();

    backtrace::resolve(ptr::with_exposed_provenance_mut(address), |symbol| {
        if name.is_empty() {
            name = symbol.name().map(|n| n.to_string()).unwrap_or_default();
        }
    });

    name
}

fn free(block: *mut c_void) {
    // SAFETY: Callers pass blocks from the tracker, or pointers they want diagnosed.
    unsafe { debug_free(block) };
}

unsafe extern "C" fn count_trace(fp: *mut libc::FILE, trace: *mut *mut c_void) {
    PRINTED_TRACES.fetch_add(1, Ordering::Relaxed);

    assert!(!fp.is_null());
    assert!(!trace.is_null());

    // SAFETY: The stream is open for the duration of the callback.
    unsafe { libc::fputs(c"\t<symbolized>\n".as_ptr(), fp) };
}

unsafe extern "C" fn whitelist_line_200(
    file: *const c_char,
    line: c_int,
    _code_address: *mut c_void,
    _trace: *mut *mut c_void,
) -> bool {
    if file.is_null() {
        return false;
    }

    // SAFETY: The tracker passes a NUL-terminated string that outlives the call.
    let file = unsafe { CStr::from_ptr(file) };

    file == FILE && line == 200
}

#[test]
fn c_api_end_to_end() {
    let _restore = scopeguard::guard((), |()| {
        debug_malloc_set_verbose(false);
        debug_malloc_set_stack_trace_depth(0);
        debug_malloc_set_stacktrace_print_callback(None);
        debug_malloc_set_leak_whitelist_callback(None);
    });

    assert!(debug_malloc_get_autocheck());
    assert!(!debug_malloc_get_verbose());

    // Allocate 10, 20, 30 and free the middle one.
    {
        let output = CapturedOutput::install();
        let baseline_count = get_total_mem_alloc_cnt();

        let a = malloc_at(10, 10);
        let b = malloc_at(20, 20);
        let c = malloc_at(30, 30);
        free(b);

        assert_eq!(get_current_mem_alloc(), 40);
        assert_eq!(get_total_mem_alloc_cnt(), baseline_count + 3);
        assert_eq!(check_leaks(), 2);

        let text = output.text();
        assert!(text.contains("client.c:10\n"));
        assert!(text.contains("client.c:30\n"));
        assert!(!text.contains("client.c:20"));
        assert!(text.contains("*** 2 leaks found"));

        free(a);
        free(c);
        assert_eq!(get_current_mem_alloc(), 0);
    }

    // Reallocation keeps identity, zero size frees.
    {
        let _output = CapturedOutput::install();

        // SAFETY: Null allocates.
        let block = unsafe { debug_realloc(ptr::null_mut(), 8, FILE.as_ptr(), 40) };
        assert!(!block.is_null());

        // SAFETY: The block came from the tracker.
        let block = unsafe { debug_realloc(block, 512, FILE.as_ptr(), 41) };
        assert_eq!(get_current_mem_alloc(), 512);

        // SAFETY: The block came from the tracker.
        let gone = unsafe { debug_realloc(block, 0, FILE.as_ptr(), 42) };
        assert!(gone.is_null());
        assert_eq!(get_current_mem_alloc(), 0);
    }

    // Corruption and invalid frees are reported, never fatal.
    {
        let output = CapturedOutput::install();

        let block = malloc_at(4, 50);
        // SAFETY: The write lands in the rear guard bytes of the 4-byte block.
        unsafe { block.cast::<u8>().add(4).write(0) };

        assert_eq!(check_mem_corruption(), 1);
        free(block);
        free(block);

        let text = output.text();
        assert_eq!(text.matches("heap data corrupt").count(), 2);
        assert!(text.contains("client.c:50"));
        assert!(text.contains("never allocated or already freed"));
    }

    // Use counter suspends tracking.
    {
        let output = CapturedOutput::install();

        debug_malloc_use();
        let exempt = malloc_at(64, 60);
        debug_malloc_unuse();

        assert_eq!(get_current_mem_alloc(), 0);
        assert_eq!(check_leaks(), 0);

        free(exempt);
        assert!(output.text().contains("untracked pointer"));
    }

    // Callbacks, program name and verbose mode.
    {
        let output = CapturedOutput::install();

        debug_malloc_set_verbose(true);
        debug_malloc_set_stack_trace_depth(4);
        // SAFETY: The name is a valid NUL-terminated string.
        unsafe { debug_malloc_set_progname(c"./client".as_ptr()) };
        debug_malloc_set_stacktrace_print_callback(Some(count_trace));
        debug_malloc_set_leak_whitelist_callback(Some(whitelist_line_200));

        let expected = malloc_at(1, 200);
        let unexpected = malloc_at(1, 201);

        assert_eq!(check_leaks(), 1);
        assert_eq!(PRINTED_TRACES.load(Ordering::Relaxed), 2);

        let text = output.text();
        assert!(text.contains("./client client.c:200 (whitelisted)\n"));
        assert!(text.contains("./client client.c:201\n"));
        assert_eq!(text.matches("\t<symbolized>\n").count(), 2);

        // SAFETY: Null removes the program name.
        unsafe { debug_malloc_set_progname(ptr::null()) };

        free(expected);
        free(unexpected);
    }

    // Traces start in the code that called the C functions.
    {
        let _output = CapturedOutput::install();
        debug_malloc_set_stack_trace_depth(4);

        let allocated = malloc_at(2, 250);
        // SAFETY: Null allocates.
        let reallocated = unsafe { debug_realloc(ptr::null_mut(), 2, FILE.as_ptr(), 251) };

        for info in global_tracker().live_allocations() {
            let function = function_name(info.code_address().unwrap());

            assert!(function.starts_with("c_api::"), "{} starts in {function}", info.site());
        }

        free(allocated);
        free(reallocated);
        debug_malloc_set_stack_trace_depth(0);
    }

    // Finalizing runs the exit check once.
    {
        let output = CapturedOutput::install();
        debug_malloc_set_verbose(false);

        let leaked = malloc_at(3, 300);

        assert_eq!(debug_malloc_finalize(), 1);
        assert_eq!(debug_malloc_finalize(), -1);
        assert!(output.text().contains("client.c:300"));

        free(leaked);
        assert_eq!(get_current_mem_alloc(), 0);
    }

    debug_malloc_set_autocheck(false);
}
