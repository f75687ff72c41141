use std::ffi::{CString, c_char, c_int, c_void};
use std::io::{self, Write};
use std::ptr;

use debug_malloc::{AllocationInfo, LeakWhitelist, StackTrace, TracePrinter};
use tracing::debug;

use crate::stdio::current_output_stream;

/// Prints a stack trace to a C stream. The trace is an array of return addresses ending with a
/// null entry.
pub type StacktracePrintCallback =
    unsafe extern "C" fn(fp: *mut libc::FILE, trace: *mut *mut c_void);

/// Decides whether a leak is expected. Any pointer argument may be null and `line` may be zero
/// when the information is not available.
pub type LeakWhitelistCallback = unsafe extern "C" fn(
    file: *const c_char,
    line: c_int,
    code_address: *mut c_void,
    trace: *mut *mut c_void,
) -> bool;

/// Null-terminated array of frame addresses, as C callbacks expect traces.
fn null_terminated(trace: &StackTrace) -> Vec<*mut c_void> {
    trace
        .frames()
        .iter()
        .map(|&address| ptr::with_exposed_provenance_mut(address))
        .chain([ptr::null_mut()])
        .collect()
}

pub(crate) struct CTracePrinter {
    callback: StacktracePrintCallback,
}

impl CTracePrinter {
    pub(crate) fn new(callback: StacktracePrintCallback) -> Self {
        Self { callback }
    }
}

impl TracePrinter for CTracePrinter {
    fn print_trace(&self, out: &mut dyn Write, trace: &StackTrace) -> io::Result<()> {
        // Whatever the report wrote so far must come before what the callback writes.
        out.flush()?;

        let Some(mut stream) = current_output_stream() else {
            debug!("no C stream available for the stack trace print callback");
            return Ok(());
        };

        let mut frames = null_terminated(trace);

        // SAFETY: The application registered a callback with this signature. The stream is open
        // and the trace array is null-terminated and outlives the call.
        unsafe {
            (self.callback)(stream.as_ptr(), frames.as_mut_ptr());
        }

        stream.flush()
    }
}

pub(crate) struct CLeakWhitelist {
    callback: LeakWhitelistCallback,
}

impl CLeakWhitelist {
    pub(crate) fn new(callback: LeakWhitelistCallback) -> Self {
        Self { callback }
    }
}

impl LeakWhitelist for CLeakWhitelist {
    fn is_whitelisted(&self, leak: &AllocationInfo) -> bool {
        let file = leak.site().file().and_then(|file| CString::new(file).ok());
        let line = c_int::try_from(leak.site().line()).unwrap_or(c_int::MAX);
        let code_address = leak
            .code_address()
            .map_or(ptr::null_mut(), ptr::with_exposed_provenance_mut);
        let mut frames = leak.stack_trace().map(null_terminated);

        // SAFETY: The application registered a callback with this signature. Every pointer is
        // either null or valid for the duration of the call.
        unsafe {
            (self.callback)(
                file.as_ref().map_or(ptr::null(), |file| file.as_ptr()),
                line,
                code_address,
                frames
                    .as_mut()
                    .map_or(ptr::null_mut(), |frames| frames.as_mut_ptr()),
            )
        }
    }
}
