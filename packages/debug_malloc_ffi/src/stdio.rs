use std::io::{self, Write};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicPtr, Ordering};

/// The stream registered through `debug_malloc_set_output()`. Null means standard error.
static OUTPUT_STREAM: AtomicPtr<libc::FILE> = AtomicPtr::new(ptr::null_mut());

static C_STDERR: OnceLock<Option<StdioStream>> = OnceLock::new();

/// A C `FILE*` used as a Rust writer.
///
/// C stdio streams lock themselves on every call, so a stream may be written from any thread.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StdioStream {
    file: NonNull<libc::FILE>,
}

// SAFETY: C stdio functions are thread-safe. The stream is only ever passed to them.
unsafe impl Send for StdioStream {}
// SAFETY: See above.
unsafe impl Sync for StdioStream {}

impl StdioStream {
    /// # Safety
    ///
    /// `file` must be an open stream that stays open for as long as the result is used.
    pub(crate) unsafe fn new(file: NonNull<libc::FILE>) -> Self {
        Self { file }
    }

    pub(crate) fn as_ptr(self) -> *mut libc::FILE {
        self.file.as_ptr()
    }
}

impl Write for StdioStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // SAFETY: The buffer is valid for `buf.len()` bytes and the stream is open.
        let written =
            unsafe { libc::fwrite(buf.as_ptr().cast(), 1, buf.len(), self.file.as_ptr()) };

        if written == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        // SAFETY: The stream is open.
        if unsafe { libc::fflush(self.file.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

/// Remembers the stream that reports currently go to, so C callbacks can be handed it.
pub(crate) fn set_output_stream(file: *mut libc::FILE) {
    OUTPUT_STREAM.store(file, Ordering::Release);
}

/// The C stream that reports currently go to.
///
/// When no stream was registered this is a C stream over standard error, opened on first use.
/// Returns `None` only if that stream could not be opened.
pub(crate) fn current_output_stream() -> Option<StdioStream> {
    match NonNull::new(OUTPUT_STREAM.load(Ordering::Acquire)) {
        // SAFETY: The application promised to keep a registered stream open until replaced.
        Some(file) => Some(unsafe { StdioStream::new(file) }),
        None => c_stderr(),
    }
}

fn c_stderr() -> Option<StdioStream> {
    *C_STDERR.get_or_init(|| {
        // SAFETY: Opening a stream over an existing descriptor with a valid mode string.
        let file = unsafe { libc::fdopen(libc::STDERR_FILENO, c"w".as_ptr()) };

        // SAFETY: The stream is never closed.
        NonNull::new(file).map(|file| unsafe { StdioStream::new(file) })
    })
}
