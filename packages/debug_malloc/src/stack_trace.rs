use std::io::{self, Write};
use std::{fmt, hint, ptr};

/// A position on the current thread's stack that separates the tracker's own frames from the
/// code that called into it.
///
/// Traces captured with a boundary leave out every frame that lives at or below it, so they
/// start at the function that called the frame where the boundary was taken. Wrappers that
/// forward allocation requests, such as C entry points, take a boundary in their own frame
/// and pass it to [`Tracker::allocate_from()`][crate::Tracker::allocate_from] so that they do
/// not appear in traces themselves.
///
/// # Examples
///
/// ```
/// use std::ptr::NonNull;
///
/// use debug_malloc::{CallSite, LibcAllocator, StackBoundary, Tracker};
///
/// #[inline(never)]
/// fn allocate_for_plugin(tracker: &Tracker<LibcAllocator>, size: usize) -> Option<NonNull<u8>> {
///     // Traces start at whoever called this function.
///     tracker
///         .allocate_from(size, CallSite::unknown(), StackBoundary::here())
///         .ok()
/// }
/// # let tracker = Tracker::builder().autocheck(false).build(LibcAllocator);
/// # let block = allocate_for_plugin(&tracker, 8).unwrap();
/// # // SAFETY: The block came from this tracker and is freed once.
/// # unsafe { tracker.free(block.as_ptr()) };
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StackBoundary {
    address: usize,
}

impl StackBoundary {
    /// Marks the frame of the calling function as the innermost frame to leave out of traces.
    ///
    /// The calling function must not be inlined into its own caller, otherwise the caller's
    /// frame is left out as well.
    #[inline(always)]
    #[must_use]
    pub fn here() -> Self {
        let marker = 0_u8;

        Self {
            address: ptr::from_ref(hint::black_box(&marker)).addr(),
        }
    }

    /// Whether a frame with stack pointer `sp` belongs to the tracker side of the boundary.
    ///
    /// The stack grows downwards, so callers have higher stack pointers than their callees.
    /// Unwinders that cannot report a stack pointer give zero, and such frames are kept.
    fn covers(self, sp: usize) -> bool {
        sp != 0 && sp <= self.address
    }
}

/// Return addresses captured when an allocation was made, innermost frame first.
///
/// The tracker only captures addresses. Turning them into symbols is the job of a
/// [`TracePrinter`] registered by the application.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct StackTrace {
    frames: Box<[usize]>,
}

impl StackTrace {
    /// Creates a trace from already captured return addresses.
    #[must_use]
    pub fn from_frames(frames: impl Into<Box<[usize]>>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    /// Captures up to `max_depth` return addresses of the calling thread, starting at the
    /// first frame above `boundary`.
    ///
    /// Returns `None` if `max_depth` is zero, in which case nothing is walked at all.
    #[inline(never)]
    #[must_use]
    pub(crate) fn capture(max_depth: usize, boundary: StackBoundary) -> Option<Self> {
        if max_depth == 0 {
            return None;
        }

        let mut frames = Vec::with_capacity(max_depth);

        backtrace::trace(|frame| {
            if boundary.covers(frame.sp().addr()) {
                return true;
            }

            frames.push(frame.ip().addr());
            frames.len() < max_depth
        });

        Some(Self::from_frames(frames))
    }

    /// The captured return addresses, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    /// Number of captured frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames were captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames.iter().map(|addr| format!("{addr:#x}")))
            .finish()
    }
}

/// Prints a captured [`StackTrace`] as part of a leak report.
///
/// Register one via [`Control::set_trace_printer()`][crate::Control::set_trace_printer] to
/// symbolize traces. Without one, raw addresses are printed.
///
/// Any `Fn(&mut dyn Write, &StackTrace) -> io::Result<()>` closure is a printer.
///
/// # Examples
///
/// ```
/// use std::io::Write;
///
/// use debug_malloc::{LibcAllocator, StackTrace, Tracker};
///
/// let tracker = Tracker::builder()
///     .autocheck(false)
///     .build(LibcAllocator);
///
/// tracker.control().set_trace_printer(
///     |out: &mut dyn Write, trace: &StackTrace| -> std::io::Result<()> {
///         writeln!(out, "\t{} frames", trace.len())
///     },
/// );
/// ```
pub trait TracePrinter: Send + Sync + 'static {
    /// Writes `trace` to `out`. Called while the report output is locked.
    ///
    /// # Errors
    ///
    /// Output errors are passed through. The tracker ignores them and carries on with the report.
    fn print_trace(&self, out: &mut dyn Write, trace: &StackTrace) -> io::Result<()>;
}

impl<F> TracePrinter for F
where
    F: Fn(&mut dyn Write, &StackTrace) -> io::Result<()> + Send + Sync + 'static,
{
    fn print_trace(&self, out: &mut dyn Write, trace: &StackTrace) -> io::Result<()> {
        self(out, trace)
    }
}

/// Fallback used when no [`TracePrinter`] is registered: one raw address per line.
pub(crate) fn print_raw_trace(out: &mut dyn Write, trace: &StackTrace) -> io::Result<()> {
    for addr in trace.frames() {
        writeln!(out, "\t{addr:#x}")?;
    }

    Ok(())
}
