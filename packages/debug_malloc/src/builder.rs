use std::cell::Cell;
use std::fmt;
use std::io::Write;
use std::marker::PhantomData;

use crate::{Control, LeakWhitelist, RawAllocator, TracePrinter, Tracker};

/// Builder for creating an instance of [`Tracker`].
///
/// Every setting is optional and can also be changed later through [`Tracker::control()`].
///
/// # Examples
///
/// ```
/// use debug_malloc::{LibcAllocator, Tracker};
///
/// let tracker = Tracker::builder()
///     .autocheck(false)
///     .output(std::io::stdout())
///     .build(LibcAllocator);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[must_use]
pub struct TrackerBuilder {
    control: Control,

    _not_sync: PhantomData<Cell<()>>,
}

impl TrackerBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            control: Control::new(),
            _not_sync: PhantomData,
        }
    }

    /// Sets whether dropping the tracker runs a final leak check. Enabled by default.
    #[inline]
    pub fn autocheck(self, enabled: bool) -> Self {
        self.control.set_autocheck(enabled);
        self
    }

    /// Sets whether reports include whitelisted leaks and progress lines. Disabled by default.
    #[inline]
    pub fn verbose(self, enabled: bool) -> Self {
        self.control.set_verbose(enabled);
        self
    }

    /// Sets where diagnostics and reports are written. Standard error by default.
    #[inline]
    pub fn output(mut self, output: impl Write + Send + 'static) -> Self {
        self.control.replace_output(Box::new(output));
        self
    }

    /// Sets the program name included in leak reports.
    #[inline]
    pub fn program_name(self, name: impl Into<String>) -> Self {
        self.control.set_program_name(name);
        self
    }

    /// Sets how many return addresses are captured per allocation. Zero (the default)
    /// disables capture.
    #[inline]
    pub fn stack_trace_depth(self, depth: usize) -> Self {
        self.control.set_stack_trace_depth(depth);
        self
    }

    /// Sets the printer used for stack traces in leak reports.
    #[inline]
    pub fn trace_printer(self, printer: impl TracePrinter) -> Self {
        self.control.set_trace_printer(printer);
        self
    }

    /// Sets the predicate that excludes expected leaks from leak reports.
    #[inline]
    pub fn leak_whitelist(self, whitelist: impl LeakWhitelist) -> Self {
        self.control.set_leak_whitelist(whitelist);
        self
    }

    /// Builds the tracker on top of the given raw allocator.
    #[must_use]
    #[inline]
    pub fn build<A: RawAllocator>(self, raw: A) -> Tracker<A> {
        Tracker::from_parts(raw, self.control)
    }
}

impl fmt::Debug for TrackerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerBuilder")
            .field("control", &self.control)
            .finish()
    }
}
