use std::cell::RefCell;
use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::{AllocationInfo, Diagnostic, TracePrinter};

thread_local! {
    // Addresses of the `Control`s whose output this thread holds for a report, innermost last.
    // A callback running inside one tracker's report may trigger a report of another tracker.
    static OUTPUTS_HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Decides whether a leaked allocation is expected and should not count as a leak.
///
/// Register one via [`Control::set_leak_whitelist()`]. Any `Fn(&AllocationInfo) -> bool`
/// closure is a whitelist.
///
/// The file, line, code address and stack trace of the allocation may each be unknown,
/// depending on what the caller supplied and whether stack trace capture was enabled.
///
/// # Examples
///
/// ```
/// use debug_malloc::{AllocationInfo, LibcAllocator, Tracker};
///
/// let tracker = Tracker::builder().autocheck(false).build(LibcAllocator);
///
/// // Blocks allocated by the logging setup live for the whole process.
/// tracker
///     .control()
///     .set_leak_whitelist(|leak: &AllocationInfo| {
///         leak.site().file().is_some_and(|file| file.ends_with("logging.c"))
///     });
/// ```
pub trait LeakWhitelist: Send + Sync + 'static {
    /// Returns `true` if `leak` is expected and must be excluded from the leak count.
    fn is_whitelisted(&self, leak: &AllocationInfo) -> bool;
}

impl<F> LeakWhitelist for F
where
    F: Fn(&AllocationInfo) -> bool + Send + Sync + 'static,
{
    fn is_whitelisted(&self, leak: &AllocationInfo) -> bool {
        self(leak)
    }
}

/// Runtime configuration of a [`Tracker`][crate::Tracker], readable and writable at any time.
///
/// Obtained via [`Tracker::control()`][crate::Tracker::control]. Initial values can also be
/// set with [`TrackerBuilder`][crate::TrackerBuilder].
///
/// | Setting | Default |
/// |---|---|
/// | autocheck | `true` |
/// | verbose | `false` |
/// | output | standard error |
/// | program name | unset |
/// | stack trace depth | 0 (capture disabled) |
/// | trace printer | unset (raw addresses are printed) |
/// | leak whitelist | unset (every leak counts) |
pub struct Control {
    autocheck: AtomicBool,
    verbose: AtomicBool,
    stack_trace_depth: AtomicUsize,
    output: Mutex<Box<dyn Write + Send>>,
    // Diagnostics raised by the thread holding the output, written when it is released.
    deferred: Mutex<Vec<Diagnostic>>,
    program_name: RwLock<Option<Arc<str>>>,
    trace_printer: RwLock<Option<Arc<dyn TracePrinter>>>,
    leak_whitelist: RwLock<Option<Arc<dyn LeakWhitelist>>>,
}

impl Control {
    pub(crate) fn new() -> Self {
        Self {
            autocheck: AtomicBool::new(true),
            verbose: AtomicBool::new(false),
            stack_trace_depth: AtomicUsize::new(0),
            output: Mutex::new(Box::new(io::stderr())),
            deferred: Mutex::new(Vec::new()),
            program_name: RwLock::new(None),
            trace_printer: RwLock::new(None),
            leak_whitelist: RwLock::new(None),
        }
    }

    /// Whether [`Tracker::shutdown()`][crate::Tracker::shutdown] runs a leak check.
    #[must_use]
    pub fn autocheck(&self) -> bool {
        self.autocheck.load(Ordering::Relaxed)
    }

    /// Sets whether [`Tracker::shutdown()`][crate::Tracker::shutdown] runs a leak check.
    pub fn set_autocheck(&self, enabled: bool) {
        self.autocheck.store(enabled, Ordering::Relaxed);
    }

    /// Whether reports include whitelisted leaks and progress lines.
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Sets whether reports include whitelisted leaks and progress lines.
    pub fn set_verbose(&self, enabled: bool) {
        self.verbose.store(enabled, Ordering::Relaxed);
    }

    /// Maximum number of return addresses captured per allocation. Zero disables capture.
    #[must_use]
    pub fn stack_trace_depth(&self) -> usize {
        self.stack_trace_depth.load(Ordering::Relaxed)
    }

    /// Sets the maximum number of return addresses captured per allocation.
    ///
    /// Zero disables capture. Only allocations made after the change are affected.
    pub fn set_stack_trace_depth(&self, depth: usize) {
        self.stack_trace_depth.store(depth, Ordering::Relaxed);
    }

    /// Redirects all diagnostics and reports to `output`.
    ///
    /// The previous output is flushed and dropped.
    pub fn set_output(&self, output: impl Write + Send + 'static) {
        let mut current = self.output.lock();

        if let Err(error) = current.flush() {
            debug!(%error, "failed to flush previous tracker output");
        }

        *current = Box::new(output);
    }

    /// The program name included in leak reports, if set.
    #[must_use]
    pub fn program_name(&self) -> Option<Arc<str>> {
        self.program_name.read().clone()
    }

    /// Sets the program name included in leak reports, typically `argv[0]`.
    pub fn set_program_name(&self, name: impl Into<String>) {
        *self.program_name.write() = Some(Arc::from(name.into()));
    }

    /// Removes the program name from leak reports.
    pub fn clear_program_name(&self) {
        *self.program_name.write() = None;
    }

    /// Registers the printer used for stack traces in leak reports, replacing any previous one.
    pub fn set_trace_printer(&self, printer: impl TracePrinter) {
        *self.trace_printer.write() = Some(Arc::new(printer));
    }

    /// Removes the trace printer. Stack traces are printed as raw addresses afterwards.
    pub fn clear_trace_printer(&self) {
        *self.trace_printer.write() = None;
    }

    /// Registers the leak whitelist, replacing any previous one.
    pub fn set_leak_whitelist(&self, whitelist: impl LeakWhitelist) {
        *self.leak_whitelist.write() = Some(Arc::new(whitelist));
    }

    /// Removes the leak whitelist. Every leak counts afterwards.
    pub fn clear_leak_whitelist(&self) {
        *self.leak_whitelist.write() = None;
    }

    pub(crate) fn trace_printer(&self) -> Option<Arc<dyn TracePrinter>> {
        self.trace_printer.read().clone()
    }

    pub(crate) fn leak_whitelist(&self) -> Option<Arc<dyn LeakWhitelist>> {
        self.leak_whitelist.read().clone()
    }

    /// Locks the output for the duration of one report.
    ///
    /// Diagnostics this control receives on the same thread while the guard is alive are
    /// written after the report, when the guard is dropped.
    pub(crate) fn lock_output(&self) -> OutputGuard<'_> {
        let guard = self.output.lock();
        OUTPUTS_HELD.with_borrow_mut(|held| held.push(self.identity()));

        OutputGuard {
            control: self,
            guard,
        }
    }

    /// Reports a memory bug to the output and as a `tracing` event.
    pub(crate) fn report(&self, diagnostic: &Diagnostic) {
        Self::log_diagnostic(diagnostic);

        if self.output_held_by_current_thread() {
            self.deferred.lock().push(diagnostic.clone());
            return;
        }

        let mut output = self.output.lock();

        if let Err(error) = writeln!(output, "{diagnostic}").and_then(|()| output.flush()) {
            debug!(%error, "failed to write diagnostic to tracker output");
        }
    }

    fn identity(&self) -> usize {
        ptr::from_ref(self).addr()
    }

    fn output_held_by_current_thread(&self) -> bool {
        let identity = self.identity();
        OUTPUTS_HELD.with_borrow(|held| held.contains(&identity))
    }

    #[cfg_attr(test, mutants::skip)] // Only affects tracing output, which tests do not capture.
    pub(crate) fn log_diagnostic(diagnostic: &Diagnostic) {
        warn!(%diagnostic, "memory bug detected");
    }

    /// Replaces the output without flushing the previous one.
    pub(crate) fn replace_output(&mut self, output: Box<dyn Write + Send>) {
        *self.output.get_mut() = output;
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("autocheck", &self.autocheck())
            .field("verbose", &self.verbose())
            .field("stack_trace_depth", &self.stack_trace_depth())
            .field("program_name", &self.program_name())
            .field("trace_printer", &self.trace_printer.read().is_some())
            .field("leak_whitelist", &self.leak_whitelist.read().is_some())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the tracker output for one report.
pub(crate) struct OutputGuard<'a> {
    control: &'a Control,
    guard: MutexGuard<'a, Box<dyn Write + Send>>,
}

impl Deref for OutputGuard<'_> {
    type Target = dyn Write + Send;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for OutputGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

impl Drop for OutputGuard<'_> {
    fn drop(&mut self) {
        let deferred = mem::take(&mut *self.control.deferred.lock());

        for diagnostic in &deferred {
            if let Err(error) = writeln!(self.guard, "{diagnostic}") {
                debug!(%error, "failed to write deferred diagnostic to tracker output");
            }
        }

        if let Err(error) = self.guard.flush() {
            debug!(%error, "failed to flush tracker output");
        }

        let identity = self.control.identity();
        OUTPUTS_HELD.with_borrow_mut(|held| {
            if let Some(position) = held.iter().rposition(|&entry| entry == identity) {
                held.remove(position);
            }
        });
    }
}
