//! Leak and corruption reports over the tracker's table.

use std::io::{self, Write};

use tracing::{debug, warn};

use crate::record::AllocationRecord;
use crate::stack_trace::print_raw_trace;
use crate::tracker::TrackerState;
use crate::{
    AllocationInfo, Control, Diagnostic, RawAllocator, Tracker, guard, suspend_current_thread,
};

impl<A: RawAllocator> Tracker<A> {
    /// Reports every live tracked allocation that is not whitelisted and returns how many
    /// there are.
    ///
    /// Each leak is written to the output with its address, size, sequence number, program
    /// name (if set) and call site, followed by its stack trace if one was captured. The
    /// registered [`LeakWhitelist`][crate::LeakWhitelist] can exclude leaks from the count.
    /// In verbose mode, whitelisted leaks are still printed and tagged as such.
    ///
    /// Records are never removed by this, so repeated calls report the same leaks. An
    /// unbalanced use depth is also reported here.
    ///
    /// The whitelist and trace printer are called without the tracker lock held and with
    /// tracking suspended on the current thread.
    ///
    /// # Examples
    ///
    /// ```
    /// use debug_malloc::{AllocationInfo, CallSite, LibcAllocator, Tracker};
    ///
    /// let tracker = Tracker::builder()
    ///     .autocheck(false)
    ///     .output(std::io::sink())
    ///     .leak_whitelist(|leak: &AllocationInfo| leak.site().line() == 2)
    ///     .build(LibcAllocator);
    ///
    /// let _a = tracker.allocate_at(8, CallSite::new("lib.c", 1)).unwrap();
    /// let _b = tracker.allocate_at(8, CallSite::new("lib.c", 2)).unwrap();
    ///
    /// assert_eq!(tracker.check_leaks(), 1);
    /// ```
    pub fn check_leaks(&self) -> usize {
        let (leaks, use_depth) = {
            let state = self.state.lock();
            let leaks: Vec<AllocationInfo> = state
                .records
                .values()
                .map(AllocationRecord::to_info)
                .collect();

            (leaks, state.use_depth)
        };

        let _suspension = suspend_current_thread();
        let control = self.control();
        let whitelist = control.leak_whitelist();
        let printer = control.trace_printer();
        let program_name = control.program_name();
        let verbose = control.verbose();

        let mut output = control.lock_output();
        let mut count: usize = 0;

        if use_depth < 0 {
            emit(&mut *output, &Diagnostic::UnmatchedUseCount { depth: use_depth });
        }

        for leak in &leaks {
            let whitelisted = whitelist
                .as_ref()
                .is_some_and(|whitelist| whitelist.is_whitelisted(leak));

            if whitelisted && !verbose {
                continue;
            }

            if !whitelisted {
                count = count.saturating_add(1);
            }

            let written = write_leak(
                &mut *output,
                leak,
                program_name.as_deref(),
                whitelisted,
            )
            .and_then(|()| match (leak.stack_trace(), printer.as_ref()) {
                (Some(trace), Some(printer)) => printer.print_trace(&mut *output, trace),
                (Some(trace), None) => print_raw_trace(&mut *output, trace),
                (None, _) => Ok(()),
            });

            if let Err(error) = written {
                debug!(%error, "failed to write leak report line");
            }
        }

        let summary = if count > 0 {
            writeln!(
                output,
                "*** {count} {} found",
                if count == 1 { "leak" } else { "leaks" }
            )
        } else if verbose {
            writeln!(output, "No memory leaks detected.")
        } else {
            Ok(())
        };

        if let Err(error) = summary {
            debug!(%error, "failed to write leak report summary");
        }

        if count > 0 {
            warn!(leaks = count, "memory leaks detected");
        } else {
            debug!(live = leaks.len(), "leak check found nothing to report");
        }

        count
    }

    /// Verifies the guards of every live tracked allocation and returns how many are damaged.
    ///
    /// Each damaged allocation is reported with its call site. In verbose mode, the scan is
    /// framed by start and end lines. Nothing is modified, so damage found here is reported
    /// again by the next scan and when the allocation is freed.
    pub fn check_corruption(&self) -> usize {
        let control = self.control();
        let verbose = control.verbose();

        let mut output = control.lock_output();

        if verbose {
            write_or_log(
                writeln!(output, "*** Checking for memory corruption: START"),
                "corruption scan header",
            );
        }

        let mut found: usize = 0;

        {
            let state = self.state.lock();

            if state.use_depth < 0 {
                emit(
                    &mut *output,
                    &Diagnostic::UnmatchedUseCount {
                        depth: state.use_depth,
                    },
                );
            }

            for record in state.records.values() {
                let Some(payload) = TrackerState::payload_of(record) else {
                    continue;
                };

                // SAFETY: The record is live and we hold the lock, so its block is allocated,
                // armed and cannot be released while we read the guards.
                let Some(damage) = (unsafe { guard::inspect(payload, record.size) }) else {
                    continue;
                };

                found = found.saturating_add(1);

                emit(
                    &mut *output,
                    &Diagnostic::CorruptionDetected {
                        address: record.address,
                        size: record.size,
                        sequence: record.sequence,
                        site: record.site,
                        damage,
                    },
                );
            }
        }

        if verbose {
            write_or_log(
                writeln!(output, "*** Checking for memory corruption: {found} FOUND"),
                "corruption scan footer",
            );
        }

        found
    }
}

fn write_leak(
    out: &mut dyn Write,
    leak: &AllocationInfo,
    program_name: Option<&str>,
    whitelisted: bool,
) -> io::Result<()> {
    write!(
        out,
        "Leaked object at {:#x} (size {}, seq #{})",
        leak.address(),
        leak.size(),
        leak.sequence()
    )?;

    if let Some(program_name) = program_name {
        write!(out, " {program_name}")?;
    }

    write!(out, " {}", leak.site())?;

    if whitelisted {
        write!(out, " (whitelisted)")?;
    }

    writeln!(out)
}

/// Writes a diagnostic to an output that this thread already holds.
fn emit(out: &mut dyn Write, diagnostic: &Diagnostic) {
    Control::log_diagnostic(diagnostic);
    write_or_log(writeln!(out, "{diagnostic}"), "diagnostic");
}

fn write_or_log(result: io::Result<()>, what: &'static str) {
    if let Err(error) = result {
        debug!(%error, what, "failed to write to tracker output");
    }
}
