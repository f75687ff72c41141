use std::fmt;
use std::panic::Location;

use crate::StackTrace;

/// Source location of the code that requested an allocation.
///
/// Either part may be unknown: `file` is `None` when no file name was supplied and `line` is
/// zero when no line number was supplied.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct CallSite {
    file: Option<&'static str>,
    line: u32,
}

impl CallSite {
    /// A call site with the given file and line.
    #[must_use]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self {
            file: Some(file),
            line,
        }
    }

    /// A call site with no location information.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            file: None,
            line: 0,
        }
    }

    /// A call site where either part may be unknown.
    #[must_use]
    pub const fn from_parts(file: Option<&'static str>, line: u32) -> Self {
        Self { file, line }
    }

    /// The location of the caller, as reported by `#[track_caller]`.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }

    /// The file name, if known.
    #[must_use]
    pub const fn file(&self) -> Option<&'static str> {
        self.file
    }

    /// The line number, or zero if unknown.
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.file, self.line) {
            (Some(file), 0) => write!(f, "{file}"),
            (Some(file), line) => write!(f, "{file}:{line}"),
            (None, 0) => write!(f, "<unknown>"),
            (None, line) => write!(f, "<unknown>:{line}"),
        }
    }
}

/// Metadata of one live tracked allocation, owned by the tracker's table.
#[derive(Debug)]
pub(crate) struct AllocationRecord {
    /// Payload address handed to the caller. Unique among live records.
    pub(crate) address: usize,

    /// Requested payload size, excluding guards.
    pub(crate) size: usize,

    pub(crate) site: CallSite,

    /// Stays the same across reallocations.
    pub(crate) sequence: u64,

    pub(crate) stack_trace: Option<StackTrace>,
}

impl AllocationRecord {
    pub(crate) fn to_info(&self) -> AllocationInfo {
        AllocationInfo {
            address: self.address,
            size: self.size,
            site: self.site,
            sequence: self.sequence,
            stack_trace: self.stack_trace.clone(),
        }
    }
}

/// A snapshot of one live tracked allocation.
///
/// This is what leak whitelists receive and what [`Tracker::live_allocations()`][1] returns.
/// It is detached from the tracker, so it stays valid after the allocation is freed.
///
/// [1]: crate::Tracker::live_allocations
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocationInfo {
    address: usize,
    size: usize,
    site: CallSite,
    sequence: u64,
    stack_trace: Option<StackTrace>,
}

impl AllocationInfo {
    /// Payload address handed to the application.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Requested payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Where the allocation was requested (or last reallocated).
    #[must_use]
    pub fn site(&self) -> CallSite {
        self.site
    }

    /// Creation order of the allocation. The first tracked allocation is number 1.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Return addresses captured when the allocation was made, if capture was enabled.
    #[must_use]
    pub fn stack_trace(&self) -> Option<&StackTrace> {
        self.stack_trace.as_ref()
    }

    /// Address of the code that requested the allocation (the innermost captured frame).
    ///
    /// Only known if a stack trace was captured.
    #[must_use]
    pub fn code_address(&self) -> Option<usize> {
        self.stack_trace
            .as_ref()
            .and_then(|trace| trace.frames().first().copied())
    }
}
