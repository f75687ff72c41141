//! Helpers shared by unit tests in this package.

use std::io::{self, Write};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::record::AllocationRecord;
use crate::{AllocationInfo, CallSite, LibcAllocator, RawAllocator};

/// Name of the function containing the code at `address`, or an empty string if unknown.
pub(crate) fn function_name(address: usize) -> String {
    let mut name = String::new();

    backtrace::resolve(ptr::with_exposed_provenance_mut(address), |symbol| {
        if name.is_empty() {
            name = symbol.name().map(|n| n.to_string()).unwrap_or_default();
        }
    });

    name
}

/// Output sink whose contents stay readable after a clone of it was given to a tracker.
#[derive(Clone, Debug, Default)]
pub(crate) struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A detached allocation snapshot with the given site and otherwise arbitrary values.
pub(crate) fn info_at(site: CallSite) -> AllocationInfo {
    AllocationRecord {
        address: 0x1000,
        size: 16,
        site,
        sequence: 1,
        stack_trace: None,
    }
    .to_info()
}

/// Raw allocator that never has memory.
#[derive(Debug, Default)]
pub(crate) struct ExhaustedAllocator;

// SAFETY: Never hands out memory, so there is nothing to misuse.
unsafe impl RawAllocator for ExhaustedAllocator {
    fn malloc(&self, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn realloc(&self, _block: NonNull<u8>, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn free(&self, _block: NonNull<u8>) {}
}

/// Raw allocator over libc that counts calls and can be told to start failing.
#[derive(Debug, Default)]
pub(crate) struct CountingAllocator {
    mallocs: AtomicUsize,
    reallocs: AtomicUsize,
    frees: AtomicUsize,
    failing: AtomicBool,
}

impl CountingAllocator {
    pub(crate) fn mallocs(&self) -> usize {
        self.mallocs.load(Ordering::Relaxed)
    }

    pub(crate) fn reallocs(&self) -> usize {
        self.reallocs.load(Ordering::Relaxed)
    }

    pub(crate) fn frees(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }

    pub(crate) fn fail_from_now_on(&self) {
        self.failing.store(true, Ordering::Relaxed);
    }

    fn failing(&self) -> bool {
        self.failing.load(Ordering::Relaxed)
    }
}

// SAFETY: Forwards to the C runtime allocator, which upholds the contract.
unsafe impl RawAllocator for CountingAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.mallocs.fetch_add(1, Ordering::Relaxed);

        if self.failing() {
            return None;
        }

        LibcAllocator.malloc(size)
    }

    unsafe fn realloc(&self, block: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        self.reallocs.fetch_add(1, Ordering::Relaxed);

        if self.failing() {
            return None;
        }

        // SAFETY: Forwarding the caller's guarantee.
        unsafe { LibcAllocator.realloc(block, size) }
    }

    unsafe fn free(&self, block: NonNull<u8>) {
        self.frees.fetch_add(1, Ordering::Relaxed);

        // SAFETY: Forwarding the caller's guarantee.
        unsafe { LibcAllocator.free(block) }
    }
}
