use std::collections::BTreeMap;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use foldhash::{HashMap, HashMapExt, HashSet, HashSetExt};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::record::AllocationRecord;
use crate::use_counter::current_thread_suspended;
use crate::{
    AllocationInfo, CallSite, Control, Diagnostic, Error, GuardDamage, LibcAllocator,
    RawAllocator, Result, StackBoundary, StackTrace, Suspension, TrackerBuilder, guard,
};

/// Detects memory leaks, heap corruption and invalid frees among the allocations made
/// through it.
///
/// Every allocation made through a tracker is recorded in its table together with its size,
/// call site and (optionally) a stack trace, and is surrounded by guard bytes. Frees are
/// matched against the table and the guards are verified. At any point,
/// [`check_leaks()`](Self::check_leaks) reports what is still allocated and
/// [`check_corruption()`](Self::check_corruption) reports damaged guards.
///
/// Problems found are reported as text to the configured output (standard error by default)
/// and never interrupt the program. See [`Diagnostic`] for the kinds of problems reported.
///
/// The tracker is a context object: one tracker sees only the allocations made through it.
/// When dropped (or when [`shutdown()`](Self::shutdown) is called), it runs a final leak check
/// if autocheck is enabled.
///
/// # Examples
///
/// ```
/// use debug_malloc::{CallSite, LibcAllocator, Tracker};
///
/// let tracker = Tracker::builder().autocheck(false).build(LibcAllocator);
///
/// let kept = tracker.allocate_at(10, CallSite::new("main.c", 3)).unwrap();
/// let freed = tracker.allocate_at(20, CallSite::new("main.c", 4)).unwrap();
///
/// // SAFETY: The block came from this tracker and is freed once.
/// unsafe { tracker.free(freed.as_ptr()) };
///
/// assert_eq!(tracker.current_mem_alloc(), 10);
/// assert_eq!(tracker.check_leaks(), 1);
/// # // SAFETY: The block came from this tracker and is freed once.
/// # unsafe { tracker.free(kept.as_ptr()) };
/// ```
///
/// # Thread safety
///
/// The tracker is thread-safe. All table updates and checks are serialized by one lock. A check
/// holds it only while taking a snapshot of the table, so checks running concurrently with
/// allocation activity report whatever was live at that moment.
pub struct Tracker<A: RawAllocator> {
    raw: A,
    pub(crate) state: Mutex<TrackerState>,
    control: Control,
    shut_down: AtomicBool,
}

impl Tracker<LibcAllocator> {
    /// Creates a tracker with default settings on top of the C runtime allocator.
    #[must_use]
    pub fn system() -> Self {
        Self::new(LibcAllocator)
    }

    /// Creates a builder for configuring and constructing a [`Tracker`].
    ///
    /// # Examples
    ///
    /// ```
    /// use debug_malloc::{LibcAllocator, Tracker};
    ///
    /// let tracker = Tracker::builder()
    ///     .verbose(true)
    ///     .program_name("./app")
    ///     .stack_trace_depth(16)
    ///     .build(LibcAllocator);
    ///
    /// assert!(tracker.control().verbose());
    /// ```
    #[inline]
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }
}

impl<A: RawAllocator> Tracker<A> {
    /// Creates a tracker with default settings on top of the given raw allocator.
    #[must_use]
    pub fn new(raw: A) -> Self {
        Self::from_parts(raw, Control::new())
    }

    pub(crate) fn from_parts(raw: A, control: Control) -> Self {
        debug!(?control, "allocation tracker created");

        Self {
            raw,
            state: Mutex::new(TrackerState::new()),
            control,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Runtime configuration of this tracker.
    #[must_use]
    pub fn control(&self) -> &Control {
        &self.control
    }

    /// The raw allocator that supplies memory to this tracker.
    #[must_use]
    pub fn raw_allocator(&self) -> &A {
        &self.raw
    }

    /// Allocates `size` bytes, recording the caller's source location as the call site.
    ///
    /// See [`allocate_at()`](Self::allocate_at).
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if the raw allocator has no memory.
    #[track_caller]
    #[inline(never)]
    pub fn allocate_here(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_from(size, CallSite::caller(), StackBoundary::here())
    }

    /// Allocates `size` bytes and records the allocation as made at `site`.
    ///
    /// The returned block has the alignment guarantees of the raw allocator. It must be
    /// released with [`free()`](Self::free) or resized with [`reallocate()`](Self::reallocate)
    /// of the same tracker.
    ///
    /// While tracking is suspended (see [`suspend()`](Self::suspend)), the request is passed to
    /// the raw allocator unmodified and not recorded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if the raw allocator has no memory. Failed
    /// allocations are not recorded and not reported.
    #[inline(never)]
    pub fn allocate_at(&self, size: usize, site: CallSite) -> Result<NonNull<u8>> {
        self.allocate_from(size, site, StackBoundary::here())
    }

    /// Like [`allocate_at()`](Self::allocate_at), for wrappers that forward requests on behalf
    /// of their own callers.
    ///
    /// The stack trace of the allocation leaves out every frame at or below `boundary`, so a
    /// wrapper that takes the boundary in its own frame does not show up in leak reports.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if the raw allocator has no memory.
    pub fn allocate_from(
        &self,
        size: usize,
        site: CallSite,
        boundary: StackBoundary,
    ) -> Result<NonNull<u8>> {
        if self.is_suspended(&self.state.lock()) {
            return self.allocate_untracked(size);
        }

        let stack_trace = StackTrace::capture(self.control.stack_trace_depth(), boundary);

        let block_size = guard::block_size(size).ok_or(Error::AllocationFailed { size })?;
        let block = self
            .raw
            .malloc(block_size)
            .ok_or(Error::AllocationFailed { size })?;

        // SAFETY: The block was just allocated with room for the payload and both guards.
        let payload = unsafe { guard::arm(block, size) };

        let sequence = {
            let mut state = self.state.lock();
            state.total_alloc_count = state.total_alloc_count.saturating_add(1);
            state.insert_record(payload, size, site, stack_trace)
        };

        trace!(address = payload.as_ptr().addr(), size, sequence, %site, "tracked allocation");

        Ok(payload)
    }

    fn allocate_untracked(&self, size: usize) -> Result<NonNull<u8>> {
        let block = self
            .raw
            .malloc(size)
            .ok_or(Error::AllocationFailed { size })?;

        self.state.lock().insert_foreign(block);

        trace!(
            address = block.as_ptr().addr(),
            size,
            "untracked allocation while suspended"
        );

        Ok(block)
    }

    /// Resizes a block, recording `site` as its new call site.
    ///
    /// The contents are preserved up to the smaller of the old and new sizes. The result may be
    /// at a different address, in which case `ptr` must no longer be used.
    ///
    /// * A null `ptr` makes this an allocation of `size` bytes. It counts towards
    ///   [`total_alloc_count()`](Self::total_alloc_count).
    /// * A `size` of zero makes this a [`free()`](Self::free) of `ptr` and returns `Ok(None)`.
    /// * Resizing a tracked block keeps its sequence number and does not count as a new
    ///   allocation. Damaged guards are reported before the block is resized.
    /// * Resizing a block the tracker does not know is reported as an invalid reallocation.
    ///   The request is still forwarded to the raw allocator and the result is untracked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if the raw allocator has no memory, in which case
    /// the original block is left unchanged and still tracked.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this tracker's allocate or reallocate
    /// methods that has not yet been freed, or a pointer that the raw allocator accepts.
    #[inline(never)]
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        size: usize,
        site: CallSite,
    ) -> Result<Option<NonNull<u8>>> {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { self.reallocate_from(ptr, size, site, StackBoundary::here()) }
    }

    /// Like [`reallocate()`](Self::reallocate), for wrappers that forward requests on behalf
    /// of their own callers. See [`allocate_from()`](Self::allocate_from) for `boundary`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if the raw allocator has no memory, in which case
    /// the original block is left unchanged and still tracked.
    ///
    /// # Safety
    ///
    /// The same as for [`reallocate()`](Self::reallocate).
    pub unsafe fn reallocate_from(
        &self,
        ptr: *mut u8,
        size: usize,
        site: CallSite,
        boundary: StackBoundary,
    ) -> Result<Option<NonNull<u8>>> {
        let Some(payload) = NonNull::new(ptr) else {
            return self.allocate_from(size, site, boundary).map(Some);
        };

        if size == 0 {
            // SAFETY: Forwarding the caller's guarantee.
            unsafe {
                self.free(ptr);
            }
            return Ok(None);
        }

        let address = ptr.addr();
        let stack_trace = StackTrace::capture(self.control.stack_trace_depth(), boundary);

        let mut state = self.state.lock();

        let Some(sequence) = state.sequence_of(address) else {
            let suspended = self.is_suspended(&state);
            let was_foreign = state.foreign.remove(&address);
            drop(state);

            // SAFETY: Forwarding the caller's guarantee.
            return unsafe { self.reallocate_untracked(payload, size, suspended, was_foreign) };
        };

        let old_size = state.size_of(sequence);

        // SAFETY: The record is live, so its payload was armed and the block is allocated.
        let damage = unsafe { guard::inspect(payload, old_size) };

        let resized = guard::block_size(size).and_then(|block_size| {
            // SAFETY: The block belongs to a live record, so it came from the raw allocator
            // and has not been freed. We hold the lock, so nobody else can release it.
            unsafe { self.raw.realloc(guard::block_of(payload), block_size) }
        });

        let result = resized.map(|block| {
            // SAFETY: The block was just resized to hold the payload and both guards. We re-arm
            // both guards so that damage reported here is not reported again.
            let new_payload = unsafe { guard::arm(block, size) };
            state.relocate_record(sequence, new_payload, size, site, stack_trace);
            new_payload
        });

        drop(state);

        if let Some(damage) = damage {
            self.report_corruption(address, old_size, sequence, site, damage);
        }

        match result {
            Some(new_payload) => {
                trace!(
                    old_address = address,
                    new_address = new_payload.as_ptr().addr(),
                    old_size,
                    size,
                    sequence,
                    "tracked reallocation"
                );
                Ok(Some(new_payload))
            }
            None => Err(Error::AllocationFailed { size }),
        }
    }

    /// # Safety
    ///
    /// `payload` must be a pointer the raw allocator accepts.
    unsafe fn reallocate_untracked(
        &self,
        payload: NonNull<u8>,
        size: usize,
        suspended: bool,
        was_foreign: bool,
    ) -> Result<Option<NonNull<u8>>> {
        let address = payload.as_ptr().addr();

        if !suspended {
            self.control
                .report(&Diagnostic::InvalidRealloc { address });
        }

        // SAFETY: Forwarding the caller's guarantee.
        let Some(block) = (unsafe { self.raw.realloc(payload, size) }) else {
            if was_foreign {
                self.state.lock().insert_foreign(payload);
            }

            return Err(Error::AllocationFailed { size });
        };

        self.state.lock().insert_foreign(block);

        Ok(Some(block))
    }

    /// Releases a block.
    ///
    /// * A null `ptr` is ignored.
    /// * A tracked block has its guards verified, then it is released even if they were
    ///   damaged.
    /// * A block handed out while tracking was suspended is released and, unless tracking is
    ///   suspended now, reported as an untracked free.
    /// * Any other pointer is reported as an invalid or double free and is not released.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, a pointer returned by this tracker, or a pointer the caller wants
    /// diagnosed. If tracking is suspended, unknown pointers are passed to the raw allocator,
    /// so they must be acceptable to it.
    #[inline(never)]
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };

        let address = ptr.addr();
        let mut state = self.state.lock();

        if let Some(record) = state.remove_record(address) {
            drop(state);

            // SAFETY: The record was live, so its payload was armed and the block is allocated.
            // The record is gone from the table, so nobody else can reach the block now.
            let damage = unsafe { guard::inspect(payload, record.size) };

            if let Some(damage) = damage {
                self.report_corruption(address, record.size, record.sequence, record.site, damage);
            }

            trace!(address, size = record.size, sequence = record.sequence, "tracked free");

            // SAFETY: The block came from the raw allocator and was removed from the table,
            // so it is released exactly once.
            unsafe {
                self.raw.free(guard::block_of(payload));
            }

            return;
        }

        let suspended = self.is_suspended(&state);
        let was_foreign = state.foreign.remove(&address);
        drop(state);

        if !suspended {
            let diagnostic = if was_foreign {
                Diagnostic::UntrackedFree { address }
            } else {
                Diagnostic::InvalidOrDoubleFree { address }
            };

            self.control.report(&diagnostic);
        }

        if was_foreign || suspended {
            // SAFETY: Foreign blocks came from the raw allocator unmodified. Unknown pointers
            // freed while suspended are passed through as the caller requested.
            unsafe {
                self.raw.free(payload);
            }
        }
    }

    fn report_corruption(
        &self,
        address: usize,
        size: usize,
        sequence: u64,
        site: CallSite,
        damage: GuardDamage,
    ) {
        self.control.report(&Diagnostic::CorruptionDetected {
            address,
            size,
            sequence,
            site,
            damage,
        });
    }

    /// Increments the use depth, suspending tracking for all threads until a matching
    /// [`decrement_use()`](Self::decrement_use).
    ///
    /// Prefer [`suspend()`](Self::suspend), which cannot be left unbalanced.
    pub fn increment_use(&self) {
        let mut state = self.state.lock();
        state.use_depth = state.use_depth.saturating_add(1);
    }

    /// Decrements the use depth, resuming tracking once it is back at zero.
    ///
    /// Decrementing below zero is a usage error. It is not corrected and is reported by every
    /// check until balanced again. Tracking stays suspended meanwhile.
    pub fn decrement_use(&self) {
        let mut state = self.state.lock();
        state.use_depth = state.use_depth.saturating_sub(1);

        if state.use_depth < 0 {
            debug!(depth = state.use_depth, "use depth dropped below zero");
        }
    }

    /// The current use depth. Tracking is suspended while this is not zero.
    #[must_use]
    pub fn use_depth(&self) -> i64 {
        self.state.lock().use_depth
    }

    /// Suspends tracking for all threads until the returned token is dropped.
    ///
    /// Allocations made while suspended are passed to the raw allocator unmodified and not
    /// recorded. Suspensions nest.
    ///
    /// # Examples
    ///
    /// ```
    /// use debug_malloc::{LibcAllocator, Tracker};
    ///
    /// let tracker = Tracker::builder().autocheck(false).build(LibcAllocator);
    ///
    /// let block = {
    ///     let _suspension = tracker.suspend();
    ///     tracker.allocate_here(32).unwrap()
    /// };
    ///
    /// assert_eq!(tracker.use_depth(), 0);
    /// assert_eq!(tracker.live_allocation_count(), 0);
    /// # // SAFETY: The block came from this tracker.
    /// # unsafe { tracker.free(block.as_ptr()) };
    /// ```
    pub fn suspend(&self) -> Suspension<'_, A> {
        Suspension::new(self)
    }

    /// Whether allocations made by the current thread right now would be tracked.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        !self.is_suspended(&self.state.lock())
    }

    fn is_suspended(&self, state: &TrackerState) -> bool {
        state.use_depth != 0 || current_thread_suspended() || self.shut_down.load(Ordering::Acquire)
    }

    /// Total payload bytes of all live tracked allocations.
    #[must_use]
    pub fn current_mem_alloc(&self) -> usize {
        self.state.lock().current_bytes
    }

    /// Number of tracked allocations made since the tracker was created.
    ///
    /// Reallocations of tracked blocks do not count. Reallocations of a null pointer do.
    #[must_use]
    pub fn total_alloc_count(&self) -> usize {
        self.state.lock().total_alloc_count
    }

    /// Number of live tracked allocations.
    #[must_use]
    pub fn live_allocation_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Snapshots of all live tracked allocations, in allocation order.
    #[must_use]
    pub fn live_allocations(&self) -> Vec<AllocationInfo> {
        self.state
            .lock()
            .records
            .values()
            .map(AllocationRecord::to_info)
            .collect()
    }

    /// Ends tracking, running a leak check if autocheck is enabled.
    ///
    /// Returns the number of leaks found, or `None` if autocheck is disabled or the tracker
    /// was already shut down. This is also called when the tracker is dropped.
    ///
    /// After shutdown, new allocations are passed to the raw allocator untracked. Blocks that
    /// were tracked before can still be freed normally.
    pub fn shutdown(&self) -> Option<usize> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return None;
        }

        debug!(
            live_allocations = self.live_allocation_count(),
            "allocation tracker shutting down"
        );

        self.control.autocheck().then(|| self.check_leaks())
    }
}

impl<A: RawAllocator> Drop for Tracker<A> {
    fn drop(&mut self) {
        _ = self.shutdown();
    }
}

impl<A: RawAllocator> fmt::Debug for Tracker<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("raw", &self.raw)
            .field("state", &*self.state.lock())
            .field("control", &self.control)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

/// Everything guarded by the tracker lock.
pub(crate) struct TrackerState {
    /// Live records keyed by sequence number, which keeps reports in allocation order.
    pub(crate) records: BTreeMap<u64, AllocationRecord>,

    /// Payload address to sequence number, for every entry in `records`.
    by_address: HashMap<usize, u64>,

    /// Blocks handed out untracked. Never overlaps with `by_address`.
    foreign: HashSet<usize>,

    current_bytes: usize,
    total_alloc_count: usize,
    next_sequence: u64,
    pub(crate) use_depth: i64,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            by_address: HashMap::new(),
            foreign: HashSet::new(),
            current_bytes: 0,
            total_alloc_count: 0,
            next_sequence: 1,
            use_depth: 0,
        }
    }

    fn sequence_of(&self, address: usize) -> Option<u64> {
        self.by_address.get(&address).copied()
    }

    fn size_of(&self, sequence: u64) -> usize {
        self.records.get(&sequence).map_or(0, |record| record.size)
    }

    /// Records a new tracked payload and returns its sequence number.
    fn insert_record(
        &mut self,
        payload: NonNull<u8>,
        size: usize,
        site: CallSite,
        stack_trace: Option<StackTrace>,
    ) -> u64 {
        let address = payload.as_ptr().expose_provenance();

        // The raw allocator only reuses an address after releasing it, so any entry still
        // registered here was released behind our back.
        self.forget_stale(address);

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);

        self.records.insert(
            sequence,
            AllocationRecord {
                address,
                size,
                site,
                sequence,
                stack_trace,
            },
        );
        self.by_address.insert(address, sequence);
        self.current_bytes = self.current_bytes.saturating_add(size);

        sequence
    }

    fn remove_record(&mut self, address: usize) -> Option<AllocationRecord> {
        let sequence = self.by_address.remove(&address)?;
        let record = self.records.remove(&sequence)?;
        self.current_bytes = self.current_bytes.saturating_sub(record.size);

        Some(record)
    }

    /// Updates a record in place after its block was resized, keeping its sequence number.
    fn relocate_record(
        &mut self,
        sequence: u64,
        new_payload: NonNull<u8>,
        new_size: usize,
        site: CallSite,
        stack_trace: Option<StackTrace>,
    ) {
        let new_address = new_payload.as_ptr().expose_provenance();

        let Some(old_address) = self.records.get(&sequence).map(|record| record.address) else {
            return;
        };

        self.by_address.remove(&old_address);

        if new_address != old_address {
            self.forget_stale(new_address);
        }

        let Some(record) = self.records.get_mut(&sequence) else {
            return;
        };

        self.current_bytes = self
            .current_bytes
            .saturating_sub(record.size)
            .saturating_add(new_size);

        record.address = new_address;
        record.size = new_size;
        record.site = site;
        record.stack_trace = stack_trace;

        self.by_address.insert(new_address, sequence);
    }

    fn insert_foreign(&mut self, block: NonNull<u8>) {
        let address = block.as_ptr().addr();

        self.forget_stale(address);
        self.foreign.insert(address);
    }

    fn forget_stale(&mut self, address: usize) {
        if let Some(stale) = self.remove_record(address) {
            debug!(
                address,
                sequence = stale.sequence,
                "dropping record of a block that was released without the tracker"
            );
        }

        self.foreign.remove(&address);
    }

    /// Payload pointer of a live record, for reading its guards.
    pub(crate) fn payload_of(record: &AllocationRecord) -> Option<NonNull<u8>> {
        NonNull::new(ptr::with_exposed_provenance_mut(record.address))
    }
}

impl fmt::Debug for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerState")
            .field("live_allocations", &self.records.len())
            .field("untracked_allocations", &self.foreign.len())
            .field("current_bytes", &self.current_bytes)
            .field("total_alloc_count", &self.total_alloc_count)
            .field("next_sequence", &self.next_sequence)
            .field("use_depth", &self.use_depth)
            .finish()
    }
}
