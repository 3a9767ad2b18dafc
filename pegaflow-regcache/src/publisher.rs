//! Multi-buffered range index.
//!
//! The publisher keeps `num_copies` physical copies of the [`RangeIndex`].
//! Readers only ever dereference the copy their tracker points at; writers,
//! serialized by one mutex, change copies in rotation:
//!
//! 1. mutate the copy after the published one (no tracker points at it),
//! 2. publish it and point every tracker at it,
//! 3. wait until every reader that was mid-read when its tracker was
//!    repointed has finished,
//! 4. mutate the remaining copies, which nobody can be reading any more.
//!
//! After step 4 all copies hold the same entries again.

use std::{
    cell::UnsafeCell,
    sync::{
        Arc,
        atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
};

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    config::RegCacheConfig,
    domain::MemoryRegion,
    error::{RegCacheError, Result},
    index::RangeIndex,
    tracker::{self, TrackerRegistry, TrackerSlot, in_flight},
};

/// Polls after which a wait for readers is reported as slow.
const SLOW_WAIT_POLLS: u64 = 1 << 24;

static NEXT_PUBLISHER_ID: AtomicU64 = AtomicU64::new(1);

struct IndexCopy<R: MemoryRegion>(UnsafeCell<RangeIndex<R>>);

struct WriterState {
    /// Slot of the copy readers are directed to.
    published: usize,
    trackers: Vec<Arc<TrackerSlot>>,
}

pub(crate) struct Publisher<R: MemoryRegion> {
    id: u64,
    copies: Box<[CachePadded<IndexCopy<R>>]>,
    published: CachePadded<AtomicPtr<RangeIndex<R>>>,
    writer: Mutex<WriterState>,
    // Mirrors `WriterState::trackers.len()` so it can be read without the
    // writer lock, including from inside a read section.
    attached: AtomicUsize,
    spin_yield_interval: u32,
}

// SAFETY: the copies are only mutated through `WriterGuard::apply`, which
// holds the writer mutex and never touches a copy a reader can still reach
// (see the module docs). Shared access is read-only.
unsafe impl<R: MemoryRegion> Sync for Publisher<R> {}

impl<R: MemoryRegion> Publisher<R> {
    /// `config` must already be validated.
    pub(crate) fn new(config: &RegCacheConfig) -> Self {
        debug_assert!(config.validate().is_ok());
        let copies: Box<[CachePadded<IndexCopy<R>>]> = (0..config.num_copies)
            .map(|_| CachePadded::new(IndexCopy(UnsafeCell::new(RangeIndex::default()))))
            .collect();
        let published = AtomicPtr::new(copies[0].0.get());
        Self {
            id: NEXT_PUBLISHER_ID.fetch_add(1, Ordering::Relaxed),
            copies,
            published: CachePadded::new(published),
            writer: Mutex::new(WriterState {
                published: 0,
                trackers: Vec::new(),
            }),
            attached: AtomicUsize::new(0),
            spin_yield_interval: config.spin_yield_interval,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn num_copies(&self) -> usize {
        self.copies.len()
    }

    pub(crate) fn tracker_count(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Takes the writer lock. Blocks while another mutation is in flight.
    pub(crate) fn lock(&self) -> WriterGuard<'_, R> {
        WriterGuard {
            publisher: self,
            state: self.writer.lock(),
        }
    }

    /// Runs `f` against the copy published for this thread. Does not block
    /// once the thread's tracker exists.
    pub(crate) fn read<T>(self: &Arc<Self>, f: impl FnOnce(&RangeIndex<R>) -> T) -> T {
        let section = tracker::enter(self);
        // SAFETY: the pointer came from this publisher's tracker slot and so
        // names one of `self.copies`. While `section` is alive our sequence
        // is odd, so no writer mutates that copy until it is dropped.
        let index = unsafe { &*section.index().cast::<RangeIndex<R>>() };
        f(index)
    }

    fn copy_ptr(&self, slot: usize) -> *mut RangeIndex<R> {
        self.copies[slot].0.get()
    }

    /// Spins until each tracker's sequence moved past its snapshot, yielding
    /// every `spin_yield_interval` polls. No timeout: a reader that never
    /// leaves its read section stalls the writer.
    fn wait_for_readers(&self, in_flight: &[(Arc<TrackerSlot>, u64)]) {
        let mut polls: u64 = 0;
        let mut reported = false;
        for (slot, snapshot) in in_flight {
            while slot.sequence() == *snapshot {
                polls += 1;
                if polls % u64::from(self.spin_yield_interval) == 0 {
                    thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
                if !reported && polls >= SLOW_WAIT_POLLS {
                    reported = true;
                    log::warn!(
                        "index writer waiting on a reader for {polls} polls (sequence {snapshot})"
                    );
                }
            }
        }
        if !in_flight.is_empty() {
            log::trace!(
                "waited for {} in-flight readers ({polls} polls)",
                in_flight.len()
            );
        }
    }
}

impl<R: MemoryRegion> TrackerRegistry for Publisher<R> {
    fn registry_id(&self) -> u64 {
        self.id
    }

    fn attach(&self) -> Arc<TrackerSlot> {
        let mut state = self.writer.lock();
        // Under the writer lock the published pointer cannot move, so the new
        // tracker cannot miss a migration.
        let slot = Arc::new(TrackerSlot::new(
            self.published.load(Ordering::SeqCst).cast_const().cast(),
        ));
        state.trackers.push(Arc::clone(&slot));
        self.attached.store(state.trackers.len(), Ordering::Release);
        slot
    }

    fn detach(&self, slot: &Arc<TrackerSlot>) {
        let mut state = self.writer.lock();
        if let Some(pos) = state.trackers.iter().position(|s| Arc::ptr_eq(s, slot)) {
            state.trackers.swap_remove(pos);
            self.attached.store(state.trackers.len(), Ordering::Release);
        }
    }
}

/// Exclusive access to the index copies for one mutation.
pub(crate) struct WriterGuard<'a, R: MemoryRegion> {
    publisher: &'a Publisher<R>,
    state: MutexGuard<'a, WriterState>,
}

impl<R: MemoryRegion> WriterGuard<'_, R> {
    fn staging_slot(&self) -> usize {
        (self.state.published + 1) % self.publisher.num_copies()
    }

    /// The copy the next mutation starts with. All copies agree between
    /// mutations, so this is also the current contents of the index.
    pub(crate) fn staging(&self) -> &RangeIndex<R> {
        // SAFETY: copies are only mutated by `apply`, which needs `&mut self`
        // and so cannot run while this borrow lives.
        unsafe { &*self.publisher.copy_ptr(self.staging_slot()) }
    }

    /// Applies `op` to every copy, publishing the first one changed.
    ///
    /// A size mismatch between copies afterwards is a [`RegCacheError::Consistency`];
    /// all copies have still been visited when it is returned.
    pub(crate) fn apply(
        &mut self,
        operation: &'static str,
        mut op: impl FnMut(&mut RangeIndex<R>),
    ) -> Result<()> {
        let publisher = self.publisher;
        let num_copies = publisher.num_copies();
        let first = self.staging_slot();

        // SAFETY: every tracker was pointed at the published copy by the
        // previous mutation (or at creation) and every reader in flight at
        // that point was waited out, so nobody can be reading `first`.
        let expected = {
            let index = unsafe { &mut *publisher.copy_ptr(first) };
            op(index);
            index.len()
        };

        let fresh = publisher.copy_ptr(first);
        publisher.published.store(fresh, Ordering::SeqCst);
        self.state.published = first;

        let mut in_flight_readers = Vec::new();
        for slot in &self.state.trackers {
            slot.migrate(fresh.cast_const().cast());
            let sequence = slot.snapshot();
            if in_flight(sequence) {
                in_flight_readers.push((Arc::clone(slot), sequence));
            }
        }
        publisher.wait_for_readers(&in_flight_readers);

        let mut mismatch = None;
        for offset in 1..num_copies {
            let slot = (first + offset) % num_copies;
            // SAFETY: all trackers now point at `first`; readers that were
            // still on another copy when they were repointed have left their
            // read section, and new reads load the repointed slot.
            let index = unsafe { &mut *publisher.copy_ptr(slot) };
            op(index);
            let found = index.len();
            if found != expected && mismatch.is_none() {
                mismatch = Some((slot, found));
            }
        }

        log::trace!(
            "published index copy {first} after {operation}: {expected} ranges, {} trackers",
            self.state.trackers.len()
        );

        match mismatch {
            None => Ok(()),
            Some((copy, found)) => {
                log::error!(
                    "{operation}: copy {copy} has {found} ranges, copy {first} has {expected}"
                );
                Err(RegCacheError::Consistency {
                    operation,
                    copy,
                    expected,
                    found,
                })
            }
        }
    }
}
