//! Per-thread read trackers.
//!
//! Each thread that reads a cache owns one tracker per cache. The tracker is
//! a sequence counter plus a pointer to the index copy the thread should
//! read. The counter is odd while a read is in flight and even otherwise; a
//! writer that has just republished overwrites every tracker's pointer and
//! then waits for each odd counter it saw to move on before it touches the
//! copy those readers might still hold.
//!
//! Entering a read is a read-modify-write of the counter followed by a load
//! of the pointer. The writer stores the pointer and then snapshots the
//! counter with a read-modify-write of its own. Both RMWs act on the same
//! location, so one reads the other's value: either the writer sees the
//! reader as in flight, or the reader's entry synchronizes with the writer's
//! snapshot and its pointer load sees the new copy.

use std::{
    cell::{Cell, RefCell},
    ptr,
    rc::Rc,
    sync::{
        Arc, Weak,
        atomic::{AtomicPtr, AtomicU64, Ordering},
    },
};

use crossbeam::utils::CachePadded;

/// The half of a tracker the writer sees.
pub(crate) struct TrackerSlot {
    data: CachePadded<SlotData>,
}

struct SlotData {
    sequence: AtomicU64,
    index: AtomicPtr<()>,
}

impl TrackerSlot {
    pub(crate) fn new(index: *const ()) -> Self {
        Self {
            data: CachePadded::new(SlotData {
                sequence: AtomicU64::new(0),
                index: AtomicPtr::new(index.cast_mut()),
            }),
        }
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.data.sequence.load(Ordering::Acquire)
    }

    /// Reads the counter as part of its modification order. Must follow the
    /// writer's `migrate`.
    pub(crate) fn snapshot(&self) -> u64 {
        self.data.sequence.fetch_add(0, Ordering::SeqCst)
    }

    /// Points the owning thread's next read at `index`.
    pub(crate) fn migrate(&self, index: *const ()) {
        self.data.index.store(index.cast_mut(), Ordering::SeqCst);
    }

    fn enter(&self) -> *const () {
        self.data.sequence.fetch_add(1, Ordering::SeqCst);
        self.data.index.load(Ordering::SeqCst).cast_const()
    }

    // Release: the writer acquires this before touching the copy we read.
    fn exit(&self) {
        self.data.sequence.fetch_add(1, Ordering::Release);
    }
}

pub(crate) fn in_flight(sequence: u64) -> bool {
    sequence & 1 == 1
}

/// Writer side that trackers attach to.
pub(crate) trait TrackerRegistry: Send + Sync {
    fn registry_id(&self) -> u64;
    /// Creates and lists a slot pointing at the published copy.
    fn attach(&self) -> Arc<TrackerSlot>;
    fn detach(&self, slot: &Arc<TrackerSlot>);
}

struct LocalTracker {
    registry_id: u64,
    registry: Weak<dyn TrackerRegistry>,
    slot: Arc<TrackerSlot>,
    // Nesting depth of read sections on this thread; only the outermost one
    // moves the counter.
    depth: Cell<u32>,
    current: Cell<*const ()>,
}

impl LocalTracker {
    fn attach<P: TrackerRegistry + 'static>(registry: &Arc<P>) -> Rc<Self> {
        let slot = registry.attach();
        let weak: Weak<P> = Arc::downgrade(registry);
        let weak: Weak<dyn TrackerRegistry> = weak;
        Rc::new(Self {
            registry_id: registry.registry_id(),
            registry: weak,
            slot,
            depth: Cell::new(0),
            current: Cell::new(ptr::null()),
        })
    }

    fn is_live(&self) -> bool {
        self.registry.strong_count() > 0
    }
}

impl Drop for LocalTracker {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.slot);
        }
    }
}

thread_local! {
    static TRACKERS: RefCell<Vec<Rc<LocalTracker>>> = const { RefCell::new(Vec::new()) };
}

/// An in-flight read. Dropping it ends the read, including on unwind.
pub(crate) struct ReadSection {
    tracker: Rc<LocalTracker>,
    index: *const (),
}

impl ReadSection {
    fn enter(tracker: Rc<LocalTracker>) -> Self {
        let depth = tracker.depth.get();
        let index = if depth == 0 {
            let index = tracker.slot.enter();
            tracker.current.set(index);
            index
        } else {
            tracker.current.get()
        };
        tracker.depth.set(depth + 1);
        Self { tracker, index }
    }

    /// The copy this read may use until the section is dropped.
    pub(crate) fn index(&self) -> *const () {
        self.index
    }
}

impl Drop for ReadSection {
    fn drop(&mut self) {
        let depth = self.tracker.depth.get() - 1;
        self.tracker.depth.set(depth);
        if depth == 0 {
            self.tracker.current.set(ptr::null());
            self.tracker.slot.exit();
        }
    }
}

/// Starts a read against `registry` on the calling thread.
///
/// The first read on a thread attaches a tracker, which takes the writer
/// lock once; later reads touch only this thread's slot.
pub(crate) fn enter<P: TrackerRegistry + 'static>(registry: &Arc<P>) -> ReadSection {
    let id = registry.registry_id();
    let tracker = TRACKERS
        .try_with(|trackers| {
            if let Some(tracker) = trackers.borrow().iter().find(|t| t.registry_id == id) {
                return Rc::clone(tracker);
            }
            let tracker = LocalTracker::attach(registry);
            let mut trackers = trackers.borrow_mut();
            // Trackers of dropped caches have nothing left to detach from.
            trackers.retain(|t| t.is_live());
            trackers.push(Rc::clone(&tracker));
            tracker
        })
        // Thread-local storage is already torn down; track just this read.
        .unwrap_or_else(|_| LocalTracker::attach(registry));
    ReadSection::enter(tracker)
}

/// Whether the calling thread is inside a read section of `registry_id`.
pub(crate) fn is_reading(registry_id: u64) -> bool {
    TRACKERS
        .try_with(|trackers| {
            trackers
                .borrow()
                .iter()
                .any(|t| t.registry_id == registry_id && t.depth.get() > 0)
        })
        .unwrap_or(false)
}


// ============================================================================
// Loom model of the read/publish protocol
// ============================================================================
