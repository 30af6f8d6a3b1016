//! Thread records and contexts
//!
//! Every OS thread that allocates is attached to a collector, which
//! creates a `ThreadRecord` holding its allocation points, its green-thread
//! stacks and its finalizer queue. The mutator works through a
//! `ThreadContext`, an explicit handle that cannot leave the thread.
//!
//! `ThreadContext::current` finds the record again without the caller
//! passing it around. A thread-local cache remembers the last collector
//! the thread attached to; anything else falls back to the registry.

use super::finalizer::{DrainRequest, FinalizerQueue};
use super::safepoint::SafeRegion;
use crate::allocator::ApSet;
use crate::backend::Backend;
use crate::error::{GcError, Result};
use crate::gc::Gc;
use crate::scan::StackSet;
use crossbeam::channel::{self, Receiver, Sender};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// Collector-side state of one attached OS thread
pub struct ThreadRecord {
    id: ThreadId,
    stacks: Arc<StackSet>,
    /// Stack pointer published by the scheduler at the last switch
    extent: AtomicUsize,
    pub(crate) aps: Mutex<ApSet>,
    pub(crate) finalizers: FinalizerQueue,
    drain_tx: Sender<DrainRequest>,
    drain_rx: Receiver<DrainRequest>,
    /// Object whose deferred finalizer is running on this thread
    pub(crate) in_flight: AtomicUsize,
    alloc_count: AtomicUsize,
    attached: AtomicBool,
    /// Inside a safe region, not counted as running
    pub(crate) safe: AtomicBool,
}

impl ThreadRecord {
    pub(crate) fn new(stacks: Arc<StackSet>, aps: ApSet, finalizer_capacity: usize) -> Self {
        let (drain_tx, drain_rx) = channel::unbounded();
        Self {
            id: std::thread::current().id(),
            stacks,
            extent: AtomicUsize::new(0),
            aps: Mutex::new(aps),
            finalizers: FinalizerQueue::new(finalizer_capacity),
            drain_tx,
            drain_rx,
            in_flight: AtomicUsize::new(0),
            alloc_count: AtomicUsize::new(0),
            attached: AtomicBool::new(true),
            safe: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn stacks(&self) -> &Arc<StackSet> {
        &self.stacks
    }

    /// Stack pointer the running green thread was last seen at
    pub fn extent(&self) -> usize {
        self.extent.load(Ordering::Acquire)
    }

    pub fn set_extent(&self, sp: usize) {
        self.extent.store(sp, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Whether the thread is in foreign or blocking code
    pub fn in_safe_region(&self) -> bool {
        self.safe.load(Ordering::Acquire)
    }

    pub(crate) fn mark_detached(&self) {
        self.attached.store(false, Ordering::Release);
    }

    /// Count one allocation, returning the new total
    #[inline]
    pub(crate) fn count_allocation(&self) -> usize {
        self.alloc_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn allocations(&self) -> usize {
        self.alloc_count.load(Ordering::Relaxed)
    }

    /// Ask this thread to drain its finalizer queue
    pub(crate) fn request_drain(&self, request: DrainRequest) {
        // The receiver lives as long as the record, so this cannot fail.
        let _ = self.drain_tx.send(request);
    }

    /// Consume pending drain requests
    pub(crate) fn take_requests(&self) -> usize {
        self.drain_rx.try_iter().count()
    }

    pub fn pending_finalizers(&self) -> usize {
        self.finalizers.len()
    }
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("stacks", &self.stacks.len())
            .field("extent", &format_args!("{:#x}", self.extent()))
            .field("pending_finalizers", &self.finalizers.len())
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Attached threads of one collector, in attach order
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<IndexMap<ThreadId, Arc<ThreadRecord>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, record: Arc<ThreadRecord>) -> Result<()> {
        let mut threads = self.threads.lock();
        if threads.contains_key(&record.id()) {
            return Err(GcError::Usage(format!("thread {:?} attached twice", record.id())));
        }
        threads.insert(record.id(), record);
        Ok(())
    }

    pub(crate) fn remove(&self, id: ThreadId) -> Option<Arc<ThreadRecord>> {
        self.threads.lock().shift_remove(&id)
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<ThreadRecord>> {
        self.threads.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<(u64, Arc<ThreadRecord>)>> = const { RefCell::new(None) };
}

/// Explicit handle of an attached thread
///
/// Allocation goes through a context so the fast path never looks the
/// thread up. Contexts are neither `Send` nor `Sync`.
pub struct ThreadContext<B: Backend> {
    gc: Arc<Gc<B>>,
    record: Arc<ThreadRecord>,
    _not_send: PhantomData<*const ()>,
}

impl<B: Backend> ThreadContext<B> {
    pub(crate) fn new(gc: Arc<Gc<B>>, record: Arc<ThreadRecord>) -> Self {
        CURRENT.with(|current| *current.borrow_mut() = Some((gc.id(), record.clone())));
        Self {
            gc,
            record,
            _not_send: PhantomData,
        }
    }

    /// Context of the calling thread for `gc`
    ///
    /// Fails with `NotAttached` if the thread was never attached to `gc` or
    /// has been detached.
    pub fn current(gc: &Arc<Gc<B>>) -> Result<Self> {
        let cached = CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .filter(|(id, record)| *id == gc.id() && record.is_attached())
                .map(|(_, record)| record.clone())
        });

        let record = match cached {
            Some(record) => record,
            None => gc
                .backend()
                .shared()
                .threads
                .get(std::thread::current().id())
                .ok_or(GcError::NotAttached)?,
        };
        Ok(Self::new(gc.clone(), record))
    }

    pub fn gc(&self) -> &Arc<Gc<B>> {
        &self.gc
    }

    pub fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    pub fn thread_id(&self) -> ThreadId {
        self.record.id()
    }

    /// Publish the stack pointer of the running green thread
    ///
    /// The scheduler calls this at every switch; the running stack is
    /// scanned from here to its high end.
    pub fn set_extent(&self, sp: usize) {
        self.record.set_extent(sp);
    }

    /// Run finalizers queued for this thread
    ///
    /// Also drains the collector's message stream unless the backend does
    /// that right after each collection. Returns the number of finalizers
    /// run.
    ///
    /// This is also a safepoint: if a collection is waiting, the thread is
    /// parked until it finishes.
    pub fn poll(&self) -> usize {
        let shared = self.gc.backend().shared();
        shared.safepoint(&self.record);
        let mut ran = 0;
        if !B::PROMPT_FINALIZATION {
            ran += shared.check_finalizers();
        }
        ran + shared.run_deferred(&self.record)
    }

    /// Step out of the running threads while in foreign or blocking code
    ///
    /// Collections do not wait for the thread until the region is dropped.
    /// Managed objects must not be touched inside the region.
    pub fn safe_region(&self) -> SafeRegion<'_> {
        self.gc.backend().shared().world.safe_region(&self.record.safe)
    }

    /// Unscoped form of `safe_region`, for callers across an FFI boundary
    pub fn enter_safe_region(&self) {
        self.gc.backend().shared().world.leave(&self.record.safe);
    }

    pub fn leave_safe_region(&self) {
        self.gc.backend().shared().world.rejoin(&self.record.safe);
    }

    /// Run `f` inside a safe region
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        let _region = self.safe_region();
        f()
    }

    pub(crate) fn forget(&self) {
        self.record.mark_detached();
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if matches!(current.as_ref(), Some((_, record)) if Arc::ptr_eq(record, &self.record)) {
                *current = None;
            }
        });
    }
}

impl<B: Backend> std::fmt::Debug for ThreadContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("gc", &self.gc.id())
            .field("backend", &B::NAME)
            .field("record", &self.record)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::PoolKind;

    fn record() -> Arc<ThreadRecord> {
        Arc::new(ThreadRecord::new(Arc::new(StackSet::new()), ApSet::new(0, 0), 16))
    }

    #[test]
    fn test_registry_rejects_double_attach() {
        let registry = ThreadRegistry::new();
        registry.insert(record()).unwrap();
        assert!(matches!(registry.insert(record()), Err(GcError::Usage(_))));
        assert_eq!(registry.len(), 1);

        let id = std::thread::current().id();
        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn test_drain_requests_are_counted_once() {
        let record = record();
        let from = std::thread::current().id();
        record.request_drain(DrainRequest { from });
        record.request_drain(DrainRequest { from });
        assert_eq!(record.take_requests(), 2);
        assert_eq!(record.take_requests(), 0);
    }

    #[test]
    fn test_record_defaults() {
        let record = record();
        assert!(record.is_attached());
        assert_eq!(record.aps.lock().main.pool(), PoolKind::Main);
        assert_eq!(record.count_allocation(), 1);
        record.set_extent(0x1000);
        assert_eq!(record.extent(), 0x1000);
        record.mark_detached();
        assert!(!record.is_attached());
    }
}
