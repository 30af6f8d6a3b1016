//! State and machinery common to both backends
//!
//! `Shared` owns the heap and everything a collection needs to find roots:
//! the thread registry, the root set, the finalizer message stream and the
//! objects whose finalizers are running. Backends differ only in where
//! pools are placed, when finalizers run and which watch they hand out.

use crate::allocator::{AllocPoint, AllocPool, ApSet, PoolKind, Reservation};
use crate::code::{self, CodeBlock};
use crate::config::{GcConfig, GenerationParams};
use crate::error::{GcError, Result};
use crate::heap::Heap;
use crate::logging::{GcEvent, GcLogger};
use crate::object::header::{base_of, header_at, RecordKind};
use crate::object::types::{Finalized, TypeHandle};
use crate::relocate::{self, CollectionReport, RootWalker};
use crate::roots::{RootHandle, RootSet};
use crate::runtime::{DrainRequest, MessageQueue, Pushed, StoppedWorld, ThreadRecord, ThreadRegistry, World};
use crate::scan::{self, Scanner, StackSet};
use crate::stats::{GcStats, GcTimer, MemorySummary};
use crate::watch::MoveLog;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Generations the pools of a backend allocate into
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub main: usize,
    pub code: usize,
    pub weak: usize,
    pub hash: usize,
}

/// Collector state shared by both backends
pub struct Shared {
    name: &'static str,
    prompt_finalization: bool,
    finalization_interval: usize,
    finalizer_queue_capacity: usize,
    type_sweep_threshold: usize,
    placement: Placement,
    pub heap: Heap,
    pub world: World,
    pub threads: ThreadRegistry,
    pub roots: Arc<RootSet>,
    pub messages: MessageQueue,
    pub logger: Arc<GcLogger>,
    pub stats: GcStats,
    pub moves: Arc<MoveLog>,
    /// Object whose finalizer `check_finalizers` is running
    in_flight: AtomicUsize,
    running_finalizers: AtomicBool,
    weak_ap: Mutex<AllocPoint>,
    hash_ap: Mutex<AllocPoint>,
    cycle: AtomicU64,
}

impl Shared {
    pub fn new(
        name: &'static str,
        prompt_finalization: bool,
        config: &GcConfig,
        defaults: &[GenerationParams],
        placement: Placement,
        logger: Arc<GcLogger>,
    ) -> Result<Self> {
        config.validate()?;
        let generations = config.generations_or(defaults);
        let heap = Heap::new(config, &generations)?;
        log::debug!(
            "{} backend: {} generations, {} byte chunks",
            name,
            generations.len(),
            heap.chunk_size()
        );

        Ok(Self {
            name,
            prompt_finalization,
            finalization_interval: config.finalization_interval.max(1),
            finalizer_queue_capacity: config.finalizer_queue_capacity,
            type_sweep_threshold: config.type_sweep_threshold,
            placement,
            heap,
            world: World::new(),
            threads: ThreadRegistry::new(),
            roots: Arc::new(RootSet::new()),
            messages: MessageQueue::new(),
            logger,
            stats: GcStats::new(),
            moves: Arc::new(MoveLog::new()),
            in_flight: AtomicUsize::new(0),
            running_finalizers: AtomicBool::new(false),
            weak_ap: Mutex::new(AllocPoint::new(PoolKind::Weak, placement.weak)),
            hash_ap: Mutex::new(AllocPoint::new(PoolKind::Main, placement.hash)),
            cycle: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Number of collections run so far
    pub fn cycles(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Threads

    pub fn attach(&self, stacks: Arc<StackSet>) -> Result<Arc<ThreadRecord>> {
        let world = self.world.enter();
        let record = Arc::new(ThreadRecord::new(
            stacks,
            ApSet::new(self.placement.main, self.placement.code),
            self.finalizer_queue_capacity,
        ));
        self.threads.insert(record.clone())?;
        drop(world);
        self.world.attach();
        log::debug!("attached {:?}", record.id());
        Ok(record)
    }

    /// Detach `record`, running the finalizers still queued for it
    pub fn detach(&self, record: &Arc<ThreadRecord>) -> Result<()> {
        self.run_deferred(record);
        let removed = {
            let _world = self.world.enter();
            record.aps.lock().flush();
            self.threads.remove(record.id())
        };
        match removed {
            Some(_) => {
                // A thread detaching from inside a safe region is already uncounted
                if !record.safe.swap(false, Ordering::AcqRel) {
                    self.world.detach();
                }
                log::debug!("detached {:?}", record.id());
                Ok(())
            },
            None => Err(GcError::Usage(format!("thread {:?} is not attached", record.id()))),
        }
    }

    /// Park `thread` if a collection is waiting for it
    #[inline]
    pub fn safepoint(&self, thread: &ThreadRecord) {
        if !thread.in_safe_region() {
            self.world.arrive();
        }
    }

    /// Whether the calling thread is attached here and counted as running
    fn caller_running(&self) -> bool {
        self.threads
            .get(std::thread::current().id())
            .is_some_and(|thread| !thread.in_safe_region())
    }

    /// Bring every attached thread to a safepoint and take the world lock
    pub fn stop_world(&self) -> StoppedWorld<'_> {
        self.world.stop(self.caller_running())
    }

    // ------------------------------------------------------------------
    // Reservation

    /// Reserve `size` bytes from `pool` and format them with `init`
    ///
    /// `init` receives the record start and returns the client pointer. It
    /// runs with the world entered, so no collection sees the record
    /// half-formatted. When a generation is due, the world is left, that
    /// generation is collected and the reservation retried with growth
    /// allowed; when the heap limit is hit, one full collection is tried.
    pub fn reserve<F>(&self, thread: &ThreadRecord, pool: AllocPool, size: usize, init: F) -> Result<usize>
    where
        F: FnOnce(usize) -> usize,
    {
        let mut grow = false;
        let mut tried_full = false;

        loop {
            self.safepoint(thread);
            let world = self.world.enter();
            let outcome = match pool {
                AllocPool::Main | AllocPool::Code => {
                    let mut aps = thread.aps.lock();
                    let ap = aps
                        .get_mut(pool)
                        .ok_or_else(|| GcError::Internal(format!("no private allocation point for {:?}", pool)))?;
                    self.heap.reserve(ap, size, grow).map_err(|e| e.out_of_memory(size))?
                },
                AllocPool::Weak => self
                    .heap
                    .reserve(&mut self.weak_ap.lock(), size, grow)
                    .map_err(|e| e.out_of_memory(size))?,
                AllocPool::Hash => self
                    .heap
                    .reserve(&mut self.hash_ap.lock(), size, grow)
                    .map_err(|e| e.out_of_memory(size))?,
            };

            if let Reservation::Ready(base) = outcome {
                let client = init(base);
                drop(world);
                return Ok(client);
            }
            drop(world);

            match outcome {
                Reservation::Collect(gen) => {
                    log::trace!("reserve of {} bytes from {:?} needs generation {}", size, pool, gen);
                    self.collect_and_finalize(gen)?;
                    grow = true;
                },
                Reservation::Exhausted if !tried_full => {
                    log::debug!("heap limit reached reserving {} bytes, collecting", size);
                    self.collect_and_finalize(self.heap.generations() - 1)?;
                    tried_full = true;
                    grow = true;
                },
                _ => {
                    return Err(GcError::OutOfMemory {
                        requested: size,
                        error_object: None,
                    })
                },
            }
        }
    }

    /// Reserve `size` bytes from the non-moving pool and format them
    pub fn reserve_static<F>(&self, size: usize, init: F) -> Result<usize>
    where
        F: FnOnce(usize) -> usize,
    {
        let mut tried_full = false;
        loop {
            let world = self.world.enter();
            let outcome = self.heap.reserve_static(size).map_err(|e| e.out_of_memory(size))?;
            if let Reservation::Ready(base) = outcome {
                let client = init(base);
                drop(world);
                return Ok(client);
            }
            drop(world);

            if tried_full {
                return Err(GcError::OutOfMemory {
                    requested: size,
                    error_object: None,
                });
            }
            self.collect_and_finalize(self.heap.generations() - 1)?;
            tried_full = true;
        }
    }

    /// Reserve without collecting, for error objects on the failure path
    pub(crate) fn reserve_static_now<F>(&self, size: usize, init: F) -> Option<usize>
    where
        F: FnOnce(usize) -> usize,
    {
        let _world = self.world.enter();
        match self.heap.reserve_static(size) {
            Ok(Reservation::Ready(base)) => Some(init(base)),
            _ => None,
        }
    }

    /// Count an allocation and poll finalization every interval
    pub fn allocation_poll(&self, thread: &ThreadRecord) {
        if thread.count_allocation() % self.finalization_interval != 0 {
            return;
        }
        if !self.prompt_finalization {
            self.check_finalizers();
        }
        self.run_deferred(thread);
    }

    // ------------------------------------------------------------------
    // Collection

    /// Flush every allocation point; the world must be stopped
    fn flush_all(&self) {
        for thread in self.threads.snapshot() {
            thread.aps.lock().flush();
        }
        self.weak_ap.lock().flush();
        self.hash_ap.lock().flush();
    }

    /// Stop the world and collect generations `0..=oldest`
    pub fn collect_with(&self, oldest: usize) -> Result<CollectionReport> {
        let _stopped = self.stop_world();
        self.flush_all();

        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        self.logger.log(GcEvent::CycleStart {
            backend: self.name,
            cycle,
            generation: oldest,
        });
        let timer = GcTimer::start();

        let report = relocate::collect(&self.heap, &Roots { shared: self }, oldest, cycle)?;

        self.moves.record(&report.moved);
        self.messages.post(&report.posted);
        self.stats.record_collection(&report);

        if report.nailed_chunks > 0 {
            self.logger.log(GcEvent::Nailed {
                cycle,
                chunks: report.nailed_chunks,
            });
        }
        self.logger.log(GcEvent::ReferenceStats {
            cycle,
            weak_splatted: report.weak_splatted,
            finalizers_posted: report.posted.len(),
        });
        self.logger.log(GcEvent::CycleEnd {
            cycle,
            duration_ms: timer.elapsed_ms(),
            copied_bytes: report.copied_bytes,
            reclaimed_bytes: report.reclaimed_bytes,
        });
        if self.logger.is_enabled() {
            let (pools, _) = self.heap.pool_summaries();
            self.logger.log(GcEvent::HeapStats {
                used_bytes: pools.iter().map(|p| p.used).sum(),
                mapped_bytes: self.heap.mapped(),
            });
        }
        Ok(report)
    }

    /// Collect, then run finalizers if the backend runs them promptly
    pub fn collect_and_finalize(&self, oldest: usize) -> Result<CollectionReport> {
        let report = self.collect_with(oldest)?;
        if self.prompt_finalization {
            self.check_finalizers();
        }
        Ok(report)
    }

    /// Collect the youngest due generation until none is due or the budget
    /// is spent
    ///
    /// Returns true if work is still pending.
    pub fn step(&self, budget: Duration) -> Result<bool> {
        let timer = GcTimer::start();
        while let Some(gen) = self.heap.youngest_due() {
            if timer.exceeded(budget) {
                return Ok(true);
            }
            self.collect_and_finalize(gen)?;
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Finalization

    /// Run the finalizers of every object posted by a collection
    ///
    /// Only one thread drains at a time; a concurrent call returns 0.
    pub fn check_finalizers(&self) -> usize {
        if self
            .running_finalizers
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let mut ran = 0;
        loop {
            let object = {
                let _world = self.world.enter();
                match self.messages.pop() {
                    Some(object) => {
                        self.in_flight.store(object, Ordering::Release);
                        object
                    },
                    None => break,
                }
            };
            if self.finalize(object) {
                ran += 1;
            }
            self.in_flight.store(0, Ordering::Release);
        }

        self.running_finalizers.store(false, Ordering::Release);
        ran
    }

    /// Finalize one posted object; false if nothing ran
    fn finalize(&self, object: usize) -> bool {
        // SAFETY: posted objects were resurrected by the collection and are
        // pinned through `in_flight` while we look at them.
        let header = unsafe { header_at(base_of(object)) };

        if header.kind() == RecordKind::Code {
            let mut block = unsafe { CodeBlock::from_client(object) };
            code::finalize(&mut block, &self.heap.code);
            self.stats.record_finalized();
            return true;
        }
        if header.set_finalized() {
            return false;
        }

        let finalizer = TypeHandle::from_raw(header.type_raw())
            .and_then(|handle| self.heap.types.get(handle).ok())
            .and_then(|ty| ty.finalizer);
        let finalizer = match finalizer {
            Some(finalizer) => finalizer,
            None => return false,
        };

        match finalizer(object) {
            Finalized::Done => self.stats.record_finalized(),
            Finalized::Defer(target) => match self.threads.get(target) {
                Some(thread) => match thread.finalizers.push(object) {
                    Pushed::Full => {
                        log::warn!(
                            "finalizer queue of {:?} is full ({} objects), dropping finalizer of {:#x}",
                            target,
                            thread.finalizers.capacity(),
                            object
                        );
                        self.logger.log(GcEvent::FinalizerFailed { object });
                    },
                    pushed => {
                        if pushed == Pushed::Claimed {
                            thread.request_drain(DrainRequest {
                                from: std::thread::current().id(),
                            });
                        }
                        log::trace!("finalizer of {:#x} deferred to {:?}", object, target);
                    },
                },
                None => {
                    log::warn!("finalizer of {:#x} deferred to unattached {:?}", object, target);
                    self.logger.log(GcEvent::FinalizerFailed { object });
                },
            },
        }
        true
    }

    /// Run the finalizers queued for `thread`, on the calling thread
    pub fn run_deferred(&self, thread: &ThreadRecord) -> usize {
        let requests = thread.take_requests();
        if requests > 0 {
            log::trace!("{:?}: {} drain requests", thread.id(), requests);
        }

        let mut ran = 0;
        loop {
            while let Some(object) = self.pop_deferred(thread) {
                self.finalize_deferred(object);
                thread.in_flight.store(0, Ordering::Release);
                ran += 1;
            }
            if !thread.finalizers.finish_drain() {
                break;
            }
        }
        ran
    }

    fn pop_deferred(&self, thread: &ThreadRecord) -> Option<usize> {
        let _world = self.world.enter();
        let object = thread.finalizers.pop()?;
        thread.in_flight.store(object, Ordering::Release);
        Some(object)
    }

    fn finalize_deferred(&self, object: usize) {
        // SAFETY: pinned through the thread's `in_flight`.
        let header = unsafe { header_at(base_of(object)) };
        let finalizer = TypeHandle::from_raw(header.type_raw())
            .and_then(|handle| self.heap.types.get(handle).ok())
            .and_then(|ty| ty.finalizer);

        match finalizer.map(|finalizer| finalizer(object)) {
            Some(Finalized::Done) => self.stats.record_finalized(),
            Some(Finalized::Defer(target)) => {
                log::warn!("finalizer of {:#x} deferred again to {:?}, dropped", object, target);
                self.logger.log(GcEvent::FinalizerFailed { object });
            },
            None => {},
        }
    }

    // ------------------------------------------------------------------
    // Roots, walks and metadata

    /// Register `[base, base + count)` as a root
    ///
    /// # Safety
    /// See `RootSet::create`.
    pub unsafe fn create_root(&self, base: usize, count: usize, ambiguous: bool) -> Result<RootHandle> {
        let _world = self.world.enter();
        self.roots.create(base, count, ambiguous)
    }

    pub fn destroy_root(&self, handle: RootHandle) -> Result<()> {
        let _world = self.world.enter();
        self.roots.destroy(handle)
    }

    /// Visit every object with the world stopped
    ///
    /// `f` may query the heap (`type_of`, `is_code`) but must not allocate,
    /// register roots or collect.
    pub fn walk_objects<F: FnMut(usize, usize, RecordKind)>(&self, f: F) {
        let _stopped = self.stop_world();
        self.flush_all();
        self.heap.walk(f);
    }

    /// Queue `handle` for release, sweeping once enough are pending
    pub fn free_type(&self, handle: TypeHandle) {
        if self.heap.types.free(handle) > self.type_sweep_threshold {
            self.sweep_types();
        }
    }

    /// Release every pending type descriptor no heap object refers to
    pub fn sweep_types(&self) -> (usize, usize) {
        let _stopped = self.stop_world();
        self.flush_all();
        let live = self.heap.live_types();
        let (freed, kept) = self.heap.types.reclaim(&live);
        self.stats.record_type_sweep();
        self.logger.log(GcEvent::TypeSweep { freed, kept });
        (freed, kept)
    }

    pub fn summary(&self) -> MemorySummary {
        let (pools, generations) = self.heap.pool_summaries();
        MemorySummary {
            backend: self.name,
            mapped: self.heap.mapped(),
            pools,
            generations,
            types: self.heap.types.len(),
            code_entries: self.heap.code.code.len(),
            unwind_records: self.heap.code.unwind.len(),
            roots: self.roots.len(),
            threads: self.threads.len(),
            finalizable: self.heap.finalizable_count(),
            pending_finalization: self.messages.len(),
            stats: self.stats.snapshot(),
        }
    }
}

/// Root view of the collector state
struct Roots<'a> {
    shared: &'a Shared,
}

impl RootWalker for Roots<'_> {
    fn ambiguous<S: Scanner>(&self, s: &mut S) -> std::result::Result<(), S::Error> {
        let shared = self.shared;
        for thread in shared.threads.snapshot() {
            let scanned = scan::stacks(s, thread.stacks(), thread.extent())?;
            log::trace!("{:?}: {} stack bytes scanned", thread.id(), scanned);
            thread.finalizers.scan(s)?;
            scan::array(s, &mut [thread.in_flight.load(Ordering::Acquire)])?;
        }
        scan::array(s, &mut [shared.in_flight.load(Ordering::Acquire)])?;
        shared.roots.scan(s, true)
    }

    fn exact<S: Scanner>(&self, s: &mut S) -> std::result::Result<(), S::Error> {
        self.shared.roots.scan(s, false)?;
        self.shared.messages.scan(s)
    }
}
