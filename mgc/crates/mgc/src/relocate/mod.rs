//! Relocate Module - mostly-copying collection
//!
//! One collection condemns every moving chunk up to a generation and then
//! runs, with the world stopped:
//!
//! 1. **Ambiguous roots**: stacks, ambiguous root regions, finalizer queues
//!    and the reflection objects of type descriptors. A hit nails the chunk
//!    it lands in; the object is marked in place and the word is left
//!    alone.
//! 2. **Exact roots**: targets in condemned chunks are copied to a chunk of
//!    the next generation and the slot is rewritten. Interior pointers keep
//!    their offset.
//! 3. **Uncondemned chunks** are scanned in full as roots. This stands in
//!    for a remembered set.
//! 4. **Gray objects** are scanned until none are left. A code block whose
//!    references changed, or which moved itself, has its table replayed
//!    into the instructions.
//! 5. **Finalization**: registered objects found dead are resurrected,
//!    traced, and handed back to the caller to be posted.
//! 6. **Weak arrays**: slots whose target survived are updated, the others
//!    are nulled and counted.
//! 7. **Release**: evacuated chunks are unmapped; nailed, large and
//!    non-moving chunks are swept in place.

pub mod sweep;

use crate::code::{self, CodeBlock, CodeTables};
use crate::error::{GcError, Result};
use crate::heap::{ChunkState, Heap, HeapInner, PoolKind};
use crate::object::format::{array_count, array_elements, weak_splat};
use crate::object::header::{
    base_of, client_of, header_at, record_kind, record_size, write_forward, RecordKind,
};
use crate::object::types::{GcKind, TypeTable};
use crate::scan::{self, Scanner};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::time::Duration;
use sweep::sweep_chunk;

/// Sources of roots for one collection
pub trait RootWalker {
    /// Scan every ambiguous root
    fn ambiguous<S: Scanner>(&self, s: &mut S) -> std::result::Result<(), S::Error>;

    /// Scan every exact root
    fn exact<S: Scanner>(&self, s: &mut S) -> std::result::Result<(), S::Error>;
}

/// Outcome of one collection
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    pub cycle: u64,
    /// Oldest generation condemned
    pub oldest: usize,
    /// Whether every generation and the non-moving pool were collected
    pub full: bool,
    pub copied_bytes: usize,
    pub copied_objects: usize,
    pub reclaimed_bytes: usize,
    pub nailed_chunks: usize,
    pub replayed_code: usize,
    pub weak_splatted: usize,
    /// Objects that became unreachable and wait for their finalizer
    pub posted: Vec<usize>,
    /// Address ranges whose objects moved or died
    pub moved: Vec<(usize, usize)>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ambiguous,
    Exact,
}

/// Where a reference into the condemned area ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    /// Not in the condemned area, or a pad
    Untouched,
    /// Survived at this address
    Live(usize),
    /// Not reached
    Dead,
}

struct Tracer<'h> {
    inner: &'h mut HeapInner,
    types: &'h TypeTable<'h>,
    code: &'h CodeTables,
    chunk_size: usize,
    last: usize,
    lo: usize,
    hi: usize,
    mode: Mode,
    gray: Vec<usize>,
    rewrote: bool,
    to_space: FxHashMap<(PoolKind, usize), usize>,
    report: CollectionReport,
}

impl Scanner for Tracer<'_> {
    type Error = GcError;

    #[inline]
    fn fix1(&mut self, word: usize) -> bool {
        word >= self.lo && word < self.hi
    }

    fn fix2(&mut self, slot: &mut usize) -> Result<()> {
        let addr = *slot;
        match self.mode {
            Mode::Ambiguous => self.pin(addr),
            Mode::Exact => {
                if let Some(to) = self.forward(addr)? {
                    if to != addr {
                        *slot = to;
                        self.rewrote = true;
                    }
                }
            },
        }
        Ok(())
    }
}

impl<'h> Tracer<'h> {
    fn condemn(&mut self, oldest: usize, full: bool) {
        self.lo = usize::MAX;
        self.hi = 0;
        for chunk in self.inner.chunks.iter_mut().flatten() {
            chunk.forget_index();
            chunk.state = if chunk.pool.is_moving() && chunk.gen <= oldest {
                ChunkState::Condemned
            } else if full && !chunk.pool.is_moving() {
                ChunkState::Sweep
            } else {
                ChunkState::Normal
            };
            if chunk.state != ChunkState::Normal && chunk.top > chunk.base {
                self.lo = self.lo.min(chunk.base);
                self.hi = self.hi.max(chunk.top);
            }
        }
    }

    /// Record containing `addr` in a chunk taking part in this collection
    fn locate(&mut self, addr: usize) -> Option<(usize, usize, ChunkState, bool)> {
        let id = self.inner.chunk_id_of(addr)?;
        let chunk = self.inner.chunk_mut(id)?;
        if matches!(chunk.state, ChunkState::Normal | ChunkState::ToSpace) {
            return None;
        }
        // SAFETY: allocation points are flushed and the world is stopped.
        let base = unsafe { chunk.record_containing(addr)? };
        Some((id, base, chunk.state, chunk.large))
    }

    #[inline]
    fn mark(&mut self, base: usize) {
        // SAFETY: `base` starts an object or code record.
        if !unsafe { header_at(base) }.set_marked() {
            self.gray.push(client_of(base));
        }
    }

    fn pin(&mut self, addr: usize) {
        let (id, base, state, large) = match self.locate(addr) {
            Some(found) => found,
            None => return,
        };
        // SAFETY: `base` is a record start.
        if !matches!(unsafe { record_kind(base) }, RecordKind::Object | RecordKind::Code) {
            return;
        }
        if state == ChunkState::Condemned && !large {
            if let Some(chunk) = self.inner.chunk_mut(id) {
                chunk.state = ChunkState::Nailed;
                self.report.nailed_chunks += 1;
            }
        }
        self.mark(base);
    }

    /// New address of the exact reference `addr`, copying its target if
    /// needed
    fn forward(&mut self, addr: usize) -> Result<Option<usize>> {
        let (id, base, state, large) = match self.locate(addr) {
            Some(found) => found,
            None => return Ok(None),
        };

        // SAFETY: `base` is a record start.
        match unsafe { record_kind(base) } {
            RecordKind::Pad => Ok(None),
            RecordKind::Forward => {
                let to = unsafe { header_at(base) }.forward_target();
                Ok(Some(base_of(to) + (addr - base)))
            },
            RecordKind::Object | RecordKind::Code => {
                if state == ChunkState::Condemned && !large {
                    if let Some(to) = self.evacuate(id, base)? {
                        return Ok(Some(to + (addr - base)));
                    }
                }
                self.mark(base);
                Ok(Some(addr))
            },
        }
    }

    /// Copy the record at `base` out of chunk `id`, returning its new base
    ///
    /// If no to-space can be mapped the chunk is nailed instead and `None`
    /// is returned.
    fn evacuate(&mut self, id: usize, base: usize) -> Result<Option<usize>> {
        let (pool, gen) = match self.inner.chunk_mut(id) {
            Some(chunk) => (chunk.pool, chunk.gen),
            None => return Err(GcError::Internal(format!("chunk {} vanished", id))),
        };
        // SAFETY: `base` is a record start.
        let size = unsafe { record_size(base) };
        let to_gen = (gen + 1).min(self.last);

        let to = match self.to_space(pool, to_gen, size) {
            Ok(to) => to,
            Err(e) => {
                log::warn!("no to-space for {} bytes ({}), nailing chunk", size, e);
                if let Some(chunk) = self.inner.chunk_mut(id) {
                    chunk.state = ChunkState::Nailed;
                    self.report.nailed_chunks += 1;
                }
                return Ok(None);
            },
        };

        // SAFETY: `to` is fresh to-space of `size` bytes and `base` a live
        // record of the same size; the world is stopped.
        unsafe {
            std::ptr::copy_nonoverlapping(base as *const u8, to as *mut u8, size);
            write_forward(base, client_of(to));
        }
        self.gray.push(client_of(to));
        self.report.copied_bytes += size;
        self.report.copied_objects += 1;
        Ok(Some(to))
    }

    fn to_space(&mut self, pool: PoolKind, gen: usize, size: usize) -> Result<usize> {
        if let Some(&id) = self.to_space.get(&(pool, gen)) {
            if let Some(to) = self.inner.chunk_mut(id).and_then(|chunk| chunk.bump(size)) {
                return Ok(to);
            }
        }
        let id = self.inner.map_chunk(self.chunk_size.max(size), pool, gen, false)?;
        self.to_space.insert((pool, gen), id);
        let chunk = self
            .inner
            .chunk_mut(id)
            .ok_or_else(|| GcError::Internal("to-space chunk vanished".to_string()))?;
        chunk.state = ChunkState::ToSpace;
        chunk
            .bump(size)
            .ok_or_else(|| GcError::Internal("fresh to-space too small".to_string()))
    }

    /// Scan one record and replay it if it is code that needs it
    fn scan_record(&mut self, client: usize) -> Result<()> {
        self.rewrote = false;
        let types = self.types;
        // SAFETY: `client` is a formatted record and the world is stopped.
        unsafe { scan::object(self, client, types)? };

        // SAFETY: as above.
        if unsafe { record_kind(base_of(client)) } == RecordKind::Code {
            let mut block = unsafe { CodeBlock::from_client(client) };
            if self.rewrote || block.replayed_at() != client {
                code::update_ptrs(&mut block, self.code);
                self.report.replayed_code += 1;
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(client) = self.gray.pop() {
            self.scan_record(client)?;
        }
        Ok(())
    }

    fn roots<R: RootWalker>(&mut self, roots: &R) -> Result<()> {
        self.mode = Mode::Ambiguous;
        roots.ambiguous(self)?;
        let reflects: Vec<usize> = self.types.reflects().collect();
        for mut reflect in reflects {
            if self.fix1(reflect) {
                self.fix2(&mut reflect)?;
            }
        }

        self.mode = Mode::Exact;
        roots.exact(self)?;

        let uncondemned: Vec<(usize, usize)> = self
            .inner
            .chunks
            .iter()
            .flatten()
            .filter(|chunk| chunk.state == ChunkState::Normal)
            .map(|chunk| (chunk.base, chunk.top))
            .collect();
        for (base, top) in uncondemned {
            let mut at = base;
            while at < top {
                // SAFETY: uncondemned chunks are formatted and never written
                // by the tracer except for reference slots.
                let size = unsafe { record_size(at) };
                self.scan_record(client_of(at))?;
                at += size;
            }
        }

        self.drain()
    }

    /// Where the object containing `addr` ended up
    fn fate(&mut self, addr: usize) -> Fate {
        let (_, base, _, _) = match self.locate(addr) {
            Some(found) => found,
            None => return Fate::Untouched,
        };
        // SAFETY: `base` is a record start.
        match unsafe { record_kind(base) } {
            RecordKind::Pad => Fate::Untouched,
            RecordKind::Forward => {
                let to = unsafe { header_at(base) }.forward_target();
                Fate::Live(base_of(to) + (addr - base))
            },
            RecordKind::Object | RecordKind::Code => {
                if unsafe { header_at(base) }.is_marked() {
                    Fate::Live(addr)
                } else {
                    Fate::Dead
                }
            },
        }
    }

    fn finalization(&mut self) -> Result<()> {
        let registry = std::mem::take(&mut self.inner.finalizable);
        let mut keep = Vec::with_capacity(registry.len());
        let mut dead = Vec::new();

        for client in registry {
            match self.fate(client) {
                Fate::Untouched => keep.push(client),
                Fate::Live(to) => keep.push(to),
                Fate::Dead => dead.push(client),
            }
        }

        for client in dead.iter_mut() {
            self.fix2(client)?;
        }
        self.drain()?;

        self.inner.finalizable = keep;
        self.report.posted = dead;
        Ok(())
    }

    fn weak(&mut self) {
        let live: Vec<(usize, usize, bool)> = self
            .inner
            .chunks
            .iter()
            .flatten()
            .filter(|chunk| chunk.state != ChunkState::Condemned || chunk.large)
            .map(|chunk| (chunk.base, chunk.top, chunk.state != ChunkState::Normal && chunk.state != ChunkState::ToSpace))
            .collect();

        for (base, top, marked_only) in live {
            let mut at = base;
            while at < top {
                // SAFETY: survivors' chunks are formatted.
                let size = unsafe { record_size(at) };
                if unsafe { record_kind(at) } == RecordKind::Object {
                    let header = unsafe { header_at(at) };
                    let weak = matches!(
                        self.types.get(header.type_raw()).map(|ty| ty.kind),
                        Some(GcKind::WeakArray)
                    );
                    if weak && (!marked_only || header.is_marked()) {
                        self.fix_weak(client_of(at));
                    }
                }
                at += size;
            }
        }
    }

    fn fix_weak(&mut self, client: usize) {
        // SAFETY: `client` is a live weak array.
        let count = unsafe { array_count(client) };
        let elements = array_elements(client) as *mut usize;
        for i in 0..count {
            // SAFETY: `i` is within the array.
            let slot = unsafe { &mut *elements.add(i) };
            if !self.fix1(*slot) {
                continue;
            }
            match self.fate(*slot) {
                Fate::Untouched => {},
                Fate::Live(to) => *slot = to,
                Fate::Dead => {
                    *slot = 0;
                    // SAFETY: as above.
                    unsafe { weak_splat(client) };
                    self.report.weak_splatted += 1;
                },
            }
        }
    }

    fn release(&mut self, full: bool) {
        if full {
            self.inner.static_free.clear();
        }

        for id in self.inner.chunk_ids() {
            let chunk = match self.inner.chunk_mut(id) {
                Some(chunk) => chunk,
                None => continue,
            };
            chunk.forget_index();
            let last = self.last;

            match chunk.state {
                ChunkState::Normal => {},
                ChunkState::ToSpace => chunk.state = ChunkState::Normal,
                ChunkState::Condemned => {
                    // SAFETY: a large chunk holds one record at its base.
                    let survived = chunk.large && unsafe { header_at(chunk.base) }.is_marked();
                    if survived {
                        unsafe { header_at(chunk.base) }.clear_mark();
                        chunk.state = ChunkState::Normal;
                        chunk.gen = (chunk.gen + 1).min(last);
                    } else {
                        let range = (chunk.base, chunk.top);
                        self.report.reclaimed_bytes += chunk.used();
                        self.report.moved.push(range);
                        self.inner.remove_chunk(id);
                    }
                },
                ChunkState::Nailed => {
                    // SAFETY: formatted chunk, world stopped.
                    let swept = unsafe { sweep_chunk(chunk) };
                    chunk.state = ChunkState::Normal;
                    chunk.gen = (chunk.gen + 1).min(last);
                    if swept.forwards > 0 {
                        self.report.moved.push((chunk.base, chunk.top));
                    }
                    self.report.reclaimed_bytes += swept.freed;
                },
                ChunkState::Sweep => {
                    // SAFETY: formatted chunk, world stopped.
                    let swept = unsafe { sweep_chunk(chunk) };
                    chunk.state = ChunkState::Normal;
                    self.report.reclaimed_bytes += swept.freed;
                    self.inner.static_free.extend(swept.holes);
                },
            }
        }
    }
}

/// Collect every generation up to `oldest`
///
/// The caller holds the world stopped and has flushed every allocation
/// point. A collection of the last generation also sweeps the non-moving
/// pool.
pub fn collect<R: RootWalker>(heap: &Heap, roots: &R, oldest: usize, cycle: u64) -> Result<CollectionReport> {
    let timer = std::time::Instant::now();
    let types = heap.types.table();
    let mut inner = heap.lock();
    let last = inner.last_gen();
    let oldest = oldest.min(last);
    let full = oldest == last;

    let mut tracer = Tracer {
        inner: &mut *inner,
        types: &types,
        code: &heap.code,
        chunk_size: heap.chunk_size(),
        last,
        lo: 0,
        hi: 0,
        mode: Mode::Ambiguous,
        gray: Vec::new(),
        rewrote: false,
        to_space: FxHashMap::default(),
        report: CollectionReport {
            cycle,
            oldest,
            full,
            ..Default::default()
        },
    };

    tracer.condemn(oldest, full);
    tracer.roots(roots)?;
    tracer.finalization()?;
    tracer.weak();
    tracer.release(full);

    let mut report = std::mem::take(&mut tracer.report);
    drop(tracer);

    inner.reset_current();
    inner.recount();
    for gen in 0..=oldest {
        let state = &mut inner.gens[gen];
        state.threshold = state.capacity.max(state.used.saturating_mul(2));
    }

    report.duration = timer.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocPoint, Reservation};
    use crate::config::{GcConfig, GenerationParams, KB, MB};
    use crate::object::format::{init_object, init_weak_array, size_array, size_obj, weak_splatted};
    use crate::object::types::{GcType, TypeHandle};
    use std::cell::RefCell;

    #[derive(Default)]
    struct TestRoots {
        ambiguous: RefCell<Vec<usize>>,
        exact: RefCell<Vec<usize>>,
    }

    impl RootWalker for TestRoots {
        fn ambiguous<S: Scanner>(&self, s: &mut S) -> std::result::Result<(), S::Error> {
            scan::array(s, &mut self.ambiguous.borrow_mut())
        }

        fn exact<S: Scanner>(&self, s: &mut S) -> std::result::Result<(), S::Error> {
            scan::array(s, &mut self.exact.borrow_mut())
        }
    }

    fn heap() -> Heap {
        let config = GcConfig {
            chunk_size: 64 * KB,
            alloc_buffer_size: 4 * KB,
            reserve_size: 16 * KB,
            max_heap_size: 8 * MB,
            ..Default::default()
        };
        let gens = [
            GenerationParams::new(MB, 0.9),
            GenerationParams::new(2 * MB, 0.5),
            GenerationParams::new(4 * MB, 0.1),
        ];
        Heap::new(&config, &gens).unwrap()
    }

    fn reserve(heap: &Heap, ap: &mut AllocPoint, size: usize) -> usize {
        match heap.reserve(ap, size, true).unwrap() {
            Reservation::Ready(base) => base,
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Two-slot node type
    fn node(heap: &Heap) -> (TypeHandle, usize) {
        let ty = GcType::object(16).with_offsets(&[0, 8]);
        let size = size_obj(&ty).unwrap();
        (heap.types.alloc(ty).unwrap(), size)
    }

    fn new_node(heap: &Heap, ap: &mut AllocPoint, ty: TypeHandle, size: usize) -> usize {
        let base = reserve(heap, ap, size);
        unsafe { init_object(base, ty.to_raw(), size) }
    }

    fn slot(client: usize, index: usize) -> &'static mut usize {
        unsafe { &mut *((client + index * 8) as *mut usize) }
    }

    #[test]
    fn test_exact_root_evacuates_reachable_graph() {
        let heap = heap();
        let (ty, size) = node(&heap);
        let mut ap = AllocPoint::new(PoolKind::Main, 0);
        let parent = new_node(&heap, &mut ap, ty, size);
        let child = new_node(&heap, &mut ap, ty, size);
        let _garbage = new_node(&heap, &mut ap, ty, size);
        *slot(parent, 0) = child;
        *slot(child, 1) = 0xabc;
        ap.flush();

        let roots = TestRoots::default();
        roots.exact.borrow_mut().push(parent);
        let report = collect(&heap, &roots, 0, 1).unwrap();

        let moved = roots.exact.borrow()[0];
        assert_ne!(moved, parent);
        assert_eq!(report.copied_objects, 2);
        assert_eq!(heap.locate(moved), Some((PoolKind::Main, 1)));
        let new_child = *slot(moved, 0);
        assert_ne!(new_child, child);
        assert_eq!(*slot(new_child, 1), 0xabc);
        assert!(report.moved.iter().any(|&(lo, hi)| parent >= lo && parent < hi));
    }

    #[test]
    fn test_ambiguous_root_nails_in_place() {
        let heap = heap();
        let (ty, size) = node(&heap);
        let mut ap = AllocPoint::new(PoolKind::Main, 0);
        let pinned = new_node(&heap, &mut ap, ty, size);
        let child = new_node(&heap, &mut ap, ty, size);
        *slot(pinned, 0) = child;
        ap.flush();

        let roots = TestRoots::default();
        // Interior pointers pin too
        roots.ambiguous.borrow_mut().push(pinned + 8);
        let report = collect(&heap, &roots, 0, 1).unwrap();

        assert_eq!(roots.ambiguous.borrow()[0], pinned + 8);
        assert_eq!(report.nailed_chunks, 1);
        assert_eq!(report.copied_objects, 0);
        assert_eq!(*slot(pinned, 0), child);
        unsafe {
            assert_eq!(record_kind(base_of(pinned)), RecordKind::Object);
            assert!(!header_at(base_of(pinned)).is_marked());
        }
        assert_eq!(heap.locate(pinned), Some((PoolKind::Main, 1)));
    }

    #[test]
    fn test_weak_array_splats_dead_targets() {
        let heap = heap();
        let (ty, size) = node(&heap);
        let weak_ty = GcType::weak_array();
        let weak_size = size_array(&weak_ty, 2).unwrap();
        let weak_handle = heap.types.alloc(weak_ty).unwrap();

        let mut ap = AllocPoint::new(PoolKind::Main, 0);
        let live = new_node(&heap, &mut ap, ty, size);
        let dead = new_node(&heap, &mut ap, ty, size);
        let weak = unsafe { init_weak_array(reserve(&heap, &mut ap, weak_size), weak_handle.to_raw(), weak_size, 2) };
        let elements = array_elements(weak);
        unsafe {
            *(elements as *mut usize) = live;
            *((elements + 8) as *mut usize) = dead;
        }
        ap.flush();

        let roots = TestRoots::default();
        roots.exact.borrow_mut().extend([weak, live]);
        let report = collect(&heap, &roots, 0, 1).unwrap();

        let weak = roots.exact.borrow()[0];
        let live = roots.exact.borrow()[1];
        let elements = array_elements(weak);
        unsafe {
            assert_eq!(*(elements as *const usize), live);
            assert_eq!(*((elements + 8) as *const usize), 0);
            assert_eq!(weak_splatted(weak), 1);
        }
        assert_eq!(report.weak_splatted, 1);
    }

    #[test]
    fn test_unreachable_finalizable_is_posted_and_resurrected() {
        let heap = heap();
        let (ty, size) = node(&heap);
        let mut ap = AllocPoint::new(PoolKind::Main, 0);
        let doomed = new_node(&heap, &mut ap, ty, size);
        let kept = new_node(&heap, &mut ap, ty, size);
        *slot(doomed, 1) = 42;
        ap.flush();
        heap.register_finalizer(doomed);
        heap.register_finalizer(kept);

        let roots = TestRoots::default();
        roots.exact.borrow_mut().push(kept);
        let report = collect(&heap, &roots, 0, 1).unwrap();

        assert_eq!(report.posted.len(), 1);
        let posted = report.posted[0];
        assert_eq!(*slot(posted, 1), 42);
        assert_eq!(heap.finalizable_count(), 1);
        assert_eq!(heap.lock().finalizable[0], roots.exact.borrow()[0]);
    }

    #[test]
    fn test_thresholds_follow_survivors() {
        let heap = heap();
        let (ty, size) = node(&heap);
        let mut ap = AllocPoint::new(PoolKind::Main, 0);
        for _ in 0..100 {
            new_node(&heap, &mut ap, ty, size);
        }
        ap.flush();

        let report = collect(&heap, &TestRoots::default(), 2, 1).unwrap();
        assert!(report.full);
        assert!(report.reclaimed_bytes >= 100 * size);
        let inner = heap.lock();
        assert_eq!(inner.gens[0].used, 0);
        assert_eq!(inner.gens[0].threshold, MB);
    }
}
