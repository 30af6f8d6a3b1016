//! Heap Module - chunked heap shared by both backends
//!
//! The heap is a set of chunks (see `chunk`), each tied to a pool and a
//! generation. It hands out allocation buffers, dedicated chunks for large
//! objects and first-fit blocks of the non-moving pool, and it tracks the
//! per-generation occupancy that decides when a collection is due.
//!
//! The heap also owns the metadata every record refers to: the type
//! descriptor pool and the code side tables.
//!
//! ## Locking
//!
//! `HeapInner` sits behind a mutex that is always taken after the world
//! lock and after any allocation point lock.

pub mod chunk;

pub use chunk::{Chunk, ChunkState, PoolKind};

use crate::allocator::{AllocPoint, Reservation};
use crate::code::CodeTables;
use crate::config::{GcConfig, GenerationParams};
use crate::error::Result;
use crate::object::header::{client_of, header_at, record_kind, write_pad, RecordKind};
use crate::object::types::{TypeHandle, TypePool};
use crate::scan::{self, Scanner};
use crate::util::Alignment;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;

/// Occupancy and trigger of one generation
#[derive(Debug, Clone, Copy)]
pub struct GenState {
    pub capacity: usize,
    pub mortality: f64,
    /// Collect once `used` would exceed this
    pub threshold: usize,
    pub used: usize,
}

/// Heap state guarded by the heap lock
pub struct HeapInner {
    pub(crate) chunks: Vec<Option<Chunk>>,
    free_slots: Vec<usize>,
    pub(crate) by_base: BTreeMap<usize, usize>,
    pub(crate) gens: Vec<GenState>,
    current: FxHashMap<(PoolKind, usize), usize>,
    /// Client addresses of objects waiting to become unreachable
    pub(crate) finalizable: Vec<usize>,
    /// Free blocks of the non-moving pool as `(base, size)`
    pub(crate) static_free: Vec<(usize, usize)>,
    pub(crate) mapped: usize,
}

impl HeapInner {
    #[inline]
    pub(crate) fn last_gen(&self) -> usize {
        self.gens.len() - 1
    }

    pub(crate) fn add_chunk(&mut self, chunk: Chunk) -> usize {
        self.mapped += chunk.mapped();
        let base = chunk.base;
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.chunks[id] = Some(chunk);
                id
            },
            None => {
                self.chunks.push(Some(chunk));
                self.chunks.len() - 1
            },
        };
        self.by_base.insert(base, id);
        id
    }

    pub(crate) fn remove_chunk(&mut self, id: usize) -> Option<Chunk> {
        let chunk = self.chunks.get_mut(id)?.take()?;
        self.by_base.remove(&chunk.base);
        self.free_slots.push(id);
        self.mapped -= chunk.mapped();
        self.current.retain(|_, current| *current != id);
        Some(chunk)
    }

    /// Chunk whose formatted part contains `addr`
    #[inline]
    pub(crate) fn chunk_id_of(&self, addr: usize) -> Option<usize> {
        let (_, &id) = self.by_base.range(..=addr).next_back()?;
        let chunk = self.chunks[id].as_ref()?;
        chunk.contains(addr).then_some(id)
    }

    pub(crate) fn chunk_of(&self, addr: usize) -> Option<&Chunk> {
        self.chunk_id_of(addr).and_then(|id| self.chunks[id].as_ref())
    }

    pub(crate) fn chunk_mut(&mut self, id: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(id).and_then(Option::as_mut)
    }

    /// Ids of all chunks in address order
    pub(crate) fn chunk_ids(&self) -> Vec<usize> {
        self.by_base.values().copied().collect()
    }

    /// Highest generation at or above `gen` that is over its threshold
    /// once `extra` more bytes land in `gen`
    fn due(&self, gen: usize, extra: usize) -> Option<usize> {
        let mut due = None;
        for (index, state) in self.gens.iter().enumerate().skip(gen) {
            let used = if index == gen { state.used + extra } else { state.used };
            if used > state.threshold {
                due = Some(index);
            }
        }
        due
    }

    /// Forget the allocation chunk of every moving pool
    ///
    /// Chunks that survived a collection hold live data up to their top, so
    /// new buffers come from fresh chunks afterwards.
    pub(crate) fn reset_current(&mut self) {
        self.current.retain(|&(pool, _), _| !pool.is_moving());
    }

    /// Recompute generation occupancy from the chunks
    pub(crate) fn recount(&mut self) {
        for state in self.gens.iter_mut() {
            state.used = 0;
        }
        for chunk in self.chunks.iter().flatten() {
            if chunk.pool.is_moving() {
                let gen = chunk.gen.min(self.gens.len() - 1);
                self.gens[gen].used += chunk.used();
            }
        }
    }

    /// Map a chunk for `pool`/`gen`, ignoring the heap limit
    pub(crate) fn map_chunk(&mut self, size: usize, pool: PoolKind, gen: usize, large: bool) -> Result<usize> {
        let chunk = Chunk::map(size, pool, gen, large)?;
        log::trace!("mapped {:?}", chunk);
        Ok(self.add_chunk(chunk))
    }
}

/// Chunked heap
pub struct Heap {
    chunk_size: usize,
    max_heap: usize,
    buffer_size: usize,
    inner: Mutex<HeapInner>,
    pub types: TypePool,
    pub code: CodeTables,
}

impl Heap {
    /// Create a heap with the non-moving reserve mapped
    pub fn new(config: &GcConfig, generations: &[GenerationParams]) -> Result<Self> {
        let page = page_size::get();
        let chunk_size = Alignment::align_up(config.chunk_size, page);

        let gens = generations
            .iter()
            .map(|g| GenState {
                capacity: g.capacity,
                mortality: g.mortality,
                threshold: g.capacity,
                used: 0,
            })
            .collect();

        let mut inner = HeapInner {
            chunks: Vec::new(),
            free_slots: Vec::new(),
            by_base: BTreeMap::new(),
            gens,
            current: FxHashMap::default(),
            finalizable: Vec::new(),
            static_free: Vec::new(),
            mapped: 0,
        };

        let last = inner.last_gen();
        let reserve = inner.map_chunk(config.reserve_size.max(page), PoolKind::Static, last, false)?;
        inner.current.insert((PoolKind::Static, last), reserve);

        Ok(Self {
            chunk_size,
            max_heap: config.max_heap_size,
            buffer_size: config.alloc_buffer_size,
            inner: Mutex::new(inner),
            types: TypePool::new(),
            code: CodeTables::new(),
        })
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Objects above this size get a dedicated chunk
    #[inline]
    pub fn large_threshold(&self) -> usize {
        self.chunk_size / 4
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HeapInner> {
        self.inner.lock()
    }

    /// Reserve `size` bytes through `ap`
    ///
    /// With `grow` set the generation thresholds are ignored, which is how
    /// the slow path retries after the collection it asked for.
    pub fn reserve(&self, ap: &mut AllocPoint, size: usize, grow: bool) -> Result<Reservation> {
        if let Some(base) = ap.try_bump(size) {
            return Ok(Reservation::Ready(base));
        }
        if size > self.large_threshold() {
            return self.reserve_large(ap.pool(), ap.gen(), size, grow);
        }

        let mut inner = self.inner.lock();
        let key = (ap.pool(), ap.gen());
        let want = self.buffer_size.max(size);

        if let Some(&id) = inner.current.get(&key) {
            if let Some(buffer) = Self::carve(&mut inner, id, size, want) {
                ap.refill(buffer.0, buffer.1);
                return Ok(ap.try_bump(size).map_or(Reservation::Exhausted, Reservation::Ready));
            }
        }

        if let Some(outcome) = self.check_growth(&inner, ap.gen(), grow) {
            return Ok(outcome);
        }

        let id = inner.map_chunk(self.chunk_size, ap.pool(), ap.gen(), false)?;
        inner.current.insert(key, id);
        match Self::carve(&mut inner, id, size, want) {
            Some((start, limit)) => {
                ap.refill(start, limit);
                Ok(ap.try_bump(size).map_or(Reservation::Exhausted, Reservation::Ready))
            },
            None => Ok(Reservation::Exhausted),
        }
    }

    fn carve(inner: &mut HeapInner, id: usize, size: usize, want: usize) -> Option<(usize, usize)> {
        let chunk = inner.chunk_mut(id)?;
        if chunk.free() < size {
            return None;
        }
        let take = want.min(chunk.free());
        let gen = chunk.gen;
        let pool = chunk.pool;
        let start = chunk.bump(take)?;
        if pool.is_moving() {
            inner.gens[gen].used += take;
        }
        Some((start, start + take))
    }

    fn check_growth(&self, inner: &HeapInner, gen: usize, grow: bool) -> Option<Reservation> {
        if !grow {
            if let Some(due) = inner.due(gen, self.chunk_size) {
                return Some(Reservation::Collect(due));
            }
        }
        if inner.mapped + self.chunk_size > self.max_heap {
            return Some(Reservation::Exhausted);
        }
        None
    }

    /// Give a large object its own chunk
    fn reserve_large(&self, pool: PoolKind, gen: usize, size: usize, grow: bool) -> Result<Reservation> {
        let mut inner = self.inner.lock();
        if !grow {
            if let Some(due) = inner.due(gen, size) {
                return Ok(Reservation::Collect(due));
            }
        }
        if inner.mapped.saturating_add(size) > self.max_heap {
            return Ok(Reservation::Exhausted);
        }

        let id = inner.map_chunk(size, pool, gen, true)?;
        let chunk = match inner.chunk_mut(id) {
            Some(chunk) => chunk,
            None => return Ok(Reservation::Exhausted),
        };
        let base = chunk.bump(size);
        if pool.is_moving() {
            inner.gens[gen].used += size;
        }
        Ok(base.map_or(Reservation::Exhausted, Reservation::Ready))
    }

    /// Reserve `size` bytes in the non-moving pool
    ///
    /// Never asks for a collection; `Exhausted` means the heap limit is hit.
    pub fn reserve_static(&self, size: usize) -> Result<Reservation> {
        let mut inner = self.inner.lock();

        // First fit from swept holes; a split remainder must hold a pad.
        let hit = inner
            .static_free
            .iter()
            .position(|&(_, free)| free == size || free >= size + crate::object::header::OBJECT_ALIGNMENT);
        if let Some(index) = hit {
            let (base, free) = inner.static_free[index];
            if free == size {
                inner.static_free.swap_remove(index);
            } else {
                // SAFETY: the remainder is part of a swept hole owned by the pool.
                unsafe { write_pad(base + size, free - size) };
                inner.static_free[index] = (base + size, free - size);
            }
            return Ok(Reservation::Ready(base));
        }

        let last = inner.last_gen();
        if size > self.large_threshold() {
            if inner.mapped.saturating_add(size) > self.max_heap {
                return Ok(Reservation::Exhausted);
            }
            let id = inner.map_chunk(size, PoolKind::Static, last, true)?;
            return Ok(inner
                .chunk_mut(id)
                .and_then(|chunk| chunk.bump(size))
                .map_or(Reservation::Exhausted, Reservation::Ready));
        }

        let key = (PoolKind::Static, last);
        if let Some(&id) = inner.current.get(&key) {
            if let Some(base) = inner.chunk_mut(id).and_then(|chunk| chunk.bump(size)) {
                return Ok(Reservation::Ready(base));
            }
        }

        if inner.mapped + self.chunk_size > self.max_heap {
            return Ok(Reservation::Exhausted);
        }
        let id = inner.map_chunk(self.chunk_size, PoolKind::Static, last, false)?;
        inner.current.insert(key, id);
        Ok(inner
            .chunk_mut(id)
            .and_then(|chunk| chunk.bump(size))
            .map_or(Reservation::Exhausted, Reservation::Ready))
    }

    /// Number of generations
    pub fn generations(&self) -> usize {
        self.inner.lock().gens.len()
    }

    /// Youngest generation whose occupancy is over its threshold
    pub fn youngest_due(&self) -> Option<usize> {
        let inner = self.inner.lock();
        inner.gens.iter().position(|g| g.used > g.threshold)
    }

    /// Queue `client` for finalization once it becomes unreachable
    pub fn register_finalizer(&self, client: usize) {
        self.inner.lock().finalizable.push(client);
    }

    /// Number of objects registered for finalization
    pub fn finalizable_count(&self) -> usize {
        self.inner.lock().finalizable.len()
    }

    /// Pool and generation of the chunk holding `addr`
    pub fn locate(&self, addr: usize) -> Option<(PoolKind, usize)> {
        self.inner.lock().chunk_of(addr).map(|chunk| (chunk.pool, chunk.gen))
    }

    /// Whether `addr` lies in the formatted part of some chunk
    pub fn contains(&self, addr: usize) -> bool {
        self.inner.lock().chunk_of(addr).is_some()
    }

    /// Visit every object and code record
    ///
    /// The caller must hold the world stopped with allocation points
    /// flushed. Records are gathered first and `f` runs with the heap
    /// unlocked, so it may query the heap (`contains`, `locate`).
    pub fn walk<F: FnMut(usize, usize, RecordKind)>(&self, mut f: F) {
        for (client, size, kind) in self.records() {
            f(client, size, kind);
        }
    }

    /// `(client, size, kind)` of every object and code record
    fn records(&self) -> Vec<(usize, usize, RecordKind)> {
        let inner = self.inner.lock();
        let mut records = Vec::new();
        for id in inner.chunk_ids() {
            if let Some(chunk) = inner.chunks[id].as_ref() {
                // SAFETY: allocation points are flushed, so chunks are formatted.
                for base in unsafe { chunk.records() } {
                    let kind = unsafe { record_kind(base) };
                    if matches!(kind, RecordKind::Object | RecordKind::Code) {
                        records.push((client_of(base), unsafe { crate::object::header::record_size(base) }, kind));
                    }
                }
            }
        }
        records
    }

    /// Type handles referenced from the heap
    ///
    /// Collects every header handle and the handle stored in each
    /// `Type`-kind object. Same requirements as `walk`.
    pub fn live_types(&self) -> FxHashSet<TypeHandle> {
        let inner = self.inner.lock();
        let types = self.types.table();
        let mut marker = TypeMarker {
            live: FxHashSet::default(),
        };
        for id in inner.chunk_ids() {
            if let Some(chunk) = inner.chunks[id].as_ref() {
                // SAFETY: allocation points are flushed, so chunks are formatted.
                let walked = unsafe { scan::objects(&mut marker, chunk.base, chunk.top, &types) };
                if let Err(never) = walked {
                    match never {}
                }
            }
        }
        marker.live
    }

    /// Occupancy per pool and generation
    pub fn pool_summaries(&self) -> (Vec<PoolSummary>, Vec<GenerationSummary>) {
        let inner = self.inner.lock();
        let mut pools: Vec<PoolSummary> = PoolKind::ALL
            .iter()
            .map(|&pool| PoolSummary {
                pool,
                chunks: 0,
                mapped: 0,
                used: 0,
                free: 0,
                fragmentation: 0.0,
            })
            .collect();

        for chunk in inner.chunks.iter().flatten() {
            let summary = &mut pools[chunk.pool.index()];
            summary.chunks += 1;
            summary.mapped += chunk.mapped();
            summary.used += chunk.used();
            summary.free += chunk.free();
        }
        for summary in pools.iter_mut() {
            if summary.mapped > 0 {
                summary.fragmentation = summary.free as f64 / summary.mapped as f64;
            }
        }
        if let Some(summary) = pools.get_mut(PoolKind::Static.index()) {
            let holes: usize = inner.static_free.iter().map(|&(_, size)| size).sum();
            summary.used -= holes.min(summary.used);
            summary.free += holes;
        }

        let gens = inner
            .gens
            .iter()
            .enumerate()
            .map(|(index, g)| GenerationSummary {
                index,
                capacity: g.capacity,
                mortality: g.mortality,
                threshold: g.threshold,
                used: g.used,
            })
            .collect();

        (pools, gens)
    }

    /// Bytes of mapped memory
    pub fn mapped(&self) -> usize {
        self.inner.lock().mapped
    }
}

/// Marks the type handles found by a heap walk
struct TypeMarker {
    live: FxHashSet<TypeHandle>,
}

impl Scanner for TypeMarker {
    type Error = Infallible;

    #[inline]
    fn fix1(&mut self, _word: usize) -> bool {
        false
    }

    fn fix2(&mut self, _slot: &mut usize) -> std::result::Result<(), Infallible> {
        Ok(())
    }

    #[inline]
    fn fix_header1(&mut self, _ty: TypeHandle) -> bool {
        true
    }

    fn fix_header2(&mut self, ty: TypeHandle) -> std::result::Result<(), Infallible> {
        self.live.insert(ty);
        Ok(())
    }
}

/// Occupancy of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub pool: PoolKind,
    pub chunks: usize,
    pub mapped: usize,
    pub used: usize,
    pub free: usize,
    /// Free share of the mapped bytes
    pub fragmentation: f64,
}

/// Occupancy of one generation
#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub index: usize,
    pub capacity: usize,
    pub mortality: f64,
    pub threshold: usize,
    pub used: usize,
}

/// Check if the record at `client` is a non-finalized object
///
/// # Safety
/// `client` must be the client address of a record in a mapped chunk.
pub unsafe fn is_live_object(client: usize) -> bool {
    let header = header_at(crate::object::base_of(client));
    header.kind() == RecordKind::Object && !header.is_finalized()
}
