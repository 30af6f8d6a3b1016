//! GC Front-End - allocation and metadata entry points
//!
//! `Gc<B>` is what the runtime talks to. It sizes and formats every
//! allocation, registers finalizable objects, answers format-level queries
//! (`type_of`, `switch_type`, code-block introspection) and forwards
//! collection, roots and watches to the backend.
//!
//! ## Addresses
//!
//! Objects are handed out as client addresses (`usize`). A collection may
//! move any object that is only referenced exactly, so an address must be
//! kept in a root (`RootSlots`, a registered region or a scanned stack) and
//! re-read after anything that can collect.
//!
//! ## Failure
//!
//! A failed reservation first tries to allocate the reflection layer's
//! error object from the non-moving reserve. The error carries it when
//! that works.

use crate::allocator::AllocPool;
use crate::backend::Backend;
use crate::code::{self, CodeBlock, CodeTables, CODE_TABLE_HEADER};
use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::logging::{GcEvent, GcLogger};
use crate::object::format::{
    array_count, init_array, init_code, init_object, init_weak_array, size_array, size_code, size_obj,
};
use crate::object::header::{header_at, record_size, RecordKind, HEADER_SIZE};
use crate::object::types::{GcKind, GcType, TypeHandle};
use crate::roots::{RootHandle, RootSlots};
use crate::runtime::ThreadContext;
use crate::scan::StackSet;
use crate::stats::{MemorySummary, StatsSnapshot};
use crate::util::constants::WORD;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

lazy_static::lazy_static! {
    static ref NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);
}

/// Message code stored in an out-of-memory error object
pub const OUT_OF_MEMORY_MESSAGE: usize = 1;

/// Collector instance
pub struct Gc<B: Backend> {
    id: u64,
    config: GcConfig,
    logger: Arc<GcLogger>,
    backend: B,
    /// Raw handle of the reflection layer's error type, 0 if unset
    error_type: AtomicUsize,
}

impl<B: Backend> Gc<B> {
    /// Create a collector
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mgc::{DefaultGc, GcConfig};
    ///
    /// let gc = DefaultGc::new(GcConfig::default()).unwrap();
    /// assert_eq!(gc.summary().threads, 0);
    /// ```
    pub fn new(config: GcConfig) -> Result<Arc<Self>> {
        let logger = Arc::new(GcLogger::for_verbosity(config.verbose));
        let backend = B::new(&config, logger.clone())?;
        let id = NEXT_GC_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("collector {} created with the {} backend", id, B::NAME);

        Ok(Arc::new(Self {
            id,
            config,
            logger,
            backend,
            error_type: AtomicUsize::new(0),
        }))
    }

    /// Process-unique collector id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn logger(&self) -> &Arc<GcLogger> {
        &self.logger
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Side tables code blocks refer to through `CodeInfo`/`UnwindInfo`
    pub fn code_tables(&self) -> &CodeTables {
        &self.backend.shared().heap.code
    }

    fn check(&self, ctx: &ThreadContext<B>) -> Result<()> {
        if ctx.gc().id() != self.id || !ctx.record().is_attached() {
            return Err(GcError::NotAttached);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Threads

    /// Attach the calling OS thread
    ///
    /// `stacks` are scanned ambiguously for as long as the thread stays
    /// attached.
    pub fn attach_thread(self: &Arc<Self>, stacks: Arc<StackSet>) -> Result<ThreadContext<B>> {
        let record = self.backend.attach_thread(stacks)?;
        Ok(ThreadContext::new(self.clone(), record))
    }

    pub fn detach_thread(&self, ctx: ThreadContext<B>) -> Result<()> {
        self.check(&ctx)?;
        self.backend.detach_thread(ctx.record())?;
        ctx.forget();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocation

    fn reserve<F>(&self, ctx: &ThreadContext<B>, pool: AllocPool, size: usize, what: &'static str, finalizable: bool, init: F) -> Result<usize>
    where
        F: FnOnce(usize) -> usize,
    {
        self.check(ctx)?;
        self.backend.shared().allocation_poll(ctx.record());

        let heap = &self.backend.shared().heap;
        self.backend
            .reserve(ctx.record(), pool, size, |base| {
                let client = init(base);
                if finalizable {
                    // SAFETY: `init` just formatted the record.
                    unsafe { header_at(base) }.set_has_finalizer();
                    heap.register_finalizer(client);
                }
                client
            })
            .map_err(|e| self.fail(e, what))
    }

    /// Turn an allocation failure into the error handed to the caller
    fn fail(&self, err: GcError, what: &'static str) -> GcError {
        let requested = match err {
            GcError::OutOfMemory { requested, .. } => requested,
            other => return other,
        };
        self.logger.log(GcEvent::AllocationFailure { size: requested, what });
        log::warn!("{}: out of memory reserving {} bytes", what, requested);

        GcError::OutOfMemory {
            requested,
            error_object: self.error_object(),
        }
    }

    /// Allocate the registered error type from the non-moving reserve
    fn error_object(&self) -> Option<usize> {
        let raw = self.error_type.load(Ordering::Acquire);
        let handle = TypeHandle::from_raw(raw)?;
        let ty = self.types_get(handle).ok()?;
        let size = size_obj(&ty)?;

        self.backend.shared().reserve_static_now(size, |base| {
            // SAFETY: fresh memory of `size` bytes from the reserve.
            let client = unsafe { init_object(base, raw, size) };
            if ty.stride >= WORD {
                // SAFETY: the body holds at least one word.
                unsafe { *(client as *mut usize) = OUT_OF_MEMORY_MESSAGE };
            }
            client
        })
    }

    fn types_get(&self, handle: TypeHandle) -> Result<Arc<GcType>> {
        self.backend.shared().heap.types.get(handle)
    }

    /// Register the type of out-of-memory error objects
    pub fn set_error_type(&self, ty: TypeHandle) -> Result<()> {
        let desc = self.types_get(ty)?;
        if desc.kind.is_array() {
            return Err(GcError::Usage("error type must be a fixed record".to_string()));
        }
        self.error_type.store(ty.to_raw(), Ordering::Release);
        Ok(())
    }

    /// Allocate a fixed record
    pub fn alloc(&self, ctx: &ThreadContext<B>, ty: TypeHandle) -> Result<usize> {
        let desc = self.types_get(ty)?;
        if desc.kind.is_array() {
            return Err(GcError::Usage("alloc of an array type".to_string()));
        }
        let size = size_obj(&desc).ok_or(GcError::AllocationTooLarge { what: "alloc" })?;
        self.reserve(ctx, AllocPool::Main, size, "alloc", desc.finalizer.is_some(), |base| {
            // SAFETY: `base` starts `size` bytes reserved for this record.
            unsafe { init_object(base, ty.to_raw(), size) }
        })
    }

    fn array_size(&self, ty: TypeHandle, kind: GcKind, count: usize, what: &'static str) -> Result<(Arc<GcType>, usize)> {
        let desc = self.types_get(ty)?;
        if desc.kind != kind {
            return Err(GcError::Usage(format!("{} of a {:?} type", what, desc.kind)));
        }
        let size = size_array(&desc, count).ok_or(GcError::AllocationTooLarge { what })?;
        Ok((desc, size))
    }

    /// Allocate an array of `count` elements
    pub fn alloc_array(&self, ctx: &ThreadContext<B>, ty: TypeHandle, count: usize) -> Result<usize> {
        let (desc, size) = self.array_size(ty, GcKind::Array, count, "alloc_array")?;
        self.reserve(ctx, AllocPool::Main, size, "alloc_array", desc.finalizer.is_some(), |base| {
            // SAFETY: as `alloc`.
            unsafe { init_array(base, ty.to_raw(), size, count) }
        })
    }

    /// Allocate a weak array of `count` elements
    pub fn alloc_weak_array(&self, ctx: &ThreadContext<B>, ty: TypeHandle, count: usize) -> Result<usize> {
        let (desc, size) = self.array_size(ty, GcKind::WeakArray, count, "alloc_weak_array")?;
        self.reserve(ctx, AllocPool::Weak, size, "alloc_weak_array", desc.finalizer.is_some(), |base| {
            // SAFETY: as `alloc`.
            unsafe { init_weak_array(base, ty.to_raw(), size, count) }
        })
    }

    /// Allocate the array of a hash table being rehashed
    ///
    /// Same result as `alloc_array`; the backend may place it where
    /// long-lived tables end up anyway.
    pub fn alloc_array_rehash(&self, ctx: &ThreadContext<B>, ty: TypeHandle, count: usize) -> Result<usize> {
        let (desc, size) = self.array_size(ty, GcKind::Array, count, "alloc_array_rehash")?;
        self.reserve(ctx, AllocPool::Hash, size, "alloc_array_rehash", desc.finalizer.is_some(), |base| {
            // SAFETY: as `alloc`.
            unsafe { init_array(base, ty.to_raw(), size, count) }
        })
    }

    /// Allocate a fixed record in the non-moving pool
    ///
    /// Static records never move; they are swept by full collections like
    /// anything else, so they need a root to survive.
    pub fn alloc_static(&self, ty: TypeHandle) -> Result<usize> {
        let desc = self.types_get(ty)?;
        if desc.kind.is_array() {
            return Err(GcError::Usage("alloc_static of an array type".to_string()));
        }
        let size = size_obj(&desc).ok_or(GcError::AllocationTooLarge { what: "alloc_static" })?;
        let finalizable = desc.finalizer.is_some();
        let heap = &self.backend.shared().heap;

        self.backend
            .reserve_static(size, |base| {
                // SAFETY: as `alloc`.
                let client = unsafe { init_object(base, ty.to_raw(), size) };
                if finalizable {
                    // SAFETY: just formatted above.
                    unsafe { header_at(base) }.set_has_finalizer();
                    heap.register_finalizer(client);
                }
                client
            })
            .map_err(|e| self.fail(e, "alloc_static"))
    }

    /// Allocate a code block of `code_bytes` instruction bytes followed by a
    /// table of `ref_count` reference entries
    ///
    /// Every code block is registered for finalization so its side-table
    /// entries are released when it dies.
    pub fn alloc_code(&self, ctx: &ThreadContext<B>, code_bytes: usize, ref_count: usize) -> Result<usize> {
        let size = size_code(code_bytes, ref_count).ok_or(GcError::AllocationTooLarge { what: "alloc_code" })?;
        self.reserve(ctx, AllocPool::Code, size, "alloc_code", true, |base| {
            // SAFETY: as `alloc`.
            unsafe { init_code(base, code_bytes, ref_count, size) }
        })
    }

    // ------------------------------------------------------------------
    // Type metadata

    /// Register a type descriptor
    pub fn alloc_type(&self, ty: GcType) -> Result<TypeHandle> {
        self.backend.shared().heap.types.alloc(ty)
    }

    /// Release a type descriptor once no object refers to it
    pub fn free_type(&self, ty: TypeHandle) {
        self.backend.shared().free_type(ty)
    }

    /// Descriptor registered under `ty`
    pub fn type_descriptor(&self, ty: TypeHandle) -> Result<Arc<GcType>> {
        self.types_get(ty)
    }

    /// Record start of `obj` if it lies in the heap
    fn record_base(&self, obj: usize) -> Option<usize> {
        let base = obj.checked_sub(HEADER_SIZE)?;
        self.backend.shared().heap.contains(base).then_some(base)
    }

    /// Type of a live object
    ///
    /// None for code blocks, finalized objects and anything outside the heap.
    pub fn type_of(&self, obj: usize) -> Option<TypeHandle> {
        let base = self.record_base(obj)?;
        // SAFETY: `base` lies in a formatted chunk.
        let header = unsafe { header_at(base) };
        if header.kind() != RecordKind::Object || header.is_finalized() {
            return None;
        }
        TypeHandle::from_raw(header.type_raw())
    }

    /// Replace the type of `obj` with one of the same size class
    pub fn switch_type(&self, obj: usize, ty: TypeHandle) -> Result<()> {
        let _world = self.backend.shared().world.enter();
        let base = self
            .record_base(obj)
            .ok_or_else(|| GcError::Usage(format!("{:#x} is not a heap object", obj)))?;
        // SAFETY: `base` lies in a formatted chunk; the world is entered.
        let header = unsafe { header_at(base) };
        if header.kind() != RecordKind::Object {
            return Err(GcError::Usage(format!("{:#x} is not an object", obj)));
        }

        let old = TypeHandle::from_raw(header.type_raw())
            .ok_or_else(|| GcError::Internal(format!("{:#x} has no type", obj)))
            .and_then(|handle| self.types_get(handle))?;
        let new = self.types_get(ty)?;

        let size = if new.kind.is_array() {
            if !old.kind.is_array() {
                return Err(GcError::Usage("switch_type between fixed and array types".to_string()));
            }
            // SAFETY: `obj` is an array.
            size_array(&new, unsafe { array_count(obj) })
        } else {
            size_obj(&new)
        };
        // SAFETY: as above.
        if size != Some(unsafe { record_size(base) }) {
            return Err(GcError::Usage(format!(
                "switch_type of {:#x} to a different size class",
                obj
            )));
        }

        header.set_type_raw(ty.to_raw());
        Ok(())
    }

    /// Whether `obj` is an object that has not been finalized
    pub fn live_object(&self, obj: usize) -> bool {
        match self.record_base(obj) {
            // SAFETY: `obj` lies in a formatted chunk.
            Some(_) => unsafe { crate::heap::is_live_object(obj) },
            None => false,
        }
    }

    pub fn is_code(&self, obj: usize) -> bool {
        match self.record_base(obj) {
            // SAFETY: `base` lies in a formatted chunk.
            Some(base) => unsafe { header_at(base) }.kind() == RecordKind::Code,
            None => false,
        }
    }

    /// View of the code block at `obj`
    pub fn code_block(&self, obj: usize) -> Result<CodeBlock> {
        if !self.is_code(obj) {
            return Err(GcError::Usage(format!("{:#x} is not a code block", obj)));
        }
        // SAFETY: checked above.
        Ok(unsafe { CodeBlock::from_client(obj) })
    }

    /// Number of instruction bytes of the code block at `obj`
    pub fn code_size(&self, obj: usize) -> Result<usize> {
        Ok(self.code_block(obj)?.code_size())
    }

    /// Address and length of the reference table of the code block at `obj`
    pub fn code_refs(&self, obj: usize) -> Result<(usize, usize)> {
        let block = self.code_block(obj)?;
        Ok((block.table_addr() + CODE_TABLE_HEADER, block.ref_count()))
    }

    /// Write the reference table of `obj` into its instructions
    ///
    /// Emitters call this once after filling in the table; the collector
    /// replays it on its own after moves. Fails with `Usage`, writing
    /// nothing, if an entry's field does not fit inside the instructions.
    pub fn patch_code(&self, obj: usize) -> Result<()> {
        let _world = self.backend.shared().world.enter();
        let mut block = self.code_block(obj)?;
        let size = block.code_size();
        if let Some(r) = block.refs().iter().find(|r| r.field_end() > size) {
            return Err(GcError::Usage(format!(
                "code block {:#x}: reference at offset {} overruns its {} instruction bytes",
                obj, r.offset, size
            )));
        }
        code::update_ptrs(&mut block, self.code_tables());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Roots and watches

    /// Register `[base, base + count)` as a root
    ///
    /// # Safety
    /// The words must stay readable, and writable if `ambiguous` is false,
    /// until `destroy_root`.
    pub unsafe fn create_root(&self, base: usize, count: usize, ambiguous: bool) -> Result<RootHandle> {
        self.backend.create_root(base, count, ambiguous)
    }

    pub fn destroy_root(&self, handle: RootHandle) -> Result<()> {
        self.backend.destroy_root(handle)
    }

    /// Owned exact root of `count` slots
    pub fn root_slots(&self, count: usize) -> Result<RootSlots> {
        let shared = self.backend.shared();
        let _world = shared.world.enter();
        RootSlots::new(shared.roots.clone(), count)
    }

    pub fn create_watch(&self) -> B::Watch {
        self.backend.create_watch()
    }

    // ------------------------------------------------------------------
    // Collection and diagnostics

    /// Full blocking collection
    pub fn collect(&self) -> Result<()> {
        self.backend.collect()
    }

    /// Bounded incremental work; true if more is pending
    pub fn collect_step(&self, budget: Duration) -> Result<bool> {
        self.backend.collect_step(budget)
    }

    /// Visit every object and code block as `(client, size, kind)`
    pub fn walk_objects<F: FnMut(usize, usize, RecordKind)>(&self, f: F) {
        self.backend.walk_objects(f)
    }

    pub fn summary(&self) -> MemorySummary {
        self.backend.summary()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.backend.shared().stats.snapshot()
    }
}

impl<B: Backend> std::fmt::Debug for Gc<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gc")
            .field("id", &self.id)
            .field("backend", &B::NAME)
            .finish()
    }
}
