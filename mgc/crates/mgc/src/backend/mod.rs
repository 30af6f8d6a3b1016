//! Backend Module - compile-time collector contract
//!
//! `Gc<B>` is monomorphized over a `Backend`. Both backends run on the
//! shared chunked heap and mostly-copying tracer (`Shared`); they differ in
//! generation sizes, pool placement, finalization timing and the watch
//! flavour:
//!
//! | | pool | generational |
//! |---|---|---|
//! | generations | 8MB/0.9, 32MB/0.5, 128MB/0.1 | 1MB, 10MB, 100MB |
//! | weak arrays | generation 2 | nursery |
//! | hash arrays | long-lived generation | nursery |
//! | finalizers | drained by allocation polls and `collect` | right after each collection |
//! | watch | `EpochWatch` | `AddrWatch` |

pub mod generational;
pub mod pool;
pub mod shared;

pub use generational::GenerationalBackend;
pub use pool::PoolBackend;
pub use shared::{Placement, Shared};

use crate::allocator::AllocPool;
use crate::config::{GcConfig, GenerationParams};
use crate::error::Result;
use crate::logging::GcLogger;
use crate::object::header::RecordKind;
use crate::roots::RootHandle;
use crate::runtime::ThreadRecord;
use crate::scan::StackSet;
use crate::stats::MemorySummary;
use crate::watch::LocationWatch;
use std::sync::Arc;
use std::time::Duration;

/// Collector backend
pub trait Backend: Send + Sync + Sized + 'static {
    /// Location-dependency watch handed out by `create_watch`
    type Watch: LocationWatch;

    /// Backend name used in logs and summaries
    const NAME: &'static str;

    /// Whether finalizers run at the end of the collecting call instead of
    /// at allocation polls
    const PROMPT_FINALIZATION: bool;

    /// Generation chain used when the configuration names none
    fn default_generations() -> Vec<GenerationParams>;

    fn new(config: &GcConfig, logger: Arc<GcLogger>) -> Result<Self>;

    fn shared(&self) -> &Shared;

    fn attach_thread(&self, stacks: Arc<StackSet>) -> Result<Arc<ThreadRecord>> {
        self.shared().attach(stacks)
    }

    fn detach_thread(&self, thread: &Arc<ThreadRecord>) -> Result<()> {
        self.shared().detach(thread)
    }

    /// Reserve and format `size` bytes from `pool`
    fn reserve<F>(&self, thread: &ThreadRecord, pool: AllocPool, size: usize, init: F) -> Result<usize>
    where
        F: FnOnce(usize) -> usize,
    {
        self.shared().reserve(thread, pool, size, init)
    }

    /// Reserve and format `size` bytes from the non-moving pool
    fn reserve_static<F>(&self, size: usize, init: F) -> Result<usize>
    where
        F: FnOnce(usize) -> usize,
    {
        self.shared().reserve_static(size, init)
    }

    /// Queue `client` for finalization once it becomes unreachable
    fn register_finalizer(&self, client: usize) {
        self.shared().heap.register_finalizer(client);
    }

    /// Full blocking collection
    fn collect(&self) -> Result<()>;

    /// Run bounded collection steps; true if work remains
    fn collect_step(&self, budget: Duration) -> Result<bool> {
        self.shared().step(budget)
    }

    fn create_watch(&self) -> Self::Watch;

    /// # Safety
    /// See `RootSet::create`.
    unsafe fn create_root(&self, base: usize, count: usize, ambiguous: bool) -> Result<RootHandle> {
        self.shared().create_root(base, count, ambiguous)
    }

    fn destroy_root(&self, handle: RootHandle) -> Result<()> {
        self.shared().destroy_root(handle)
    }

    fn walk_objects<F: FnMut(usize, usize, RecordKind)>(&self, f: F) {
        self.shared().walk_objects(f)
    }

    fn summary(&self) -> MemorySummary {
        self.shared().summary()
    }
}
