//! Test Utilities for the MGC Test Suite
//!
//! Every integration test is written once, generic over `Backend`, and
//! instantiated for both collectors with `backend_tests!`.
//!
//! ============================================================================
//! Objects are plain addresses. Anything a test keeps across an allocation or
//! a collection MUST live in a `RootSlots`; locals are not scanned.
//! ============================================================================

#![allow(dead_code)]

use mgc::config::GenerationParams;
use mgc::object::RecordKind;
use mgc::{Backend, Gc, GcConfig, GcType, RootSlots, StackSet, ThreadContext, TypeHandle};
use std::sync::Arc;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Instantiate generic test functions for both backends
///
/// ```ignore
/// fn test_something<B: Backend>() { ... }
/// backend_tests!(test_something);
/// ```
macro_rules! backend_tests {
    ($($name:ident),* $(,)?) => {
        mod pool {
            $(
                #[test]
                fn $name() {
                    super::$name::<mgc::PoolBackend>();
                }
            )*
        }

        mod generational {
            $(
                #[test]
                fn $name() {
                    super::$name::<mgc::GenerationalBackend>();
                }
            )*
        }
    };
}

/// Configuration with small chunks and the backend's own generations
pub fn test_config() -> GcConfig {
    GcConfig {
        chunk_size: 64 * KB,
        alloc_buffer_size: 4 * KB,
        max_heap_size: 256 * MB,
        ..Default::default()
    }
}

/// Configuration whose nursery fills after a few hundred kilobytes
pub fn small_generations() -> GcConfig {
    GcConfig {
        generations: vec![
            GenerationParams::new(256 * KB, 0.9),
            GenerationParams::new(MB, 0.5),
            GenerationParams::new(4 * MB, 0.1),
        ],
        ..test_config()
    }
}

// ============================================================================
// GC FIXTURE
// ============================================================================

/// Collector with the calling thread attached
///
/// Detaches on drop.
pub struct GcFixture<B: Backend> {
    pub gc: Arc<Gc<B>>,
    pub stacks: Arc<StackSet>,
    ctx: Option<ThreadContext<B>>,
}

impl<B: Backend> GcFixture<B> {
    /// Create fixture with the test configuration
    ///
    /// **Bug this finds:** Initialization failures, attach bookkeeping
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: GcConfig) -> Self {
        let gc = Gc::<B>::new(config).expect("collector creation should succeed with a valid config");
        let stacks = Arc::new(StackSet::new());
        let ctx = gc
            .attach_thread(stacks.clone())
            .expect("attaching the test thread should succeed");
        Self {
            gc,
            stacks,
            ctx: Some(ctx),
        }
    }

    pub fn ctx(&self) -> &ThreadContext<B> {
        self.ctx.as_ref().expect("fixture thread is attached")
    }

    /// Descriptor of a two-field node: `next` at 0, `data` at 8
    pub fn node_type(&self) -> TypeHandle {
        self.gc
            .alloc_type(GcType::object(16).with_offsets(&[0]))
            .expect("node type")
    }

    /// Descriptor of an array of references
    pub fn ref_array_type(&self) -> TypeHandle {
        self.gc
            .alloc_type(GcType::array(8).with_offsets(&[0]))
            .expect("ref array type")
    }

    pub fn weak_array_type(&self) -> TypeHandle {
        self.gc.alloc_type(GcType::weak_array()).expect("weak array type")
    }

    pub fn roots(&self, count: usize) -> RootSlots {
        self.gc.root_slots(count).expect("root slots")
    }

    /// Allocate a node and store it in `roots[index]`
    pub fn alloc_rooted(&self, ty: TypeHandle, roots: &RootSlots, index: usize) -> usize {
        let obj = self
            .gc
            .alloc(self.ctx(), ty)
            .unwrap_or_else(|e| panic!("allocation failed: {}", e));
        roots.set(index, obj);
        obj
    }

    /// Every object and code block currently in the heap
    pub fn objects(&self) -> Vec<(usize, usize, RecordKind)> {
        let mut seen = Vec::new();
        self.gc.walk_objects(|client, size, kind| seen.push((client, size, kind)));
        seen
    }

    /// Whether the walker still reports `client`
    pub fn walks(&self, client: usize) -> bool {
        self.objects().iter().any(|&(c, _, _)| c == client)
    }

    pub fn collect(&self) {
        self.gc.collect().expect("collection should succeed");
    }
}

impl<B: Backend> Drop for GcFixture<B> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let _ = self.gc.detach_thread(ctx);
        }
    }
}

// ============================================================================
// RAW ACCESS
// ============================================================================

/// Word `index` of the object at `client`
pub fn field(client: usize, index: usize) -> usize {
    // SAFETY: tests only read fields of objects they allocated.
    unsafe { *((client + index * 8) as *const usize) }
}

pub fn set_field(client: usize, index: usize, value: usize) {
    // SAFETY: as `field`.
    unsafe { *((client + index * 8) as *mut usize) = value }
}

/// Element `index` of the array at `client`
pub fn element(client: usize, index: usize) -> usize {
    field(mgc::object::format::array_elements(client), index)
}

pub fn set_element(client: usize, index: usize, value: usize) {
    set_field(mgc::object::format::array_elements(client), index, value)
}

// ============================================================================
// ASSERT HELPERS
// ============================================================================

/// Assert that `obj` is a live object of type `ty`
///
/// **Bug this finds:** Objects reclaimed while reachable, headers clobbered
/// by copying
pub fn assert_live<B: Backend>(gc: &Gc<B>, obj: usize, ty: TypeHandle, context: &str) {
    assert!(gc.live_object(obj), "{}: {:#x} should be a live object", context, obj);
    assert_eq!(gc.type_of(obj), Some(ty), "{}: type of {:#x} changed", context, obj);
}
