//! # MGC - Memory Manager for a Managed-Language Runtime
//!
//! MGC is the memory-management core of a runtime whose compiled code,
//! green threads and reflection layer live in the collected heap. It owns
//! object formatting, root discovery and relocation; the runtime supplies
//! type descriptors, stacks and finalizers.
//!
//! ## Overview
//!
//! - **Mostly-copying collection**: exactly referenced objects are evacuated,
//!   chunks referenced from ambiguous roots are pinned in place
//! - **Green-thread stacks**: every stack of an attached thread is scanned
//!   ambiguously, including suspended stacks and detour chains
//! - **Code blocks**: compiled code is a heap record carrying a reference
//!   table that is replayed into the instructions after every move
//! - **Thread-affine finalization**: a finalizer may defer to the thread that
//!   owns the resource and runs there on its next poll
//! - **Location watches**: address-hashed tables ask whether any of their
//!   keys may have moved since the last rehash
//!
//! Two backends implement the same `Backend` trait. `PoolBackend` places
//! objects by kind into dedicated pools; `GenerationalBackend` allocates
//! everything in the nursery and finalizes promptly. The `pool-backend` and
//! `generational-backend` features select which one `DefaultGc` names.
//!
//! ## Quick Start
//!
//! ```rust
//! use mgc::{DefaultGc, GcConfig, GcType, StackSet};
//! use std::sync::Arc;
//!
//! fn main() -> mgc::Result<()> {
//!     let gc = DefaultGc::new(GcConfig::default())?;
//!     let ctx = gc.attach_thread(Arc::new(StackSet::new()))?;
//!
//!     // A 16-byte record whose first word is a reference
//!     let pair = gc.alloc_type(GcType::object(16).with_offsets(&[0]))?;
//!     let roots = gc.root_slots(1)?;
//!     roots.set(0, gc.alloc(&ctx, pair)?);
//!
//!     gc.collect()?;
//!
//!     // The object may have moved; the root was updated
//!     assert_eq!(gc.type_of(roots.get(0)), Some(pair));
//!
//!     drop(roots);
//!     gc.detach_thread(ctx)
//! }
//! ```
//!
//! ## Safety
//!
//! Objects are plain addresses. The collector only sees references held in
//! roots, scanned stacks and traced fields of live objects:
//!
//! 1. **Root what you keep**: an address held anywhere else is not traced
//! 2. **Re-read after collecting**: exactly rooted objects move
//! 3. **One context per thread**: a `ThreadContext` is neither `Send` nor `Sync`
//!
//! ## Modules
//!
//! - [`allocator`]: Allocation points and pool selection
//! - [`backend`]: The two collector backends and their shared engine
//! - [`code`]: Code blocks, reference tables and their side tables
//! - [`config`]: Configuration parameters and validation
//! - [`error`]: Error types for all MGC operations
//! - [`gc`]: Allocation and metadata front-end
//! - [`heap`]: Chunked heap and generations
//! - [`logging`]: Structured collector events
//! - [`object`]: Headers, type descriptors and object formats
//! - [`relocate`]: Tracing, evacuation and sweeping
//! - [`roots`]: Registered root regions
//! - [`runtime`]: Threads, world lock and finalizer queues
//! - [`scan`]: Scanning protocol and stack scanning
//! - [`stats`]: Counters and memory summaries
//! - [`util`]: Utility functions and helpers
//! - [`watch`]: Location-dependency watches

// Core modules
pub mod gc;
pub mod config;
pub mod error;
pub mod logging;

// Memory management subsystems
pub mod allocator;
pub mod backend;
pub mod heap;
pub mod object;

// Collection
pub mod code;
pub mod relocate;
pub mod roots;
pub mod scan;

// Runtime and monitoring
pub mod runtime;
pub mod stats;
pub mod watch;

// Utilities
pub mod util;

// Re-export main types for convenience
pub use backend::{Backend, GenerationalBackend, PoolBackend};
pub use code::{CodeBlock, GcCodeRef, RefKind};
pub use config::GcConfig;
pub use error::{GcError, Result};
pub use gc::Gc;
pub use object::{Finalized, GcKind, GcType, TypeHandle};
pub use roots::{RootHandle, RootSlots};
pub use runtime::ThreadContext;
pub use scan::{FrozenRange, Scanner, Stack, StackSet};
pub use stats::MemorySummary;
pub use watch::{AddrWatch, EpochWatch, LocationWatch};

/// Backend selected by the enabled feature
#[cfg(feature = "generational-backend")]
pub type DefaultBackend = GenerationalBackend;

/// Backend selected by the enabled feature
#[cfg(not(feature = "generational-backend"))]
pub type DefaultBackend = PoolBackend;

/// Collector on the default backend
pub type DefaultGc = Gc<DefaultBackend>;

/// MGC version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
