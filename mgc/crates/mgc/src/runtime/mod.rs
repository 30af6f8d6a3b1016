//! Runtime Module - mutator integration
//!
//! Manages:
//! - The safepoint handshake and the world lock every collection stops
//! - Thread records and explicit thread contexts
//! - Finalizer queues and the cross-thread drain handoff

pub mod finalizer;
pub mod safepoint;
pub mod thread;

pub use finalizer::{DrainRequest, FinalizerQueue, MessageQueue, Pushed};
pub use safepoint::{SafeRegion, StoppedWorld, World};
pub use thread::{ThreadContext, ThreadRecord, ThreadRegistry};
