//! Object Module - heap record format and type metadata
//!
//! This module defines how MGC lays out the records it manages.

pub mod format;
pub mod header;
pub mod types;

pub use format::{size_array, size_code, size_obj, ARRAY_HEADER_SIZE, ARRAY_PREFIX};
pub use header::{base_of, client_of, header_at, ObjectHeader, RecordKind, HEADER_SIZE};
pub use types::{Finalized, FinalizerFn, GcKind, GcType, TypeHandle, TypePool, TypeTable};
