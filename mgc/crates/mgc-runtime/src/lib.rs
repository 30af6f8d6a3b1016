//! MGC Runtime Library
//!
//! C entry points for generated code and the language runtime:
//! - collector lifecycle and thread attachment
//! - allocation of objects, arrays, code blocks and type descriptors
//! - green-thread stacks, roots, location watches and diagnostics

mod gc;

pub use gc::*;
