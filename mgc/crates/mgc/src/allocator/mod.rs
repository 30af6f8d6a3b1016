//! Allocator Module - allocation points and reservation outcomes
//!
//! Allocation is two-level:
//!
//! 1. **Fast path**: bump the calling thread's allocation point
//! 2. **Slow path**: ask the heap for a new buffer, which may require a
//!    collection first
//!
//! Large objects (more than a quarter chunk) bypass allocation points and
//! get a dedicated chunk.

pub mod tlab;

pub use crate::heap::PoolKind;
pub use tlab::AllocPoint;

/// Pool an allocation entry point reserves from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocPool {
    /// Objects and arrays
    Main,
    /// Weak arrays
    Weak,
    /// Code blocks
    Code,
    /// Hash table arrays reallocated by a rehash
    Hash,
}

/// Outcome of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Memory reserved at this record start
    Ready(usize),
    /// Generation over its threshold; collect it and retry
    Collect(usize),
    /// Heap limit reached
    Exhausted,
}

/// Private allocation points of one thread
#[derive(Debug)]
pub struct ApSet {
    pub main: AllocPoint,
    pub code: AllocPoint,
}

impl ApSet {
    pub fn new(main_gen: usize, code_gen: usize) -> Self {
        Self {
            main: AllocPoint::new(PoolKind::Main, main_gen),
            code: AllocPoint::new(PoolKind::Code, code_gen),
        }
    }

    /// Allocation point serving `pool`, if it is thread-private
    pub fn get_mut(&mut self, pool: AllocPool) -> Option<&mut AllocPoint> {
        match pool {
            AllocPool::Main => Some(&mut self.main),
            AllocPool::Code => Some(&mut self.code),
            AllocPool::Weak | AllocPool::Hash => None,
        }
    }

    pub fn flush(&mut self) {
        self.main.flush();
        self.code.flush();
    }
}
