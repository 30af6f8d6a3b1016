//! Allocation Point - thread-local bump buffer
//!
//! An allocation point owns `[cur, limit)` of some chunk. Allocation bumps
//! `cur`; when the buffer runs dry the owner asks the heap for a new one.
//!
//! The part of the buffer not handed out yet is unformatted memory. Before
//! anything walks the heap (a collection, a type sweep, `walk_objects`) the
//! tail has to be turned into a pad record, which is what `flush` does.

use super::PoolKind;
use crate::object::header::write_pad;

/// Bump allocation buffer of one pool and generation
#[derive(Debug)]
pub struct AllocPoint {
    pool: PoolKind,
    gen: usize,
    cur: usize,
    limit: usize,
}

impl AllocPoint {
    /// Create an empty allocation point
    pub const fn new(pool: PoolKind, gen: usize) -> Self {
        Self {
            pool,
            gen,
            cur: 0,
            limit: 0,
        }
    }

    pub fn pool(&self) -> PoolKind {
        self.pool
    }

    /// Generation new buffers are taken from
    pub fn gen(&self) -> usize {
        self.gen
    }

    /// Take `size` bytes from the buffer
    #[inline]
    pub fn try_bump(&mut self, size: usize) -> Option<usize> {
        if self.limit - self.cur < size {
            return None;
        }
        let at = self.cur;
        self.cur += size;
        Some(at)
    }

    /// Bytes left in the buffer
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.cur
    }

    /// Install a new buffer, padding the old tail
    pub(crate) fn refill(&mut self, start: usize, limit: usize) {
        self.flush();
        self.cur = start;
        self.limit = limit;
    }

    /// Pad the unused tail and drop the buffer
    pub fn flush(&mut self) {
        if self.cur < self.limit {
            // SAFETY: the tail belongs to this allocation point and lies in a
            // chunk that stays mapped until the next collection.
            unsafe { write_pad(self.cur, self.limit - self.cur) };
        }
        self.cur = 0;
        self.limit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::header::{record_kind, record_size, RecordKind};

    #[test]
    fn test_bump_and_flush() {
        let mut mem = vec![0usize; 16];
        let start = mem.as_mut_ptr() as usize;
        let mut ap = AllocPoint::new(PoolKind::Main, 0);
        assert_eq!(ap.try_bump(8), None);

        ap.refill(start, start + 128);
        assert_eq!(ap.try_bump(48), Some(start));
        assert_eq!(ap.try_bump(48), Some(start + 48));
        assert_eq!(ap.try_bump(48), None);
        assert_eq!(ap.remaining(), 32);

        ap.flush();
        unsafe {
            assert_eq!(record_kind(start + 96), RecordKind::Pad);
            assert_eq!(record_size(start + 96), 32);
        }
        assert_eq!(ap.remaining(), 0);
    }
}
