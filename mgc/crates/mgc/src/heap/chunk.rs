//! Chunk - one anonymous mapping of heap memory
//!
//! A chunk belongs to one pool and one generation. Records are formatted
//! contiguously from `base` up to `top`; the space between `top` and `limit`
//! is unformatted and never walked.
//!
//! During a collection a chunk is in one of the non-`Normal` states:
//!
//! - `Condemned`: its objects are evacuated unless an ambiguous reference
//!   hits the chunk first
//! - `Nailed`: condemned, but pinned by an ambiguous reference; survivors
//!   are marked in place
//! - `Sweep`: non-moving chunk of a full collection, marked and swept
//! - `ToSpace`: receives evacuated objects

use crate::error::{GcError, Result};
use crate::object::header::record_size;
use memmap2::{MmapMut, MmapOptions};
use serde::Serialize;

/// Pool a chunk allocates for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Moving pool of regular objects and arrays
    Main,
    /// Moving pool of weak arrays
    Weak,
    /// Moving pool of code blocks
    Code,
    /// Non-moving pool for type objects, error objects and foreign-visible data
    Static,
}

impl PoolKind {
    pub const ALL: [PoolKind; 4] = [PoolKind::Main, PoolKind::Weak, PoolKind::Code, PoolKind::Static];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            PoolKind::Main => 0,
            PoolKind::Weak => 1,
            PoolKind::Code => 2,
            PoolKind::Static => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PoolKind::Main => "main",
            PoolKind::Weak => "weak",
            PoolKind::Code => "code",
            PoolKind::Static => "static",
        }
    }

    #[inline]
    pub fn is_moving(self) -> bool {
        self != PoolKind::Static
    }
}

/// Collection state of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Normal,
    Condemned,
    Nailed,
    Sweep,
    ToSpace,
}

/// One mapping of heap memory
pub struct Chunk {
    _map: MmapMut,
    pub base: usize,
    pub limit: usize,
    pub top: usize,
    pub gen: usize,
    pub pool: PoolKind,
    /// Holds a single object too large to be copied
    pub large: bool,
    pub state: ChunkState,
    starts: Option<Vec<usize>>,
}

impl Chunk {
    /// Map a chunk of at least `size` bytes, rounded up to whole pages
    pub fn map(size: usize, pool: PoolKind, gen: usize, large: bool) -> Result<Self> {
        let page = page_size::get();
        let len = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or_else(|| GcError::VirtualMemory(format!("chunk of {} bytes", size)))?;

        let map = MmapOptions::new().len(len).map_anon().map_err(|e| {
            GcError::VirtualMemory(format!("Failed to map {} byte chunk: {}", len, e))
        })?;

        let base = map.as_ptr() as usize;
        Ok(Self {
            _map: map,
            base,
            limit: base + len,
            top: base,
            gen,
            pool,
            large,
            state: ChunkState::Normal,
            starts: None,
        })
    }

    /// Bytes of the mapping
    #[inline]
    pub fn mapped(&self) -> usize {
        self.limit - self.base
    }

    /// Bytes formatted or handed out to allocation points
    #[inline]
    pub fn used(&self) -> usize {
        self.top - self.base
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.limit - self.top
    }

    /// Whether `addr` lies in the formatted part
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.top
    }

    /// Carve `size` bytes off the unformatted tail
    #[inline]
    pub fn bump(&mut self, size: usize) -> Option<usize> {
        if self.free() < size {
            return None;
        }
        let at = self.top;
        self.top += size;
        self.starts = None;
        Some(at)
    }

    /// Start of the record containing `addr`
    ///
    /// Builds a record start index on first use; the index stays valid
    /// until the chunk is bumped or `forget_index` is called.
    ///
    /// # Safety
    /// `[base, top)` must be fully formatted.
    pub unsafe fn record_containing(&mut self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        if self.large {
            return Some(self.base);
        }

        if self.starts.is_none() {
            let mut starts = Vec::new();
            let mut at = self.base;
            while at < self.top {
                starts.push(at);
                at += record_size(at);
            }
            self.starts = Some(starts);
        }
        let starts = self.starts.as_deref()?;

        let index = match starts.binary_search(&addr) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };
        Some(starts[index])
    }

    /// Drop the record start index
    pub fn forget_index(&mut self) {
        self.starts = None;
    }

    /// Record starts of the formatted part
    ///
    /// # Safety
    /// `[base, top)` must be fully formatted.
    pub unsafe fn records(&self) -> Records {
        Records {
            at: self.base,
            top: self.top,
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("base", &format_args!("{:#x}", self.base))
            .field("top", &format_args!("{:#x}", self.top))
            .field("limit", &format_args!("{:#x}", self.limit))
            .field("gen", &self.gen)
            .field("pool", &self.pool)
            .field("large", &self.large)
            .field("state", &self.state)
            .finish()
    }
}

/// Iterator over record starts of a chunk
pub struct Records {
    at: usize,
    top: usize,
}

impl Iterator for Records {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.at >= self.top {
            return None;
        }
        let at = self.at;
        // SAFETY: the constructor requires a formatted range.
        self.at += unsafe { record_size(at) };
        Some(at)
    }
}
