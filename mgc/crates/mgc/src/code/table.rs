//! Code side tables
//!
//! Two tables outlive individual patches of a code block and are keyed by
//! handles stored in the block's reference table:
//!
//! - `CodeTable` maps instruction addresses back to the owning code block.
//!   The exception subsystem uses it to find the block for a faulting PC.
//! - `UnwindTable` holds unwind records whose `pc_begin` must follow the
//!   block when it moves.
//!
//! Handle 0 is never issued so a nulled reference entry reads as "none".

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
struct CodeEntry {
    start: usize,
    size: usize,
}

#[derive(Default)]
struct CodeTableInner {
    next: usize,
    by_id: FxHashMap<usize, CodeEntry>,
    by_start: BTreeMap<usize, usize>,
}

/// Identity table: instruction address range -> code block
#[derive(Default)]
pub struct CodeTable {
    inner: RwLock<CodeTableInner>,
}

impl CodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block of `size` instruction bytes at `start`
    pub fn insert(&self, start: usize, size: usize) -> usize {
        let mut inner = self.inner.write();
        inner.next += 1;
        let id = inner.next;
        inner.by_id.insert(id, CodeEntry { start, size });
        inner.by_start.insert(start, id);
        id
    }

    /// Follow a block that moved to `start`
    pub fn update(&self, id: usize, start: usize) -> bool {
        let mut inner = self.inner.write();
        let old = match inner.by_id.get_mut(&id) {
            Some(entry) if entry.start == start => return true,
            Some(entry) => std::mem::replace(&mut entry.start, start),
            None => return false,
        };
        if inner.by_start.get(&old) == Some(&id) {
            inner.by_start.remove(&old);
        }
        inner.by_start.insert(start, id);
        true
    }

    /// Drop an entry
    pub fn remove(&self, id: usize) -> bool {
        let mut inner = self.inner.write();
        match inner.by_id.remove(&id) {
            Some(entry) => {
                if inner.by_start.get(&entry.start) == Some(&id) {
                    inner.by_start.remove(&entry.start);
                }
                true
            },
            None => false,
        }
    }

    /// Start of the block containing `pc`
    pub fn find(&self, pc: usize) -> Option<usize> {
        let inner = self.inner.read();
        let (&start, id) = inner.by_start.range(..=pc).next_back()?;
        let entry = inner.by_id.get(id)?;
        (pc < start + entry.size).then_some(start)
    }

    /// Start address registered for `id`
    pub fn start_of(&self, id: usize) -> Option<usize> {
        self.inner.read().by_id.get(&id).map(|entry| entry.start)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unwind information for one code block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindRecord {
    /// First instruction covered by the record
    pub pc_begin: usize,
    /// Number of instruction bytes covered
    pub pc_range: usize,
    /// Encoded unwind instructions, opaque to the collector
    pub data: Vec<u8>,
}

#[derive(Default)]
struct UnwindInner {
    next: usize,
    records: FxHashMap<usize, UnwindRecord>,
}

/// Unwind record table
#[derive(Default)]
pub struct UnwindTable {
    inner: RwLock<UnwindInner>,
}

impl UnwindTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record and return its handle
    pub fn insert(&self, record: UnwindRecord) -> usize {
        let mut inner = self.inner.write();
        inner.next += 1;
        let id = inner.next;
        inner.records.insert(id, record);
        id
    }

    /// Point the record at a block that moved to `code`
    pub fn update_fn(&self, id: usize, code: usize) -> bool {
        match self.inner.write().records.get_mut(&id) {
            Some(record) => {
                record.pc_begin = code;
                true
            },
            None => false,
        }
    }

    /// Release a record
    pub fn free(&self, id: usize) -> bool {
        self.inner.write().records.remove(&id).is_some()
    }

    pub fn get(&self, id: usize) -> Option<UnwindRecord> {
        self.inner.read().records.get(&id).cloned()
    }

    /// Record covering `pc`
    pub fn find(&self, pc: usize) -> Option<UnwindRecord> {
        self.inner
            .read()
            .records
            .values()
            .find(|r| r.pc_begin <= pc && pc < r.pc_begin + r.pc_range)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Both side tables of one collector instance
#[derive(Default)]
pub struct CodeTables {
    pub code: CodeTable,
    pub unwind: UnwindTable,
}

impl CodeTables {
    pub fn new() -> Self {
        Self::default()
    }
}
