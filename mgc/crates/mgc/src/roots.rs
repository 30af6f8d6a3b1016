//! Root Set - externally registered starting points for tracing
//!
//! A root is a contiguous array of pointer-sized slots registered by a
//! client of the collector:
//!
//! - **Exact** roots hold valid base or interior pointers, or null. Their
//!   targets may move and the slots are rewritten.
//! - **Ambiguous** roots may hold arbitrary bits. Anything that looks like a
//!   heap reference pins its target in place and the slot is never written.
//!
//! Per-thread stacks are ambiguous roots as well but live with the thread
//! record (see `runtime::thread`), not here.

use crate::error::{GcError, Result};
use crate::scan::{self, Scanner};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Handle returned by `RootSet::create`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(u64);

impl RootHandle {
    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        RootHandle(raw)
    }
}

#[derive(Debug, Clone, Copy)]
struct RootEntry {
    base: usize,
    count: usize,
    ambiguous: bool,
}

/// Registered roots of one collector instance
#[derive(Debug, Default)]
pub struct RootSet {
    next: AtomicU64,
    entries: Mutex<IndexMap<u64, RootEntry>>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `count` slots starting at `base`
    ///
    /// Registering the same `(base, count)` twice is a usage error.
    ///
    /// # Safety
    /// The slots must stay valid, aligned and writable until the root is
    /// destroyed. For exact roots every slot must be null or point into the
    /// heap.
    pub unsafe fn create(&self, base: usize, count: usize, ambiguous: bool) -> Result<RootHandle> {
        if base % std::mem::align_of::<usize>() != 0 {
            return Err(GcError::Usage(format!("unaligned root {:#x}", base)));
        }

        let mut entries = self.entries.lock();
        if entries.values().any(|e| e.base == base && e.count == count) {
            return Err(GcError::Usage(format!(
                "root {:#x} ({} slots) registered twice",
                base, count
            )));
        }

        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        entries.insert(
            id,
            RootEntry {
                base,
                count,
                ambiguous,
            },
        );
        log::trace!("root {} at {:#x} ({} slots, ambiguous: {})", id, base, count, ambiguous);
        Ok(RootHandle(id))
    }

    /// Unregister a root
    pub fn destroy(&self, handle: RootHandle) -> Result<()> {
        match self.entries.lock().shift_remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(GcError::Usage(format!("unknown root handle {}", handle.0))),
        }
    }

    /// Number of registered roots
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scan every root of the given exactness
    ///
    /// Must only be called with the world stopped.
    pub fn scan<S: Scanner>(&self, s: &mut S, ambiguous: bool) -> std::result::Result<(), S::Error> {
        let entries = self.entries.lock();
        for entry in entries.values().filter(|e| e.ambiguous == ambiguous) {
            // SAFETY: the registration contract keeps the slots valid.
            unsafe {
                scan::range(
                    s,
                    entry.base,
                    entry.base + entry.count * std::mem::size_of::<usize>(),
                )?;
            }
        }
        Ok(())
    }
}

/// Owned array of exact root slots
///
/// Dropping it unregisters the root, so a `RootSlots` can never leave a
/// dangling registration behind.
pub struct RootSlots {
    slots: Box<[AtomicUsize]>,
    handle: RootHandle,
    set: Arc<RootSet>,
}

impl RootSlots {
    pub(crate) fn new(set: Arc<RootSet>, count: usize) -> Result<Self> {
        let slots: Box<[AtomicUsize]> = (0..count.max(1)).map(|_| AtomicUsize::new(0)).collect();
        // SAFETY: the box lives until `drop`, which unregisters it first.
        let handle = unsafe { set.create(slots.as_ptr() as usize, slots.len(), false)? };
        Ok(Self { slots, handle, set })
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current value of slot `index`
    ///
    /// Re-read after every allocation: a collection may have moved the
    /// target and rewritten the slot.
    #[inline]
    pub fn get(&self, index: usize) -> usize {
        self.slots[index].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, index: usize, value: usize) {
        self.slots[index].store(value, Ordering::Release);
    }

    pub fn handle(&self) -> RootHandle {
        self.handle
    }
}

impl Drop for RootSlots {
    fn drop(&mut self) {
        if let Err(e) = self.set.destroy(self.handle) {
            log::warn!("failed to unregister root slots: {}", e);
        }
    }
}

impl std::fmt::Debug for RootSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootSlots")
            .field("handle", &self.handle)
            .field("len", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<usize>);

    impl Scanner for Collect {
        type Error = ();

        fn fix1(&mut self, word: usize) -> bool {
            word != 0
        }

        fn fix2(&mut self, slot: &mut usize) -> std::result::Result<(), ()> {
            self.0.push(*slot);
            *slot = 0;
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_root_is_usage_error() {
        let set = RootSet::new();
        let data = [0usize; 4];
        let base = data.as_ptr() as usize;
        unsafe {
            let handle = set.create(base, 4, false).unwrap();
            assert!(matches!(set.create(base, 4, true), Err(GcError::Usage(_))));
            // Same address, different extent is a distinct root
            assert!(set.create(base, 2, false).is_ok());
            set.destroy(handle).unwrap();
        }
        assert!(matches!(set.destroy(RootHandle(999)), Err(GcError::Usage(_))));
    }

    #[test]
    fn test_scan_by_exactness() {
        let set = RootSet::new();
        let mut exact = [1usize, 0, 2];
        let mut ambiguous = [3usize];
        unsafe {
            set.create(exact.as_mut_ptr() as usize, 3, false).unwrap();
            set.create(ambiguous.as_mut_ptr() as usize, 1, true).unwrap();
        }

        let mut s = Collect(Vec::new());
        set.scan(&mut s, true).unwrap();
        assert_eq!(s.0, vec![3]);

        let mut s = Collect(Vec::new());
        set.scan(&mut s, false).unwrap();
        assert_eq!(s.0, vec![1, 2]);
        assert_eq!(exact, [0, 0, 0]);
    }

    #[test]
    fn test_root_slots_unregister_on_drop() {
        let set = Arc::new(RootSet::new());
        {
            let slots = RootSlots::new(set.clone(), 2).unwrap();
            slots.set(1, 42);
            assert_eq!(slots.get(1), 42);
            assert_eq!(set.len(), 1);
        }
        assert!(set.is_empty());
    }
}
