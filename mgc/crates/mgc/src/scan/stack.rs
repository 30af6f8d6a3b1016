//! Stack Scanning - green-thread stacks of one OS thread
//!
//! Every OS thread attached to the collector owns a `StackSet`: the stacks of
//! all green threads scheduled on it. At most one of them is running. Its
//! saved stack pointer (`desc`) is zero and its live extent is published by
//! the scheduler as the thread's current stack pointer. Every other stack is
//! suspended and its live part is `[desc, high)`.
//!
//! ## Detours
//!
//! A green thread may temporarily run on another OS thread (a detour). It
//! stays in the set of the thread it belongs to, but the stack taking part
//! in the switch is flagged `detour_active` and the stack it runs on is
//! reachable through `detour_to`. Flagged stacks are skipped; the detour
//! chain is followed from the owner instead, so every stack is scanned
//! exactly once.
//!
//! ## Mid-switch
//!
//! If no running stack is found the thread was paused in the few
//! instructions of a context switch. All of its stacks have then been
//! scanned as suspended ones and the scan is complete.
//!
//! Stacks grow towards lower addresses.

use super::{range, Scanner};
use crate::util::constants::WORD;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A range of words that nobody mutates while it is scanned
///
/// Constructing one is the single place where the frozen-stack assertion is
/// made; scanning it afterwards is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrozenRange {
    low: usize,
    high: usize,
}

impl FrozenRange {
    /// Assert that `[low, high)` is frozen
    ///
    /// # Safety
    /// The range must be mapped, readable and writable, and no thread may
    /// write to it until the last scan of the returned value finished.
    pub unsafe fn new(low: usize, high: usize) -> Self {
        let low = low & !(WORD - 1);
        let high = high & !(WORD - 1);
        Self {
            low,
            high: high.max(low),
        }
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }

    /// Size of the range in bytes
    pub fn len(&self) -> usize {
        self.high - self.low
    }

    pub fn is_empty(&self) -> bool {
        self.low == self.high
    }

    /// Scan every word of the range
    pub fn scan<S: Scanner>(&self, s: &mut S) -> Result<(), S::Error> {
        // SAFETY: guaranteed by the constructor.
        unsafe { range(s, self.low, self.high) }
    }
}

/// Stack of one green thread
pub struct Stack {
    low: usize,
    high: usize,
    desc: AtomicUsize,
    detour_active: AtomicBool,
    detour_to: Mutex<Option<Arc<Stack>>>,
}

impl Stack {
    /// Describe a stack occupying `[low, high)`
    ///
    /// The stack starts out running.
    ///
    /// # Safety
    /// The memory must stay mapped while the stack is in a `StackSet`, and
    /// whoever suspends it (`suspend`) must not touch the saved part until
    /// it is resumed.
    pub unsafe fn new(low: usize, high: usize) -> Self {
        Self {
            low,
            high,
            desc: AtomicUsize::new(0),
            detour_active: AtomicBool::new(false),
            detour_to: Mutex::new(None),
        }
    }

    /// Describe a stack the collector did not allocate, such as the OS
    /// thread's own stack, whose low end is unknown
    ///
    /// # Safety
    /// As `new`.
    pub unsafe fn unallocated(high: usize) -> Self {
        Self::new(high, high)
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }

    /// Whether the collector knows the full extent of this stack
    pub fn is_allocated(&self) -> bool {
        self.low != self.high
    }

    /// Saved stack pointer, 0 while the stack is running
    pub fn saved_sp(&self) -> usize {
        self.desc.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.saved_sp() == 0
    }

    /// Switch away from this stack, leaving its live part at `[sp, high)`
    pub fn suspend(&self, sp: usize) {
        debug_assert!(sp != 0);
        self.desc.store(sp, Ordering::Release);
    }

    /// Switch to this stack
    pub fn resume(&self) {
        self.desc.store(0, Ordering::Release);
    }

    /// Flag the stack as taking part in a detour to another OS thread
    pub fn set_detour_active(&self, active: bool) {
        self.detour_active.store(active, Ordering::Release);
    }

    pub fn detour_active(&self) -> bool {
        self.detour_active.load(Ordering::Acquire)
    }

    /// Link the stack a detour is running on
    pub fn set_detour(&self, to: Option<Arc<Stack>>) {
        *self.detour_to.lock() = to;
    }

    pub fn detour(&self) -> Option<Arc<Stack>> {
        self.detour_to.lock().clone()
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("low", &format_args!("{:#x}", self.low))
            .field("high", &format_args!("{:#x}", self.high))
            .field("saved_sp", &format_args!("{:#x}", self.saved_sp()))
            .field("detour_active", &self.detour_active())
            .finish()
    }
}

/// All green-thread stacks tied to one OS thread
#[derive(Debug, Default)]
pub struct StackSet {
    stacks: Mutex<Vec<Arc<Stack>>>,
}

impl StackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stack: Arc<Stack>) {
        self.stacks.lock().push(stack);
    }

    /// Remove a stack, returns false if it was not in the set
    pub fn remove(&self, stack: &Arc<Stack>) -> bool {
        let mut stacks = self.stacks.lock();
        match stacks.iter().position(|s| Arc::ptr_eq(s, stack)) {
            Some(index) => {
                stacks.swap_remove(index);
                true
            },
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<Stack>> {
        self.stacks.lock().clone()
    }
}

/// Scan every green-thread stack of one OS thread
///
/// `current` is the published stack pointer of the OS thread, the low end of
/// the running stack's live part; 0 if the thread published none. Returns
/// the number of bytes scanned.
///
/// Must only be called while the owning thread is stopped at a safepoint.
pub fn stacks<S: Scanner>(s: &mut S, set: &StackSet, current: usize) -> Result<usize, S::Error> {
    let mut scanned = 0;
    let mut running: Option<usize> = None;
    let mut found_running = false;

    for first in set.snapshot() {
        if first.detour_active() {
            continue;
        }

        let mut next = Some(first);
        while let Some(stack) = next {
            next = stack.detour();

            let sp = stack.saved_sp();
            if sp == 0 {
                if found_running {
                    log::error!("two running stacks on one thread, ignoring {:?}", stack);
                    continue;
                }
                found_running = true;
                running = Some(stack.high());

                // A stack being torn down after an unwind through a stack
                // switch no longer contains `current`.
                if stack.is_allocated() && (current <= stack.low() || current > stack.high()) {
                    running = None;
                }
                continue;
            }

            // SAFETY: a suspended stack is frozen until it is resumed, which
            // the scheduler cannot do while we hold the safepoint.
            let frozen = unsafe { FrozenRange::new(sp, stack.high()) };
            scanned += frozen.len();
            frozen.scan(s)?;
        }
    }

    match running {
        Some(high) if current == 0 => {
            log::warn!("running stack below {:#x} has no published extent, not scanned", high);
        },
        Some(high) if current < high => {
            // SAFETY: the owning thread is stopped at a safepoint, so its
            // live stack part is frozen.
            let frozen = unsafe { FrozenRange::new(current, high) };
            scanned += frozen.len();
            frozen.scan(s)?;
        },
        Some(high) => {
            log::warn!("extent {:#x} is outside the running stack below {:#x}, not scanned", current, high);
        },
        None if !found_running => {
            log::trace!("thread paused mid-switch, all stacks scanned as suspended");
        },
        None => {},
    }

    Ok(scanned)
}
