//! Safepoint Management
//!
//! A safepoint is a point where an attached thread can be paused for a
//! collection. Attached threads count as running until they arrive at a
//! safepoint (`ThreadContext::poll`, every allocation) or step out into a
//! safe region around foreign or blocking code. A collection requests a
//! safepoint, waits until no attached thread is running, then takes the
//! world lock exclusively.
//!
//! ```text
//! mutator A ──run──poll─┐(parked)┌─run──────────────────
//! mutator B ──run──[safe region: blocking read ......]──
//! collector ──request──wait──stop──[trace]──release─────
//! ```
//!
//! The world lock also guards short heap operations from threads that are
//! not attached (root registration, finalizer queue pops). It is not
//! reentrant: code holding a `WorldGuard` must never call back into the
//! collector.
//!
//! ## Safepoint States
//!
//! ```text
//! SAFEPOINT_NONE ──request──▶ SAFEPOINT_REQUESTED ──all arrived──▶ SAFEPOINT_REACHED
//!       ▲                                                               │
//!       └────────────────────────────release────────────────────────────┘
//! ```

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

/// Safepoint state constants
pub const SAFEPOINT_NONE: u8 = 0;
pub const SAFEPOINT_REQUESTED: u8 = 1;
pub const SAFEPOINT_REACHED: u8 = 2;

/// Shared access to the heap for short operations
pub type WorldGuard<'a> = RwLockReadGuard<'a, ()>;

#[derive(Debug, Default)]
struct Threads {
    /// Attached threads that are neither parked nor in a safe region
    running: usize,
    /// A safepoint is requested or reached
    requested: bool,
}

/// World lock plus the attached-thread handshake
pub struct World {
    lock: RwLock<()>,
    threads: Mutex<Threads>,
    changed: Condvar,
    state: AtomicU8,
    stops: AtomicU64,
}

impl World {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            threads: Mutex::new(Threads::default()),
            changed: Condvar::new(),
            state: AtomicU8::new(SAFEPOINT_NONE),
            stops: AtomicU64::new(0),
        }
    }

    /// Enter the world for a short heap operation
    #[inline]
    pub fn enter(&self) -> WorldGuard<'_> {
        self.lock.read()
    }

    /// Count the calling thread as running, waiting out any safepoint
    pub fn attach(&self) {
        let mut threads = self.threads.lock();
        while threads.requested {
            self.changed.wait(&mut threads);
        }
        threads.running += 1;
    }

    /// Stop counting the calling thread
    pub fn detach(&self) {
        let mut threads = self.threads.lock();
        threads.running = threads.running.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Check if a safepoint has been requested
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) != SAFEPOINT_NONE
    }

    /// Park the calling running thread if a safepoint is requested
    ///
    /// Returns true if the thread was parked.
    #[inline]
    pub fn arrive(&self) -> bool {
        if !self.is_requested() {
            return false;
        }
        self.block_until_released();
        true
    }

    fn block_until_released(&self) {
        let mut threads = self.threads.lock();
        threads.running = threads.running.saturating_sub(1);
        self.changed.notify_all();
        while threads.requested {
            self.changed.wait(&mut threads);
        }
        threads.running += 1;
    }

    /// Leave the set of running threads until the region is dropped
    ///
    /// The thread must not touch managed objects inside the region; its
    /// stacks are scanned from the extent it published last.
    pub fn safe_region<'a>(&'a self, flag: &'a AtomicBool) -> SafeRegion<'a> {
        self.leave(flag);
        SafeRegion { world: self, flag }
    }

    /// Stop counting the calling thread as running; `flag` marks it
    ///
    /// Does nothing if `flag` is already set.
    pub fn leave(&self, flag: &AtomicBool) {
        if flag.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.threads.lock();
        threads.running = threads.running.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Count the thread as running again, waiting out any safepoint
    ///
    /// Does nothing if `flag` is not set.
    pub fn rejoin(&self, flag: &AtomicBool) {
        if !flag.load(Ordering::Acquire) {
            return;
        }
        let mut threads = self.threads.lock();
        while threads.requested {
            self.changed.wait(&mut threads);
        }
        threads.running += 1;
        flag.store(false, Ordering::Release);
    }

    /// Stop every attached thread and every short heap operation
    ///
    /// `caller_running` says whether the calling thread is itself an
    /// attached, running thread; it is treated as parked until the world is
    /// released.
    pub fn stop(&self, caller_running: bool) -> StoppedWorld<'_> {
        let mut threads = self.threads.lock();
        if caller_running {
            threads.running = threads.running.saturating_sub(1);
            self.changed.notify_all();
        }
        while threads.requested {
            self.changed.wait(&mut threads);
        }
        threads.requested = true;
        self.state.store(SAFEPOINT_REQUESTED, Ordering::SeqCst);
        while threads.running > 0 {
            self.changed.wait(&mut threads);
        }
        drop(threads);

        let guard = self.lock.write();
        self.state.store(SAFEPOINT_REACHED, Ordering::Release);
        self.stops.fetch_add(1, Ordering::Relaxed);
        StoppedWorld {
            world: self,
            guard: Some(guard),
            caller_running,
        }
    }

    /// Check if the world is currently stopped
    ///
    /// False while a collection is still waiting for threads to arrive.
    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == SAFEPOINT_REACHED
    }

    /// Attached threads currently counted as running
    pub fn running_threads(&self) -> usize {
        self.threads.lock().running
    }

    /// Number of times the world was stopped
    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    fn release(&self, caller_running: bool) {
        let mut threads = self.threads.lock();
        threads.requested = false;
        self.state.store(SAFEPOINT_NONE, Ordering::Release);
        if caller_running {
            threads.running += 1;
        }
        self.changed.notify_all();
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the heap, held by a collection
pub struct StoppedWorld<'a> {
    world: &'a World,
    guard: Option<RwLockWriteGuard<'a, ()>>,
    caller_running: bool,
}

impl Drop for StoppedWorld<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.world.release(self.caller_running);
    }
}

/// Stretch of foreign or blocking code on an attached thread
pub struct SafeRegion<'a> {
    world: &'a World,
    flag: &'a AtomicBool,
}

impl Drop for SafeRegion<'_> {
    fn drop(&mut self) {
        self.world.rejoin(self.flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_stop_waits_for_mutators() {
        let world = Arc::new(World::new());
        let entered = world.enter();

        let collector = {
            let world = world.clone();
            std::thread::spawn(move || {
                let _stopped = world.stop(false);
                world.stop_count()
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!world.is_stopped());
        drop(entered);

        assert_eq!(collector.join().unwrap(), 1);
        assert!(!world.is_stopped());
    }

    #[test]
    fn test_stop_waits_for_running_threads() {
        let world = Arc::new(World::new());
        let progress = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let (attached_tx, attached_rx) = crossbeam::channel::bounded(1);
        let mutator = {
            let (world, progress, done) = (world.clone(), progress.clone(), done.clone());
            std::thread::spawn(move || {
                world.attach();
                attached_tx.send(()).unwrap();
                while !done.load(Ordering::Acquire) {
                    progress.fetch_add(1, Ordering::Relaxed);
                    world.arrive();
                }
                world.detach();
            })
        };
        attached_rx.recv().unwrap();

        {
            let _stopped = world.stop(false);
            assert!(world.is_stopped());
            assert_eq!(world.running_threads(), 0);
            let before = progress.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(progress.load(Ordering::Relaxed), before, "mutator ran while stopped");
        }

        done.store(true, Ordering::Release);
        mutator.join().unwrap();
        assert_eq!(world.running_threads(), 0);
    }

    #[test]
    fn test_safe_region_does_not_block_stop() {
        let world = World::new();
        let flag = AtomicBool::new(false);
        world.attach();
        {
            let _region = world.safe_region(&flag);
            assert!(flag.load(Ordering::Acquire));
            assert_eq!(world.running_threads(), 0);
            drop(world.stop(false));
        }
        assert!(!flag.load(Ordering::Acquire));
        assert_eq!(world.running_threads(), 1);

        // The caller of `stop` counts as parked
        drop(world.stop(true));
        assert_eq!(world.running_threads(), 1);
        world.detach();
    }
}
