//! Finalizer queues
//!
//! Two queues carry objects waiting for their finalizer:
//!
//! - `MessageQueue`: objects a collection found unreachable. Scanned as an
//!   exact root, so its entries move with their objects until
//!   `check_finalizers` takes them out.
//! - `FinalizerQueue`: one per thread, holding objects whose finalizer
//!   asked to run on that thread. Scanned as an ambiguous root, so its
//!   entries are pinned.
//!
//! Thread queues are bounded; a push onto a full queue is refused.
//!
//! Handing an object to another thread is a push plus, if nobody is
//! draining the queue yet, one `DrainRequest` over that thread's channel.
//! The drain flag belongs to the queue: whoever flips it from false to true
//! owns the request.

use crate::scan::{self, Scanner};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

/// Request for a thread to drain its finalizer queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainRequest {
    /// Thread that queued the work
    pub from: ThreadId,
}

/// Outcome of `FinalizerQueue::push`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// Queued, and the caller claimed the drain: it must send a `DrainRequest`
    Claimed,
    /// Queued behind a drain someone else owns
    Queued,
    /// Refused, the queue is at capacity
    Full,
}

/// Per-thread bounded FIFO of objects to finalize
#[derive(Debug)]
pub struct FinalizerQueue {
    items: Mutex<VecDeque<usize>>,
    capacity: usize,
    draining: AtomicBool,
}

impl FinalizerQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            draining: AtomicBool::new(false),
        }
    }

    /// Queue `object` unless the queue is full
    pub fn push(&self, object: usize) -> Pushed {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Pushed::Full;
            }
            items.push_back(object);
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            Pushed::Queued
        } else {
            Pushed::Claimed
        }
    }

    pub fn pop(&self) -> Option<usize> {
        self.items.lock().pop_front()
    }

    /// Release the drain claim after the queue was emptied
    ///
    /// Returns true if items arrived meanwhile and the claim was taken
    /// again, in which case the caller keeps draining.
    pub fn finish_drain(&self) -> bool {
        self.draining.store(false, Ordering::Release);
        if self.items.lock().is_empty() {
            return false;
        }
        !self.draining.swap(true, Ordering::AcqRel)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Scan the queued objects
    ///
    /// Queued words are never rewritten, so only pinning scanners may walk
    /// this queue.
    pub fn scan<S: Scanner>(&self, s: &mut S) -> Result<(), S::Error> {
        let mut words: Vec<usize> = self.items.lock().iter().copied().collect();
        scan::array(s, &mut words)
    }
}

/// Collector-to-mutator stream of newly unreachable objects
#[derive(Debug, Default)]
pub struct MessageQueue {
    items: Mutex<VecDeque<usize>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post the objects a collection found unreachable
    pub fn post(&self, objects: &[usize]) {
        self.items.lock().extend(objects.iter().copied());
    }

    pub fn pop(&self) -> Option<usize> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Scan and update the posted objects
    pub fn scan<S: Scanner>(&self, s: &mut S) -> Result<(), S::Error> {
        let mut items = self.items.lock();
        scan::array(s, items.make_contiguous())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Shift;

    impl Scanner for Shift {
        type Error = ();

        fn fix1(&mut self, word: usize) -> bool {
            word != 0
        }

        fn fix2(&mut self, slot: &mut usize) -> Result<(), ()> {
            *slot += 0x100;
            Ok(())
        }
    }

    #[test]
    fn test_first_push_claims_drain() {
        let queue = FinalizerQueue::new(8);
        assert_eq!(queue.push(0x10), Pushed::Claimed);
        assert_eq!(queue.push(0x20), Pushed::Queued);
        assert_eq!(queue.pop(), Some(0x10));
        assert_eq!(queue.pop(), Some(0x20));
        assert!(!queue.finish_drain());
        assert!(!queue.is_draining());
        assert_eq!(queue.push(0x30), Pushed::Claimed);
    }

    #[test]
    fn test_finish_drain_reclaims_late_items() {
        let queue = FinalizerQueue::new(8);
        assert_eq!(queue.push(0x10), Pushed::Claimed);
        assert_eq!(queue.pop(), Some(0x10));
        // Arrives while the drain is still claimed
        assert_eq!(queue.push(0x20), Pushed::Queued);
        assert!(queue.finish_drain());
        assert!(queue.is_draining());
    }

    #[test]
    fn test_full_queue_refuses() {
        let queue = FinalizerQueue::new(2);
        assert_eq!(queue.push(0x10), Pushed::Claimed);
        assert_eq!(queue.push(0x20), Pushed::Queued);
        assert_eq!(queue.push(0x30), Pushed::Full);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(0x10));
        assert_eq!(queue.push(0x30), Pushed::Queued);
        assert_eq!(queue.pop(), Some(0x20));
        assert_eq!(queue.pop(), Some(0x30));
    }

    #[test]
    fn test_pinning_scan_leaves_queue_alone() {
        let queue = FinalizerQueue::new(8);
        queue.push(0x10);
        queue.scan(&mut Shift).unwrap();
        assert_eq!(queue.pop(), Some(0x10));
    }

    #[test]
    fn test_message_scan_rewrites() {
        let messages = MessageQueue::new();
        messages.post(&[0x10, 0x20]);
        messages.scan(&mut Shift).unwrap();
        assert_eq!(messages.pop(), Some(0x110));
        assert_eq!(messages.pop(), Some(0x120));
        assert!(messages.is_empty());
    }
}
