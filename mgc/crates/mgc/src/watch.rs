//! Location-dependency watches
//!
//! A client that hashes objects by address registers those addresses with
//! a watch and later asks whether any of them may have moved. Both
//! implementations are conservative: a relocation is always reported, a
//! report does not prove one happened.
//!
//! Every collection appends the address ranges it evacuated or freed to the
//! collector's `MoveLog`. The two watch flavours read that log at different
//! resolutions:
//!
//! - `EpochWatch` keeps a 64-bit set of 1MB address zones (modulo 64) and
//!   compares it with the zone masks of the collections since its epoch.
//!   Only the last four masks are kept separately, older ones are folded
//!   into one.
//! - `AddrWatch` keeps the bounding interval of its addresses and compares
//!   it with the ranges of the last sixteen collections. A watch older than
//!   that history always answers true.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Number of collections whose zone masks are kept apart
const ZONE_EPOCHS: usize = 4;

/// Number of collections whose ranges are kept
const RANGE_HISTORY: usize = 16;

/// Address bits below the zone index
const ZONE_SHIFT: u32 = 20;

const ALL_ZONES: u64 = u64::MAX;

/// Zone bit of `addr`
#[inline]
fn zone_bit(addr: usize) -> u64 {
    1u64 << ((addr >> ZONE_SHIFT) & 63)
}

/// Zone bits touched by `[lo, hi)`
fn zone_mask(lo: usize, hi: usize) -> u64 {
    if hi <= lo {
        return 0;
    }
    let first = lo >> ZONE_SHIFT;
    let last = (hi - 1) >> ZONE_SHIFT;
    if last - first >= 64 {
        return ALL_ZONES;
    }
    (first..=last).fold(0, |mask, zone| mask | 1u64 << (zone & 63))
}

/// Client view of a location dependency
pub trait LocationWatch: Clone + Send + Sync {
    /// Start depending on the location of `addr`
    fn add(&mut self, addr: usize);

    /// Stop depending on `addr`; implementations may keep watching it
    fn remove(&mut self, addr: usize);

    /// Forget every address and start over from the current state
    fn clear(&mut self);

    /// Whether any watched address may have moved since the baseline
    fn moved(&self) -> bool;

    /// Whether `addr` may have moved since the baseline
    fn moved_addr(&self, addr: usize) -> bool;
}

struct History {
    epoch: u64,
    /// Zone mask of epoch `e` at `e % ZONE_EPOCHS`
    zones: [u64; ZONE_EPOCHS],
    /// Union of masks evicted from `zones`
    prehistory: u64,
    /// Ranges of epochs `first..=epoch`
    ranges: VecDeque<Vec<(usize, usize)>>,
    first: u64,
}

/// Record of what every collection moved
pub struct MoveLog {
    history: Mutex<History>,
}

impl MoveLog {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(History {
                epoch: 0,
                zones: [0; ZONE_EPOCHS],
                prehistory: 0,
                ranges: VecDeque::with_capacity(RANGE_HISTORY),
                first: 1,
            }),
        }
    }

    /// Current epoch, the number of collections recorded
    pub fn epoch(&self) -> u64 {
        self.history.lock().epoch
    }

    /// Record one collection
    pub fn record(&self, moved: &[(usize, usize)]) {
        let mut h = self.history.lock();
        h.epoch += 1;
        let slot = (h.epoch % ZONE_EPOCHS as u64) as usize;
        let evicted = h.zones[slot];
        h.prehistory |= evicted;
        h.zones[slot] = moved.iter().fold(0, |mask, &(lo, hi)| mask | zone_mask(lo, hi));

        h.ranges.push_back(moved.to_vec());
        if h.ranges.len() > RANGE_HISTORY {
            h.ranges.pop_front();
            h.first += 1;
        }
        log::trace!("move log epoch {}: {} ranges", h.epoch, moved.len());
    }

    /// Zones moved by the collections after `epoch`
    fn zones_since(&self, epoch: u64) -> u64 {
        let h = self.history.lock();
        if epoch >= h.epoch {
            return 0;
        }
        if h.epoch - epoch > ZONE_EPOCHS as u64 {
            return h.zones.iter().fold(h.prehistory, |mask, zones| mask | zones);
        }
        (epoch + 1..=h.epoch).fold(0, |mask, e| mask | h.zones[(e % ZONE_EPOCHS as u64) as usize])
    }

    /// Whether a collection after `epoch` moved anything in `[min, max]`
    fn moved_since(&self, epoch: u64, min: usize, max: usize) -> bool {
        let h = self.history.lock();
        if epoch >= h.epoch {
            return false;
        }
        if epoch + 1 < h.first {
            return true;
        }
        let skip = (epoch + 1 - h.first) as usize;
        h.ranges
            .iter()
            .skip(skip)
            .flatten()
            .any(|&(lo, hi)| lo <= max && min < hi)
    }
}

impl Default for MoveLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MoveLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = self.history.lock();
        f.debug_struct("MoveLog")
            .field("epoch", &h.epoch)
            .field("history", &h.ranges.len())
            .finish()
    }
}

/// Epoch and zone-set watch
#[derive(Clone)]
pub struct EpochWatch {
    log: Arc<MoveLog>,
    epoch: u64,
    refset: u64,
}

impl EpochWatch {
    pub fn new(log: Arc<MoveLog>) -> Self {
        let epoch = log.epoch();
        Self { log, epoch, refset: 0 }
    }

    /// Epoch the watch compares against
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl LocationWatch for EpochWatch {
    fn add(&mut self, addr: usize) {
        self.refset |= zone_bit(addr);
    }

    fn remove(&mut self, _addr: usize) {}

    fn clear(&mut self) {
        self.refset = 0;
        self.epoch = self.log.epoch();
    }

    fn moved(&self) -> bool {
        self.refset != 0 && self.log.zones_since(self.epoch) & self.refset != 0
    }

    fn moved_addr(&self, addr: usize) -> bool {
        self.log.zones_since(self.epoch) & zone_bit(addr) != 0
    }
}

impl std::fmt::Debug for EpochWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochWatch")
            .field("epoch", &self.epoch)
            .field("refset", &format_args!("{:#018x}", self.refset))
            .finish()
    }
}

/// Address-interval watch
#[derive(Clone)]
pub struct AddrWatch {
    log: Arc<MoveLog>,
    since: u64,
    min: usize,
    max: usize,
}

impl AddrWatch {
    pub fn new(log: Arc<MoveLog>) -> Self {
        let since = log.epoch();
        Self {
            log,
            since,
            min: usize::MAX,
            max: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

impl LocationWatch for AddrWatch {
    fn add(&mut self, addr: usize) {
        self.min = self.min.min(addr);
        self.max = self.max.max(addr);
    }

    fn remove(&mut self, _addr: usize) {}

    fn clear(&mut self) {
        self.min = usize::MAX;
        self.max = 0;
        self.since = self.log.epoch();
    }

    fn moved(&self) -> bool {
        !self.is_empty() && self.log.moved_since(self.since, self.min, self.max)
    }

    fn moved_addr(&self, addr: usize) -> bool {
        self.log.moved_since(self.since, addr, addr)
    }
}

impl std::fmt::Debug for AddrWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddrWatch")
            .field("since", &self.since)
            .field("min", &format_args!("{:#x}", self.min))
            .field("max", &format_args!("{:#x}", self.max))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1 << 20;

    #[test]
    fn test_zone_mask() {
        assert_eq!(zone_mask(0, MB), 1);
        assert_eq!(zone_mask(MB - 8, MB + 8), 0b11);
        assert_eq!(zone_mask(0, 65 * MB), ALL_ZONES);
        assert_eq!(zone_mask(5, 5), 0);
        // Zones wrap every 64MB
        assert_eq!(zone_bit(64 * MB), zone_bit(0));
    }

    #[test]
    fn test_epoch_watch_sees_moves_in_its_zones() {
        let log = Arc::new(MoveLog::new());
        let mut watch = EpochWatch::new(log.clone());
        watch.add(3 * MB + 16);
        assert!(!watch.moved());

        log.record(&[(10 * MB, 10 * MB + 4096)]);
        assert!(!watch.moved());

        log.record(&[(3 * MB, 3 * MB + 4096)]);
        assert!(watch.moved());
        assert!(watch.moved_addr(3 * MB + 1024));
        // moved() does not reset
        assert!(watch.moved());

        watch.clear();
        assert!(!watch.moved());
        watch.add(3 * MB + 16);
        assert!(!watch.moved());
    }

    #[test]
    fn test_epoch_watch_prehistory() {
        let log = Arc::new(MoveLog::new());
        let mut watch = EpochWatch::new(log.clone());
        watch.add(7 * MB);

        log.record(&[(7 * MB, 7 * MB + 64)]);
        for _ in 0..(ZONE_EPOCHS * 2) {
            log.record(&[]);
        }
        assert!(watch.moved());
    }

    #[test]
    fn test_clone_shares_baseline() {
        let log = Arc::new(MoveLog::new());
        let mut watch = EpochWatch::new(log.clone());
        watch.add(MB);
        let copy = watch.clone();
        log.record(&[(MB, MB + 64)]);
        assert!(watch.moved());
        assert!(copy.moved());
    }

    #[test]
    fn test_addr_watch_intervals() {
        let log = Arc::new(MoveLog::new());
        let mut watch = AddrWatch::new(log.clone());
        assert!(!watch.moved());
        watch.add(0x5000);
        watch.add(0x6000);

        log.record(&[(0x7000, 0x8000)]);
        assert!(!watch.moved());
        log.record(&[(0x5800, 0x5900)]);
        assert!(watch.moved());
        assert!(!watch.moved_addr(0x5000));
        assert!(watch.moved_addr(0x5810));

        watch.clear();
        watch.add(0x5810);
        assert!(!watch.moved());
    }

    #[test]
    fn test_addr_watch_history_overflow() {
        let log = Arc::new(MoveLog::new());
        let mut watch = AddrWatch::new(log.clone());
        watch.add(0x5000);
        for _ in 0..=RANGE_HISTORY {
            log.record(&[]);
        }
        assert!(watch.moved());
    }
}
