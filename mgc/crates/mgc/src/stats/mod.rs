//! Stats Module - collector statistics
//!
//! Counters are plain atomics updated at the end of each cycle and by the
//! finalization paths. `MemorySummary` combines a counter snapshot with the
//! current heap occupancy and serializes to JSON for diagnostics.

pub mod timer;

pub use timer::GcTimer;

use crate::heap::{GenerationSummary, PoolSummary};
use crate::relocate::CollectionReport;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// GcStats - cumulative counters of one collector
#[derive(Debug, Default)]
pub struct GcStats {
    collections: AtomicU64,
    full_collections: AtomicU64,
    bytes_copied: AtomicUsize,
    objects_copied: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    nailed_chunks: AtomicUsize,
    weak_splatted: AtomicUsize,
    finalizers_posted: AtomicUsize,
    objects_finalized: AtomicUsize,
    type_sweeps: AtomicU64,
    total_pause_ns: AtomicU64,
    max_pause_ns: AtomicU64,
}

impl GcStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished collection
    pub fn record_collection(&self, report: &CollectionReport) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        if report.full {
            self.full_collections.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_copied.fetch_add(report.copied_bytes, Ordering::Relaxed);
        self.objects_copied.fetch_add(report.copied_objects, Ordering::Relaxed);
        self.bytes_reclaimed.fetch_add(report.reclaimed_bytes, Ordering::Relaxed);
        self.nailed_chunks.fetch_add(report.nailed_chunks, Ordering::Relaxed);
        self.weak_splatted.fetch_add(report.weak_splatted, Ordering::Relaxed);
        self.finalizers_posted.fetch_add(report.posted.len(), Ordering::Relaxed);

        let pause = report.duration.as_nanos() as u64;
        self.total_pause_ns.fetch_add(pause, Ordering::Relaxed);
        self.max_pause_ns.fetch_max(pause, Ordering::Relaxed);
    }

    pub fn record_finalized(&self) {
        self.objects_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_type_sweep(&self) {
        self.type_sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    pub fn objects_finalized(&self) -> usize {
        self.objects_finalized.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let collections = self.collections.load(Ordering::Relaxed);
        let total_pause_ns = self.total_pause_ns.load(Ordering::Relaxed);
        StatsSnapshot {
            collections,
            full_collections: self.full_collections.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            objects_copied: self.objects_copied.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            nailed_chunks: self.nailed_chunks.load(Ordering::Relaxed),
            weak_splatted: self.weak_splatted.load(Ordering::Relaxed),
            finalizers_posted: self.finalizers_posted.load(Ordering::Relaxed),
            objects_finalized: self.objects_finalized.load(Ordering::Relaxed),
            type_sweeps: self.type_sweeps.load(Ordering::Relaxed),
            total_pause_ms: total_pause_ns as f64 / 1_000_000.0,
            max_pause_ms: self.max_pause_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            avg_pause_ms: if collections == 0 {
                0.0
            } else {
                total_pause_ns as f64 / collections as f64 / 1_000_000.0
            },
        }
    }
}

/// Point-in-time copy of `GcStats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub collections: u64,
    pub full_collections: u64,
    pub bytes_copied: usize,
    pub objects_copied: usize,
    pub bytes_reclaimed: usize,
    pub nailed_chunks: usize,
    pub weak_splatted: usize,
    pub finalizers_posted: usize,
    pub objects_finalized: usize,
    pub type_sweeps: u64,
    pub total_pause_ms: f64,
    pub max_pause_ms: f64,
    pub avg_pause_ms: f64,
}

/// Heap occupancy and collector counters
#[derive(Debug, Clone, Serialize)]
pub struct MemorySummary {
    pub backend: &'static str,
    pub mapped: usize,
    pub pools: Vec<PoolSummary>,
    pub generations: Vec<GenerationSummary>,
    /// Registered type descriptors
    pub types: usize,
    pub code_entries: usize,
    pub unwind_records: usize,
    pub roots: usize,
    pub threads: usize,
    /// Objects registered for finalization and not yet found dead
    pub finalizable: usize,
    /// Objects waiting in the message stream
    pub pending_finalization: usize,
    pub stats: StatsSnapshot,
}

impl MemorySummary {
    /// Bytes in use across all pools
    pub fn used(&self) -> usize {
        self.pools.iter().map(|pool| pool.used).sum()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}
