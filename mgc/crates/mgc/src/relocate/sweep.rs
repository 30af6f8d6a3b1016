//! In-place sweep of chunks whose objects did not move
//!
//! Nailed chunks, large-object chunks and non-moving chunks keep their
//! survivors where they are. Every unmarked record (and every forwarding
//! record left behind by an evacuation) becomes free space; runs of free
//! records are coalesced into a single pad.

use crate::heap::Chunk;
use crate::object::header::{header_at, record_kind, record_size, write_pad, RecordKind};

/// Result of sweeping one chunk
#[derive(Debug, Default)]
pub struct SweepResult {
    /// Bytes turned into free space
    pub freed: usize,
    /// Forwarding records found
    pub forwards: usize,
    /// Coalesced holes as `(base, size)`
    pub holes: Vec<(usize, usize)>,
}

/// Sweep `chunk`, clearing the mark of every survivor
///
/// # Safety
/// The chunk must be fully formatted and no mutator may run.
pub unsafe fn sweep_chunk(chunk: &Chunk) -> SweepResult {
    let mut result = SweepResult::default();
    let mut hole: Option<usize> = None;
    let mut at = chunk.base;

    while at < chunk.top {
        let size = record_size(at);
        let dead = match record_kind(at) {
            RecordKind::Pad => true,
            RecordKind::Forward => {
                result.forwards += 1;
                result.freed += size;
                true
            },
            RecordKind::Object | RecordKind::Code => {
                let header = header_at(at);
                if header.is_marked() {
                    header.clear_mark();
                    false
                } else {
                    result.freed += size;
                    true
                }
            },
        };

        match (dead, hole) {
            (true, None) => hole = Some(at),
            (false, Some(start)) => {
                close_hole(&mut result, start, at);
                hole = None;
            },
            _ => {},
        }
        at += size;
    }

    if let Some(start) = hole {
        close_hole(&mut result, start, chunk.top);
    }
    result
}

unsafe fn close_hole(result: &mut SweepResult, start: usize, end: usize) {
    write_pad(start, end - start);
    result.holes.push((start, end - start));
}
