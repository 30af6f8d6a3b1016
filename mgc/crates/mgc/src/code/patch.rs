//! Code patching
//!
//! Replays a code block's reference table into its instructions. Every
//! write is a single atomic store so a core executing the block never sees a
//! torn pointer, and is followed by a data cache clean plus instruction
//! cache invalidation so other cores fetch the new bytes.

use super::{CodeBlock, CodeTables, RefKind};
use crate::util::constants::{CACHE_LINE, WORD};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Rewrite every embedded pointer of `block` from its reference table
///
/// Called after the block moved or after any traced entry's target moved.
/// Records the block's current address in the table's `reserved` word.
/// Entries whose field does not fit inside the instructions are skipped.
pub fn update_ptrs(block: &mut CodeBlock, tables: &CodeTables) {
    let code = block.address();
    let size = block.code_size();

    for r in block.refs() {
        let kind = r.kind();
        if r.offset as usize + kind.width() > size {
            log::warn!("code block {:#x}: {:?} field at offset {} overruns {} bytes", code, kind, r.offset, size);
            continue;
        }
        let field = code + r.offset as usize;
        match kind {
            RefKind::Disabled | RefKind::Stored => {},
            RefKind::Absolute => write_ptr(field, r.pointer),
            RefKind::Relative => write_ptr(field, r.pointer.wrapping_sub(field + WORD)),
            RefKind::Inside => write_ptr(field, code.wrapping_add(r.pointer)),
            RefKind::RelativeHere => {
                let slot = &r.pointer as *const usize as usize;
                write_u32(field, slot.wrapping_sub(field + 4) as u32);
            },
            RefKind::CodeInfo => {
                if r.pointer != 0 && !tables.code.update(r.pointer, code) {
                    log::warn!("code block {:#x} refers to unknown identity entry {}", code, r.pointer);
                }
            },
            RefKind::UnwindInfo => {
                if r.pointer != 0 && !tables.unwind.update_fn(r.pointer, code) {
                    log::warn!("code block {:#x} refers to unknown unwind record {}", code, r.pointer);
                }
            },
        }
    }

    block.set_replayed_at(code);
}

/// Release the side-table entries owned by a dying code block
///
/// The handle is nulled before the entry is removed so a concurrent replay
/// never looks up a half-released record. Failures are logged and ignored.
pub fn finalize(block: &mut CodeBlock, tables: &CodeTables) {
    for r in block.refs_mut() {
        let kind = r.kind();
        if !kind.is_external() {
            continue;
        }

        // SAFETY: `pointer` is a naturally aligned usize inside the record.
        let slot = unsafe { AtomicUsize::from_ptr(&mut r.pointer) };
        let id = slot.swap(0, Ordering::AcqRel);
        if id == 0 {
            continue;
        }

        let removed = match kind {
            RefKind::CodeInfo => tables.code.remove(id),
            _ => tables.unwind.free(id),
        };
        if !removed {
            log::warn!("failed to release side-table entry {} of {:?}", id, kind);
        }
    }
}

/// Atomically store a pointer-sized value at `addr` and flush it
pub fn write_ptr(addr: usize, value: usize) {
    if addr % WORD == 0 {
        // SAFETY: `addr` is an aligned field inside a live code block.
        unsafe { AtomicUsize::from_ptr(addr as *mut usize).store(value, Ordering::Release) };
    } else {
        // SAFETY: as above; x86-64 and aarch64 perform this as one store.
        unsafe { std::ptr::write_unaligned(addr as *mut usize, value) };
    }
    invalidate(addr, WORD);
}

/// Atomically store a 32-bit value at `addr` and flush it
pub fn write_u32(addr: usize, value: u32) {
    if addr % 4 == 0 {
        // SAFETY: `addr` is an aligned field inside a live code block.
        unsafe { AtomicU32::from_ptr(addr as *mut u32).store(value, Ordering::Release) };
    } else {
        // SAFETY: as above.
        unsafe { std::ptr::write_unaligned(addr as *mut u32, value) };
    }
    invalidate(addr, 4);
}

/// Make `[addr, addr + len)` visible to instruction fetch on every core
pub fn invalidate(addr: usize, len: usize) {
    let first = addr & !(CACHE_LINE - 1);
    let last = (addr + len - 1) & !(CACHE_LINE - 1);
    let mut line = first;
    while line <= last {
        flush_line(line);
        line += CACHE_LINE;
    }
    std::sync::atomic::fence(Ordering::SeqCst);
}

#[cfg(target_arch = "aarch64")]
fn flush_line(line: usize) {
    // SAFETY: cache maintenance on a mapped address has no other effect.
    unsafe {
        std::arch::asm!(
            "dc cvau, {0}",
            "dsb ish",
            "ic ivau, {0}",
            "dsb ish",
            "isb",
            in(reg) line,
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_line(_line: usize) {
    // Coherent instruction caches: ordering the store is enough.
    std::sync::atomic::compiler_fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_write() {
        let mut buf = [0u8; 24];
        let addr = buf.as_mut_ptr() as usize + 3;
        write_ptr(addr, 0x1122_3344_5566_7788);
        let read = unsafe { std::ptr::read_unaligned(addr as *const usize) };
        assert_eq!(read, 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_u32_write() {
        let mut buf = [0u32; 2];
        let addr = buf.as_mut_ptr() as usize;
        write_u32(addr + 4, 0xdead_beef);
        assert_eq!(buf[1], 0xdead_beef);
    }
}
