//! GC Code Tests - code blocks, reference fixup and side tables
//!
//! These tests verify that:
//! - every reference kind is written into the instructions correctly
//! - a relocated block or target is replayed by the collector
//! - traced entries keep their targets alive, disabled ones do not
//! - dying blocks release their code-table and unwind entries

#[macro_use]
mod common;

use common::GcFixture;
use mgc::code::{UnwindRecord, CODE_TABLE_HEADER};
use mgc::{Backend, GcCodeRef, RefKind, RootSlots, TypeHandle};

backend_tests!(
    test_code_block_shape,
    test_relative_and_absolute_fixup_after_move,
    test_relative_here_points_at_its_slot,
    test_stored_keeps_target_without_writing,
    test_disabled_entries_are_not_traced,
    test_unknown_kinds_are_ignored,
    test_patch_rejects_fields_past_the_code,
    test_side_tables_follow_moves,
    test_dead_code_releases_side_tables,
);

const CODE_BYTES: usize = 64;
const FILLER: u8 = 0xcc;

fn read_word(addr: usize) -> usize {
    // SAFETY: tests read fields inside code blocks they allocated.
    unsafe { std::ptr::read_unaligned(addr as *const usize) }
}

fn read_u32(addr: usize) -> u32 {
    // SAFETY: as `read_word`.
    unsafe { std::ptr::read_unaligned(addr as *const u32) }
}

/// Allocate a rooted target in `roots[1]` of type `ty`
fn target<B: Backend>(f: &GcFixture<B>, roots: &RootSlots) -> (TypeHandle, usize) {
    let ty = f.node_type();
    let obj = f.alloc_rooted(ty, roots, 1);
    common::set_field(obj, 1, 0x7a7a);
    (ty, obj)
}

/// Emit a block with `refs` into `roots[0]` and patch it once
fn emit<B: Backend>(f: &GcFixture<B>, roots: &RootSlots, refs: &[GcCodeRef]) -> usize {
    let block = f.gc.alloc_code(f.ctx(), CODE_BYTES, refs.len()).unwrap();
    roots.set(0, block);
    let mut view = f.gc.code_block(block).unwrap();
    view.code_mut().fill(FILLER);
    view.refs_mut().copy_from_slice(refs);
    f.gc.patch_code(block).unwrap();
    block
}

/// **Bug this finds:** Code blocks reported as objects, table misplaced
fn test_code_block_shape<B: Backend>() {
    let f = GcFixture::<B>::new();
    let roots = f.roots(2);
    let block = emit(&f, &roots, &[GcCodeRef::new(0, RefKind::Disabled, 0); 3]);

    assert!(f.gc.is_code(block));
    assert_eq!(f.gc.type_of(block), None, "code blocks have no type");
    assert!(!f.gc.live_object(block));
    assert_eq!(f.gc.code_size(block).unwrap(), CODE_BYTES);

    let view = f.gc.code_block(block).unwrap();
    let (first, count) = f.gc.code_refs(block).unwrap();
    assert_eq!(count, 3);
    assert_eq!(first, view.table_addr() + CODE_TABLE_HEADER);
    assert!(view.code().iter().all(|&b| b == FILLER));

    let registered = f.gc.summary().finalizable;
    assert!(registered >= 1, "code blocks are always registered for finalization");
}

/// Code patch correctness after the block and its target both moved
///
/// **Bug this finds:** Stale block address used for relative writes, block
/// copied without replay
fn test_relative_and_absolute_fixup_after_move<B: Backend>() {
    let f = GcFixture::<B>::new();
    let roots = f.roots(2);
    let (ty, t) = target(&f, &roots);
    let block = emit(
        &f,
        &roots,
        &[
            GcCodeRef::new(16, RefKind::Relative, t),
            GcCodeRef::new(24, RefKind::Absolute, t),
            GcCodeRef::new(40, RefKind::Inside, 8),
        ],
    );
    assert_eq!(read_word(block + 16), t.wrapping_sub(block + 16 + 8));

    // Only the code block keeps the target now
    roots.set(1, 0);
    f.collect();

    let block = roots.get(0);
    let view = f.gc.code_block(block).unwrap();
    let t_new = view.refs()[0].pointer;
    assert_ne!(t_new, t, "target was not relocated");
    common::assert_live(&f.gc, t_new, ty, "code target");
    assert_eq!(common::field(t_new, 1), 0x7a7a);
    assert_eq!(view.refs()[1].pointer, t_new);

    assert_eq!(read_word(block + 16), t_new.wrapping_sub(block + 16 + 8));
    assert_eq!(read_word(block + 24), t_new);
    assert_eq!(read_word(block + 40), block + 8);
    assert_eq!(view.replayed_at(), block);
    assert_eq!(view.code()[0], FILLER, "bytes outside reference fields changed");
}

/// **Bug this finds:** 32-bit field computed from the target instead of the slot
fn test_relative_here_points_at_its_slot<B: Backend>() {
    let f = GcFixture::<B>::new();
    let roots = f.roots(2);
    let (_, t) = target(&f, &roots);
    emit(&f, &roots, &[GcCodeRef::new(16, RefKind::RelativeHere, t)]);
    roots.set(1, 0);

    f.collect();

    let block = roots.get(0);
    let view = f.gc.code_block(block).unwrap();
    let slot = &view.refs()[0].pointer as *const usize as usize;
    let t_new = read_word(slot);
    assert_ne!(t_new, t);
    assert!(f.gc.live_object(t_new));
    assert_eq!(read_u32(block + 16), slot.wrapping_sub(block + 16 + 4) as u32);
    assert_eq!(view.code()[20], FILLER, "RelativeHere wrote more than 4 bytes");
}

/// **Bug this finds:** Stored entries written into the instruction stream
fn test_stored_keeps_target_without_writing<B: Backend>() {
    let f = GcFixture::<B>::new();
    let roots = f.roots(2);
    let (ty, t) = target(&f, &roots);
    emit(&f, &roots, &[GcCodeRef::new(16, RefKind::Stored, t)]);
    roots.set(1, 0);

    f.collect();

    let view = f.gc.code_block(roots.get(0)).unwrap();
    common::assert_live(&f.gc, view.refs()[0].pointer, ty, "stored target");
    assert!(view.code()[16..24].iter().all(|&b| b == FILLER));
}

/// **Bug this finds:** Disabled entries keeping garbage alive
fn test_disabled_entries_are_not_traced<B: Backend>() {
    let f = GcFixture::<B>::new();
    let roots = f.roots(2);
    let (_, t) = target(&f, &roots);
    emit(&f, &roots, &[GcCodeRef::new(16, RefKind::Disabled, t)]);
    roots.set(1, 0);

    f.collect();

    assert!(!f.walks(t), "disabled entry kept its target alive");
    let view = f.gc.code_block(roots.get(0)).unwrap();
    assert_eq!(view.refs()[0].pointer, t, "disabled entry was rewritten");
}

/// **Bug this finds:** Emitter garbage in `kind` read as an enum or traced
fn test_unknown_kinds_are_ignored<B: Backend>() {
    let f = GcFixture::<B>::new();
    let roots = f.roots(2);
    let (_, t) = target(&f, &roots);
    let mut unknown = GcCodeRef::new(16, RefKind::Absolute, t);
    unknown.kind = 42;
    emit(&f, &roots, &[unknown]);
    roots.set(1, 0);

    f.collect();

    assert!(!f.walks(t), "unknown entry kept its target alive");
    let view = f.gc.code_block(roots.get(0)).unwrap();
    assert_eq!(view.refs()[0].kind, 42);
    assert_eq!(view.refs()[0].kind(), RefKind::Disabled);
    assert!(view.code().iter().all(|&b| b == FILLER), "unknown entry was written");
}

/// **Bug this finds:** Patching writes past the instructions into the table
fn test_patch_rejects_fields_past_the_code<B: Backend>() {
    let f = GcFixture::<B>::new();
    let roots = f.roots(2);
    let (_, t) = target(&f, &roots);

    let block = f.gc.alloc_code(f.ctx(), CODE_BYTES, 2).unwrap();
    roots.set(0, block);
    let mut view = f.gc.code_block(block).unwrap();
    view.code_mut().fill(FILLER);
    view.refs_mut()[0] = GcCodeRef::new((CODE_BYTES - 4) as u32, RefKind::RelativeHere, t);
    view.refs_mut()[1] = GcCodeRef::new((CODE_BYTES - 4) as u32, RefKind::Absolute, t);

    assert!(matches!(f.gc.patch_code(block), Err(mgc::GcError::Usage(_))));
    assert!(view.code().iter().all(|&b| b == FILLER), "rejected table was partly written");
    let (table, _) = f.gc.code_refs(block).unwrap();
    assert_eq!(read_word(table + 16 + 8), t, "table entry overwritten");

    // A 4-byte field ending exactly at the last byte fits
    view.refs_mut()[1] = GcCodeRef::new(0, RefKind::Disabled, 0);
    f.gc.patch_code(block).unwrap();
    assert_ne!(read_u32(block + CODE_BYTES - 4), u32::from_ne_bytes([FILLER; 4]));
}

/// **Bug this finds:** Identity and unwind tables left at the old address
fn test_side_tables_follow_moves<B: Backend>() {
    let f = GcFixture::<B>::new();
    let roots = f.roots(2);
    let tables = f.gc.code_tables();

    let block = f.gc.alloc_code(f.ctx(), CODE_BYTES, 2).unwrap();
    roots.set(0, block);
    let info = tables.code.insert(block, CODE_BYTES);
    let unwind = tables.unwind.insert(UnwindRecord {
        pc_begin: block,
        pc_range: CODE_BYTES,
        data: vec![1, 2, 3],
    });
    let mut view = f.gc.code_block(block).unwrap();
    view.refs_mut()[0] = GcCodeRef::new(0, RefKind::CodeInfo, info);
    view.refs_mut()[1] = GcCodeRef::new(0, RefKind::UnwindInfo, unwind);
    f.gc.patch_code(block).unwrap();

    f.collect();

    let moved = roots.get(0);
    assert_ne!(moved, block);
    assert_eq!(tables.code.find(moved + 4), Some(moved));
    assert_eq!(tables.code.start_of(info), Some(moved));
    let record = tables.unwind.get(unwind).expect("unwind record kept");
    assert_eq!(record.pc_begin, moved);
    assert_eq!(record.data, vec![1, 2, 3]);
    assert_eq!(tables.unwind.find(moved + CODE_BYTES - 1).map(|r| r.pc_begin), Some(moved));
}

/// **Bug this finds:** Side-table entries leaked by dead code
fn test_dead_code_releases_side_tables<B: Backend>() {
    let f = GcFixture::<B>::new();
    let roots = f.roots(1);
    let tables = f.gc.code_tables();
    let (code_before, unwind_before) = (tables.code.len(), tables.unwind.len());

    let block = f.gc.alloc_code(f.ctx(), CODE_BYTES, 2).unwrap();
    roots.set(0, block);
    let info = tables.code.insert(block, CODE_BYTES);
    let unwind = tables.unwind.insert(UnwindRecord {
        pc_begin: block,
        pc_range: CODE_BYTES,
        data: Vec::new(),
    });
    let mut view = f.gc.code_block(block).unwrap();
    view.refs_mut()[0] = GcCodeRef::new(0, RefKind::CodeInfo, info);
    view.refs_mut()[1] = GcCodeRef::new(0, RefKind::UnwindInfo, unwind);
    f.gc.patch_code(block).unwrap();
    assert_eq!(f.gc.summary().code_entries, code_before + 1);

    roots.set(0, 0);
    f.collect();
    f.collect();

    assert_eq!(tables.code.len(), code_before);
    assert_eq!(tables.unwind.len(), unwind_before);
    assert!(tables.unwind.get(unwind).is_none());

    // The block itself is gone once its finalization completed
    f.collect();
    assert!(f.objects().iter().all(|&(_, _, kind)| kind != mgc::object::RecordKind::Code));
}
