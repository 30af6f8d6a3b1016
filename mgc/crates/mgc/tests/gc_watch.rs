//! GC Watch Tests - location dependencies across collections
//!
//! Watch soundness: after `add` and a collection that relocates the watched
//! object, `moved()` is true; with no collection in between it is false.

#[macro_use]
mod common;

use common::GcFixture;
use mgc::{AddrWatch, Backend, EpochWatch, GenerationalBackend, LocationWatch, PoolBackend};

backend_tests!(
    test_watch_quiet_without_collection,
    test_watch_sees_relocation,
    test_clear_resets_baseline,
    test_clones_share_baseline,
    test_old_baseline_is_conservative,
);

/// **Bug this finds:** Watches reporting moves that never happened
fn test_watch_quiet_without_collection<B: Backend>() {
    let f = GcFixture::<B>::new();
    let ty = f.node_type();
    let roots = f.roots(1);
    let obj = f.alloc_rooted(ty, &roots, 0);

    let mut watch = f.gc.create_watch();
    assert!(!watch.moved(), "empty watch reported a move");
    watch.add(obj);
    for _ in 0..100 {
        f.gc.alloc(f.ctx(), ty).unwrap();
    }
    assert!(!watch.moved());
    assert!(!watch.moved_addr(obj));
}

/// **Bug this finds:** Relocations not recorded in the move log
fn test_watch_sees_relocation<B: Backend>() {
    let f = GcFixture::<B>::new();
    let ty = f.node_type();
    let roots = f.roots(1);
    let obj = f.alloc_rooted(ty, &roots, 0);

    let mut watch = f.gc.create_watch();
    watch.add(obj);
    f.collect();

    assert_ne!(roots.get(0), obj, "the watched object should have moved");
    assert!(watch.moved(), "relocation of a watched address not observed");
    assert!(watch.moved_addr(obj));
    // Asking does not reset
    assert!(watch.moved());
}

/// **Bug this finds:** `clear` keeping the old baseline or the old addresses
fn test_clear_resets_baseline<B: Backend>() {
    let f = GcFixture::<B>::new();
    let ty = f.node_type();
    let roots = f.roots(1);
    let obj = f.alloc_rooted(ty, &roots, 0);

    let mut watch = f.gc.create_watch();
    watch.add(obj);
    f.collect();
    assert!(watch.moved());

    watch.clear();
    assert!(!watch.moved(), "cleared watch still stale");
    watch.add(roots.get(0));
    watch.remove(roots.get(0));
    assert!(!watch.moved());
}

/// **Bug this finds:** Clones detached from the move log
fn test_clones_share_baseline<B: Backend>() {
    let f = GcFixture::<B>::new();
    let ty = f.node_type();
    let roots = f.roots(1);
    let obj = f.alloc_rooted(ty, &roots, 0);

    let mut watch = f.gc.create_watch();
    watch.add(obj);
    let copy = watch.clone();
    f.collect();
    assert!(watch.moved());
    assert!(copy.moved());
}

/// **Bug this finds:** Truncated history answering "not moved"
fn test_old_baseline_is_conservative<B: Backend>() {
    let f = GcFixture::<B>::new();
    let ty = f.node_type();
    let roots = f.roots(1);
    let obj = f.alloc_rooted(ty, &roots, 0);

    let mut watch = f.gc.create_watch();
    watch.add(obj);
    for _ in 0..24 {
        f.collect();
    }
    assert!(watch.moved());
}

/// Each backend hands out its own watch flavour
#[test]
fn test_backend_watch_types() {
    let pool = GcFixture::<PoolBackend>::new();
    let watch: EpochWatch = pool.gc.create_watch();
    assert_eq!(watch.epoch(), pool.gc.backend().shared().moves.epoch());

    let generational = GcFixture::<GenerationalBackend>::new();
    let _watch: AddrWatch = generational.gc.create_watch();
}
