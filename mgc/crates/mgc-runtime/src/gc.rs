//! GC Runtime - C FFI wrapper for MGC
//!
//! One process-wide collector backs every entry point. Each OS thread that
//! allocates must call `mgc_attach_thread` first; its context lives in a
//! thread-local until `mgc_detach_thread`.
//!
//! Addresses cross the boundary as `usize`. Calls that fail for a usage
//! reason log the error and return 0 (or `false`). Running out of memory
//! hands back the managed error object through `error_out`, and aborts the
//! process when not even that could be allocated.

use anyhow::Context;
use mgc::{
    Backend, DefaultBackend, DefaultGc, Finalized, GcConfig, GcError, GcKind, GcType, LocationWatch, RootHandle,
    Stack, StackSet, ThreadContext, TypeHandle,
};
use std::cell::RefCell;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static GC: OnceLock<Arc<DefaultGc>> = OnceLock::new();
static FINALIZER: OnceLock<extern "C" fn(usize)> = OnceLock::new();

type Watch = <DefaultBackend as Backend>::Watch;

/// Per-thread attachment: the context and the stacks scanned for it
struct Attached {
    ctx: ThreadContext<DefaultBackend>,
    stacks: Arc<StackSet>,
}

thread_local! {
    static ATTACHED: RefCell<Option<Attached>> = const { RefCell::new(None) };
}

fn gc() -> Option<&'static Arc<DefaultGc>> {
    let gc = GC.get();
    if gc.is_none() {
        log::error!("mgc: collector used before mgc_init");
    }
    gc
}

/// Run `f` with the calling thread's context, 0 if it is not attached
fn with_ctx(f: impl FnOnce(&DefaultGc, &ThreadContext<DefaultBackend>) -> mgc::Result<usize>, error_out: *mut usize) -> usize {
    ATTACHED.with(|attached| {
        let attached = attached.borrow();
        let Some(attached) = attached.as_ref() else {
            log::error!("mgc: allocation from a thread that is not attached");
            return 0;
        };
        let gc = attached.ctx.gc().clone();
        match f(&gc, &attached.ctx) {
            Ok(addr) => addr,
            Err(err) => allocation_failed(err, error_out),
        }
    })
}

fn allocation_failed(err: GcError, error_out: *mut usize) -> usize {
    match err.error_object() {
        Some(obj) => {
            if !error_out.is_null() {
                // SAFETY: callers pass either null or a writable word.
                unsafe { *error_out = obj };
            }
            0
        },
        None if matches!(err, GcError::OutOfMemory { .. }) => {
            log::error!("mgc: {}; no error object available, aborting", err);
            // SAFETY: abort never returns and has no preconditions.
            unsafe { libc::abort() }
        },
        None => {
            log::error!("mgc: {}", err);
            0
        },
    }
}

fn report<T: Default>(result: anyhow::Result<T>) -> T {
    result.unwrap_or_else(|err| {
        log::error!("mgc: {:#}", err);
        T::default()
    })
}

fn foreign_finalizer(obj: usize) -> Finalized {
    if let Some(finalize) = FINALIZER.get() {
        finalize(obj);
    }
    Finalized::Done
}

// ----------------------------------------------------------------------
// Lifecycle

/// Create the process-wide collector
///
/// Configuration comes from `MGC_*` environment variables. Calling it
/// again is a no-op.
#[no_mangle]
pub extern "C" fn mgc_init() -> bool {
    if GC.get().is_some() {
        return true;
    }
    let created = DefaultGc::new(GcConfig::from_env()).context("failed to create collector");
    match created {
        Ok(gc) => {
            let _ = GC.set(gc);
            log::info!("mgc: initialized ({} backend)", DefaultBackend::NAME);
            true
        },
        Err(err) => {
            log::error!("mgc: {:#}", err);
            false
        },
    }
}

/// Detach the calling thread and run a final collection
#[no_mangle]
pub extern "C" fn mgc_shutdown() {
    mgc_detach_thread();
    if let Some(gc) = GC.get() {
        report(gc.collect().context("final collection failed"));
        log::info!("mgc: shutdown, {}", gc.summary().to_json());
    }
}

/// Install the callback run for objects of finalizable types
#[no_mangle]
pub extern "C" fn mgc_set_finalizer(finalize: extern "C" fn(usize)) -> bool {
    FINALIZER.set(finalize).is_ok()
}

/// Register the reflection layer's out-of-memory error type
#[no_mangle]
pub extern "C" fn mgc_set_error_type(ty: usize) -> bool {
    let Some(gc) = gc() else { return false };
    report(
        TypeHandle::from_raw(ty)
            .context("null type handle")
            .and_then(|ty| gc.set_error_type(ty).context("cannot register error type"))
            .map(|_| true),
    )
}

// ----------------------------------------------------------------------
// Threads and stacks

#[no_mangle]
pub extern "C" fn mgc_attach_thread() -> bool {
    let Some(gc) = gc() else { return false };
    ATTACHED.with(|attached| {
        let mut attached = attached.borrow_mut();
        if attached.is_some() {
            return true;
        }
        let stacks = Arc::new(StackSet::new());
        match gc.attach_thread(stacks.clone()) {
            Ok(ctx) => {
                *attached = Some(Attached { ctx, stacks });
                true
            },
            Err(err) => {
                log::error!("mgc: attach failed: {}", err);
                false
            },
        }
    })
}

#[no_mangle]
pub extern "C" fn mgc_detach_thread() {
    let Some(attached) = ATTACHED.with(|attached| attached.borrow_mut().take()) else {
        return;
    };
    let gc = attached.ctx.gc().clone();
    report(gc.detach_thread(attached.ctx).context("detach failed"));
}

/// Publish the stack pointer of the running green thread
#[no_mangle]
pub extern "C" fn mgc_set_extent(sp: usize) {
    ATTACHED.with(|attached| {
        if let Some(attached) = attached.borrow().as_ref() {
            attached.ctx.set_extent(sp);
        }
    });
}

/// Safepoint: wait out a pending collection, then run queued finalizers
///
/// Generated code calls this on loop back-edges; a thread that neither
/// polls nor allocates holds up every collection.
#[no_mangle]
pub extern "C" fn mgc_poll() -> usize {
    ATTACHED.with(|attached| attached.borrow().as_ref().map_or(0, |a| a.ctx.poll()))
}

/// Stop counting the calling thread for collections, before blocking code
///
/// Until `mgc_leave_safe_region` the thread must not touch managed objects.
#[no_mangle]
pub extern "C" fn mgc_enter_safe_region() {
    ATTACHED.with(|attached| {
        if let Some(attached) = attached.borrow().as_ref() {
            attached.ctx.enter_safe_region();
        }
    });
}

#[no_mangle]
pub extern "C" fn mgc_leave_safe_region() {
    ATTACHED.with(|attached| {
        if let Some(attached) = attached.borrow().as_ref() {
            attached.ctx.leave_safe_region();
        }
    });
}

/// Register a green-thread stack `[low, high)` with the calling thread
///
/// # Safety
///
/// The range must stay mapped until `mgc_stack_free`.
#[no_mangle]
pub unsafe extern "C" fn mgc_stack_new(low: usize, high: usize) -> *const Stack {
    ATTACHED.with(|attached| {
        let attached = attached.borrow();
        let Some(attached) = attached.as_ref() else {
            return std::ptr::null();
        };
        // SAFETY: forwarded from the caller.
        let stack = Arc::new(unsafe { Stack::new(low, high) });
        attached.stacks.insert(stack.clone());
        Arc::into_raw(stack)
    })
}

/// # Safety
///
/// `stack` must come from `mgc_stack_new` and not have been freed.
#[no_mangle]
pub unsafe extern "C" fn mgc_stack_suspend(stack: *const Stack, sp: usize) {
    // SAFETY: see above.
    if let Some(stack) = unsafe { stack.as_ref() } {
        stack.suspend(sp);
    }
}

/// # Safety
///
/// As `mgc_stack_suspend`.
#[no_mangle]
pub unsafe extern "C" fn mgc_stack_resume(stack: *const Stack) {
    // SAFETY: see above.
    if let Some(stack) = unsafe { stack.as_ref() } {
        stack.resume();
    }
}

/// # Safety
///
/// As `mgc_stack_suspend`; `stack` is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn mgc_stack_free(stack: *const Stack) {
    if stack.is_null() {
        return;
    }
    // SAFETY: the pointer was produced by `Arc::into_raw`.
    let stack = unsafe { Arc::from_raw(stack) };
    ATTACHED.with(|attached| {
        if let Some(attached) = attached.borrow().as_ref() {
            attached.stacks.remove(&stack);
        }
    });
}

// ----------------------------------------------------------------------
// Types

/// Create a type descriptor, returns its raw handle or 0
///
/// `kind`: 0 fixed, 1 object, 2 array, 3 weak array, 4 type-of-types.
///
/// # Safety
///
/// `offsets` must point to `offset_count` readable words (or be null when
/// the count is 0).
#[no_mangle]
pub unsafe extern "C" fn mgc_alloc_type(
    kind: u32,
    stride: usize,
    offsets: *const usize,
    offset_count: usize,
    reflect: usize,
    finalizable: bool,
) -> usize {
    let Some(gc) = gc() else { return 0 };
    let kind = match kind {
        0 => GcKind::Fixed,
        1 => GcKind::FixedObj,
        2 => GcKind::Array,
        3 => GcKind::WeakArray,
        4 => GcKind::Type,
        other => {
            log::error!("mgc: unknown type kind {}", other);
            return 0;
        },
    };
    let offsets = if offsets.is_null() || offset_count == 0 {
        &[][..]
    } else {
        // SAFETY: forwarded from the caller.
        unsafe { std::slice::from_raw_parts(offsets, offset_count) }
    };

    let mut ty = GcType::with_kind(kind, stride).with_offsets(offsets).with_reflect(reflect);
    if finalizable {
        ty = ty.with_finalizer(foreign_finalizer);
    }
    report(gc.alloc_type(ty).map(TypeHandle::to_raw).context("cannot create type"))
}

#[no_mangle]
pub extern "C" fn mgc_free_type(ty: usize) {
    if let (Some(gc), Some(ty)) = (gc(), TypeHandle::from_raw(ty)) {
        gc.free_type(ty);
    }
}

#[no_mangle]
pub extern "C" fn mgc_type_of(obj: usize) -> usize {
    gc().and_then(|gc| gc.type_of(obj)).map_or(0, TypeHandle::to_raw)
}

#[no_mangle]
pub extern "C" fn mgc_switch_type(obj: usize, ty: usize) -> bool {
    let Some(gc) = gc() else { return false };
    report(
        TypeHandle::from_raw(ty)
            .context("null type handle")
            .and_then(|ty| gc.switch_type(obj, ty).context("switch_type failed"))
            .map(|_| true),
    )
}

// ----------------------------------------------------------------------
// Allocation

fn handle(ty: usize) -> mgc::Result<TypeHandle> {
    TypeHandle::from_raw(ty).ok_or_else(|| GcError::Usage("null type handle".to_string()))
}

#[no_mangle]
pub extern "C" fn mgc_alloc(ty: usize, error_out: *mut usize) -> usize {
    with_ctx(|gc, ctx| gc.alloc(ctx, handle(ty)?), error_out)
}

#[no_mangle]
pub extern "C" fn mgc_alloc_array(ty: usize, count: usize, error_out: *mut usize) -> usize {
    with_ctx(|gc, ctx| gc.alloc_array(ctx, handle(ty)?, count), error_out)
}

#[no_mangle]
pub extern "C" fn mgc_alloc_weak_array(ty: usize, count: usize, error_out: *mut usize) -> usize {
    with_ctx(|gc, ctx| gc.alloc_weak_array(ctx, handle(ty)?, count), error_out)
}

#[no_mangle]
pub extern "C" fn mgc_alloc_array_rehash(ty: usize, count: usize, error_out: *mut usize) -> usize {
    with_ctx(|gc, ctx| gc.alloc_array_rehash(ctx, handle(ty)?, count), error_out)
}

/// Allocate a record that never moves and is never reclaimed
#[no_mangle]
pub extern "C" fn mgc_alloc_static(ty: usize, error_out: *mut usize) -> usize {
    let Some(gc) = gc() else { return 0 };
    match handle(ty).and_then(|ty| gc.alloc_static(ty)) {
        Ok(obj) => obj,
        Err(err) => allocation_failed(err, error_out),
    }
}

#[no_mangle]
pub extern "C" fn mgc_alloc_code(code_bytes: usize, ref_count: usize, error_out: *mut usize) -> usize {
    with_ctx(|gc, ctx| gc.alloc_code(ctx, code_bytes, ref_count), error_out)
}

// ----------------------------------------------------------------------
// Code blocks

#[no_mangle]
pub extern "C" fn mgc_code_size(obj: usize) -> usize {
    gc().and_then(|gc| gc.code_size(obj).ok()).unwrap_or(0)
}

/// Address of the first reference entry of a code block, 0 if not code
///
/// # Safety
///
/// `count_out` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn mgc_code_refs(obj: usize, count_out: *mut usize) -> usize {
    let Some((first, count)) = gc().and_then(|gc| gc.code_refs(obj).ok()) else {
        return 0;
    };
    if !count_out.is_null() {
        // SAFETY: forwarded from the caller.
        unsafe { *count_out = count };
    }
    first
}

/// Write every reference entry of a freshly emitted block into its code
#[no_mangle]
pub extern "C" fn mgc_patch_code(obj: usize) -> bool {
    let Some(gc) = gc() else { return false };
    report(gc.patch_code(obj).context("patch_code failed").map(|_| true))
}

// ----------------------------------------------------------------------
// Roots and collection

/// Register `count` words at `base` as a root region, returns a handle or 0
///
/// # Safety
///
/// The region must stay valid until `mgc_destroy_root`.
#[no_mangle]
pub unsafe extern "C" fn mgc_create_root(base: usize, count: usize, ambiguous: bool) -> u64 {
    let Some(gc) = gc() else { return 0 };
    // SAFETY: forwarded from the caller.
    let created = unsafe { gc.create_root(base, count, ambiguous) };
    report(created.map(RootHandle::to_raw).context("cannot create root"))
}

#[no_mangle]
pub extern "C" fn mgc_destroy_root(handle: u64) -> bool {
    let Some(gc) = gc() else { return false };
    report(
        gc.destroy_root(RootHandle::from_raw(handle))
            .context("cannot destroy root")
            .map(|_| true),
    )
}

#[no_mangle]
pub extern "C" fn mgc_collect() {
    if let Some(gc) = gc() {
        report(gc.collect().context("collection failed"));
    }
}

/// Do up to `budget_us` of incremental work, true if more remains
#[no_mangle]
pub extern "C" fn mgc_collect_step(budget_us: u64) -> bool {
    let Some(gc) = gc() else { return false };
    report(gc.collect_step(Duration::from_micros(budget_us)).context("collection step failed"))
}

// ----------------------------------------------------------------------
// Location watches

#[no_mangle]
pub extern "C" fn mgc_watch_new() -> *mut Watch {
    gc().map_or(std::ptr::null_mut(), |gc| Box::into_raw(Box::new(gc.create_watch())))
}

/// # Safety
///
/// `watch` must come from `mgc_watch_new` and not have been freed.
#[no_mangle]
pub unsafe extern "C" fn mgc_watch_add(watch: *mut Watch, addr: usize) {
    // SAFETY: see above.
    if let Some(watch) = unsafe { watch.as_mut() } {
        watch.add(addr);
    }
}

/// # Safety
///
/// As `mgc_watch_add`.
#[no_mangle]
pub unsafe extern "C" fn mgc_watch_moved(watch: *const Watch) -> bool {
    // SAFETY: see above.
    unsafe { watch.as_ref() }.is_some_and(|watch| watch.moved())
}

/// # Safety
///
/// As `mgc_watch_add`; `watch` is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn mgc_watch_free(watch: *mut Watch) {
    if !watch.is_null() {
        // SAFETY: the pointer was produced by `Box::into_raw`.
        drop(unsafe { Box::from_raw(watch) });
    }
}

// ----------------------------------------------------------------------
// Diagnostics

/// Write the heap summary as JSON into `buf`
///
/// Returns the full length of the JSON text; nothing is written when it
/// does not fit in `len` bytes.
///
/// # Safety
///
/// `buf` must be null or point to `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn mgc_summary_json(buf: *mut u8, len: usize) -> usize {
    let Some(gc) = gc() else { return 0 };
    let json = gc.summary().to_json();
    if !buf.is_null() && json.len() <= len {
        // SAFETY: forwarded from the caller, length checked above.
        unsafe { std::ptr::copy_nonoverlapping(json.as_ptr(), buf, json.len()) };
    }
    json.len()
}
