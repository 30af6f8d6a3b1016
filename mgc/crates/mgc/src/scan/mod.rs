//! Scan Module - backend-agnostic object and stack scanning
//!
//! The scanning functions know the record format but nothing about the
//! collector using them. What happens to each reference is decided by a
//! `Scanner`:
//!
//! 1. `fix1` is a cheap filter called for every pointer-shaped word. It must
//!    tolerate garbage and interior pointers.
//! 2. `fix2` is called for the words that passed the filter. It may rewrite
//!    the slot (the target moved) and may abort the walk with an error.
//!
//! The first error returned by `fix2` stops the walk and is returned to the
//! caller unchanged.
//!
//! Scanners are plain values constructed by the caller, so the state they
//! need lives on the caller's stack next to the loop that uses it.

pub mod stack;

pub use stack::{stacks, FrozenRange, Stack, StackSet};

use crate::code::CodeBlock;
use crate::object::format::{array_count, array_elements};
use crate::object::header::{base_of, client_of, header_at, record_kind, record_size, RecordKind};
use crate::object::types::{GcKind, TypeHandle, TypeTable};
use crate::util::constants::WORD;

/// How much of a formatted record a scanner wants visited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOption {
    /// Skip the record
    None,
    /// Only the type handle in the header
    Header,
    /// Header and every reference slot
    All,
}

/// Callbacks driving a scan
pub trait Scanner {
    /// Error aborting a walk
    type Error;

    /// Called before each formatted record (not for raw ranges)
    #[inline]
    fn object(&mut self, _client: usize, _size: usize) -> ScanOption {
        ScanOption::All
    }

    /// Cheap filter: should `fix2` look at this word?
    fn fix1(&mut self, word: usize) -> bool;

    /// Process a reference that passed `fix1`, rewriting it if it moved
    fn fix2(&mut self, slot: &mut usize) -> Result<(), Self::Error>;

    /// Filter for type handles found in headers and in `Type`-kind objects
    #[inline]
    fn fix_header1(&mut self, _ty: TypeHandle) -> bool {
        false
    }

    /// Process a type handle that passed `fix_header1`
    #[inline]
    fn fix_header2(&mut self, _ty: TypeHandle) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Whether weak array elements are visited by `object`
    #[inline]
    fn scan_weak(&self) -> bool {
        false
    }
}

#[inline]
fn fix12<S: Scanner>(s: &mut S, slot: &mut usize) -> Result<(), S::Error> {
    if s.fix1(*slot) {
        s.fix2(slot)
    } else {
        Ok(())
    }
}

#[inline]
fn fix_header<S: Scanner>(s: &mut S, raw: usize) -> Result<(), S::Error> {
    match TypeHandle::from_raw(raw) {
        Some(ty) if s.fix_header1(ty) => s.fix_header2(ty),
        _ => Ok(()),
    }
}

/// Scan an array of pointer-sized slots
pub fn array<S: Scanner>(s: &mut S, slots: &mut [usize]) -> Result<(), S::Error> {
    for slot in slots.iter_mut() {
        fix12(s, slot)?;
    }
    Ok(())
}

/// Scan the word-aligned raw range `[base, limit)`
///
/// # Safety
/// The range must be readable, writable if the scanner rewrites slots, and
/// not mutated concurrently.
pub unsafe fn range<S: Scanner>(s: &mut S, base: usize, limit: usize) -> Result<(), S::Error> {
    debug_assert!(base % WORD == 0 && limit % WORD == 0 && base <= limit);
    let mut at = base;
    while at < limit {
        fix12(s, &mut *(at as *mut usize))?;
        at += WORD;
    }
    Ok(())
}

/// Scan the formatted record whose client pointer is `client`
///
/// Pads and forwarding records have nothing to visit. Code blocks visit the
/// `pointer` payload of their traced reference entries, never the
/// instructions. Weak array elements are only visited when
/// `Scanner::scan_weak` asks for them.
///
/// # Safety
/// `client` must belong to a formatted record in a mapped chunk that no
/// mutator touches for the duration of the scan.
pub unsafe fn object<S: Scanner>(s: &mut S, client: usize, types: &TypeTable<'_>) -> Result<(), S::Error> {
    let base = base_of(client);
    let kind = record_kind(base);
    if matches!(kind, RecordKind::Pad | RecordKind::Forward) {
        return Ok(());
    }

    let option = s.object(client, record_size(base));
    if option == ScanOption::None {
        return Ok(());
    }

    if kind == RecordKind::Code {
        if option == ScanOption::All {
            let mut block = CodeBlock::from_client(client);
            for r in block.refs_mut() {
                if r.kind().is_traced() {
                    fix12(s, &mut r.pointer)?;
                }
            }
        }
        return Ok(());
    }

    let raw = header_at(base).type_raw();
    fix_header(s, raw)?;
    if option == ScanOption::Header {
        return Ok(());
    }

    let ty = match types.get(raw) {
        Some(ty) => ty,
        None => return Ok(()),
    };

    match ty.kind {
        GcKind::Fixed | GcKind::FixedObj => fields(s, client, &ty.offsets),
        GcKind::Type => {
            fix_header(s, *((client + ty.offsets[0]) as *const usize))?;
            fields(s, client, ty.reference_offsets())
        },
        GcKind::WeakArray if !s.scan_weak() => Ok(()),
        GcKind::Array | GcKind::WeakArray => {
            let mut element = array_elements(client);
            for _ in 0..array_count(client) {
                fields(s, element, &ty.offsets)?;
                element += ty.stride;
            }
            Ok(())
        },
        GcKind::Code => Ok(()),
    }
}

#[inline]
unsafe fn fields<S: Scanner>(s: &mut S, at: usize, offsets: &[usize]) -> Result<(), S::Error> {
    for &offset in offsets {
        fix12(s, &mut *((at + offset) as *mut usize))?;
    }
    Ok(())
}

/// Scan every formatted record in `[base, limit)`
///
/// # Safety
/// The range must be fully formatted (no open allocation buffer tails) and
/// satisfy the requirements of `object`.
pub unsafe fn objects<S: Scanner>(
    s: &mut S,
    base: usize,
    limit: usize,
    types: &TypeTable<'_>,
) -> Result<(), S::Error> {
    let mut at = base;
    while at < limit {
        let size = record_size(at);
        debug_assert!(size >= WORD, "corrupt record at {:#x}", at);
        object(s, client_of(at), types)?;
        at += size;
    }
    Ok(())
}
