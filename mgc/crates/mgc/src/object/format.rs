//! Object Format - sizing and initialization of heap records
//!
//! Every allocation path goes through the `size_*` functions, which are
//! checked: an overflowing size computation yields `None` and the caller
//! reports `AllocationTooLarge`. A zero-byte "success" is never produced.
//!
//! Array records carry two prefix words between the header and the elements:
//!
//! ```text
//! header (24) │ count │ filled / splatted │ element 0 │ element 1 │ ...
//! ```
//!
//! For weak arrays the second word counts the references the collector
//! nulled because their target died.

use super::header::{write_code, write_object, HEADER_SIZE, OBJECT_ALIGNMENT};
use super::types::GcType;
use crate::code::{table_offset, GcCode, CODE_REF_SIZE, CODE_TABLE_HEADER};
use crate::util::constants::WORD;
use crate::util::Alignment;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes of array prefix (`count` and `filled`) after the header
pub const ARRAY_PREFIX: usize = 2 * WORD;

/// Distance from the record start to the first array element
pub const ARRAY_HEADER_SIZE: usize = HEADER_SIZE + ARRAY_PREFIX;

/// Record size of a fixed object of type `ty`
#[inline]
pub fn size_obj(ty: &GcType) -> Option<usize> {
    HEADER_SIZE
        .checked_add(ty.stride)
        .and_then(|size| Alignment::checked_align_up(size, OBJECT_ALIGNMENT))
}

/// Record size of an array of `count` elements of type `ty`
#[inline]
pub fn size_array(ty: &GcType, count: usize) -> Option<usize> {
    ty.stride
        .checked_mul(count)
        .and_then(|body| body.checked_add(ARRAY_HEADER_SIZE))
        .and_then(|size| Alignment::checked_align_up(size, OBJECT_ALIGNMENT))
}

/// Record size of a code block with `code_bytes` of instructions and
/// `ref_count` reference entries
#[inline]
pub fn size_code(code_bytes: usize, ref_count: usize) -> Option<usize> {
    let code = Alignment::checked_align_up(code_bytes, WORD)?;
    let refs = ref_count.checked_mul(CODE_REF_SIZE)?;
    HEADER_SIZE
        .checked_add(code)?
        .checked_add(CODE_TABLE_HEADER)?
        .checked_add(refs)
}

/// Number of elements of the array at `client`
///
/// # Safety
/// `client` must be a live array or weak array.
#[inline]
pub unsafe fn array_count(client: usize) -> usize {
    *(client as *const usize)
}

/// Address of the first element of the array at `client`
#[inline]
pub fn array_elements(client: usize) -> usize {
    client + ARRAY_PREFIX
}

/// The `filled` word of an array, maintained by the array's owner
///
/// # Safety
/// `client` must be a live array.
#[inline]
pub unsafe fn array_filled<'a>(client: usize) -> &'a AtomicUsize {
    &*((client + WORD) as *const AtomicUsize)
}

/// Number of references the collector nulled in the weak array at `client`
///
/// # Safety
/// `client` must be a live weak array.
#[inline]
pub unsafe fn weak_splatted(client: usize) -> usize {
    array_filled(client).load(Ordering::Acquire)
}

/// Record one more nulled reference in the weak array at `client`
///
/// # Safety
/// `client` must be a live weak array.
#[inline]
pub(crate) unsafe fn weak_splat(client: usize) {
    array_filled(client).fetch_add(1, Ordering::AcqRel);
}

/// Format a fixed object at `base`, zeroing its body
///
/// # Safety
/// `[base, base + size)` must be writable memory owned by the caller.
pub unsafe fn init_object(base: usize, type_raw: usize, size: usize) -> usize {
    std::ptr::write_bytes((base + HEADER_SIZE) as *mut u8, 0, size - HEADER_SIZE);
    write_object(base, type_raw, size);
    base + HEADER_SIZE
}

/// Format an array of `count` elements at `base`
///
/// # Safety
/// As `init_object`.
pub unsafe fn init_array(base: usize, type_raw: usize, size: usize, count: usize) -> usize {
    let client = init_object(base, type_raw, size);
    *(client as *mut usize) = count;
    client
}

/// Format a weak array of `count` elements at `base`, splat count zero
///
/// # Safety
/// As `init_object`.
pub unsafe fn init_weak_array(base: usize, type_raw: usize, size: usize, count: usize) -> usize {
    init_array(base, type_raw, size, count)
}

/// Format a code block at `base`
///
/// The instruction bytes are zeroed and every reference entry reads as
/// `Disabled` until the emitter fills it in.
///
/// # Safety
/// As `init_object`.
pub unsafe fn init_code(base: usize, code_bytes: usize, ref_count: usize, size: usize) -> usize {
    let client = base + HEADER_SIZE;
    std::ptr::write_bytes(client as *mut u8, 0, size - HEADER_SIZE);
    write_code(base, code_bytes, size);
    std::ptr::write(
        (client + table_offset(code_bytes)) as *mut GcCode,
        GcCode {
            ref_count,
            reserved: client,
        },
    );
    client
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::header::{record_size, RecordKind};
    use crate::code::CodeBlock;

    #[test]
    fn test_array_size_scenario() {
        let ty = GcType::array(8);
        assert_eq!(size_array(&ty, 100), Some(ARRAY_HEADER_SIZE + 800));
    }

    #[test]
    fn test_sizes_are_checked() {
        let ty = GcType::array(16);
        assert_eq!(size_array(&ty, usize::MAX / 8), None);
        assert_eq!(size_code(usize::MAX - 3, 0), None);
        assert_eq!(size_code(0, usize::MAX / 8), None);
        assert_eq!(size_obj(&GcType::fixed(usize::MAX)), None);
    }

    #[test]
    fn test_fixed_size_is_aligned() {
        assert_eq!(size_obj(&GcType::fixed(13)), Some(HEADER_SIZE + 16));
        assert_eq!(size_obj(&GcType::fixed(0)), Some(HEADER_SIZE));
    }

    #[test]
    fn test_init_code_layout() {
        let size = size_code(13, 2).unwrap();
        let mut mem = vec![0xffusize; size / WORD];
        let base = mem.as_mut_ptr() as usize;
        unsafe {
            let client = init_code(base, 13, 2, size);
            assert_eq!(record_size(base), size);
            let block = CodeBlock::from_client(client);
            assert_eq!(block.code_size(), 13);
            assert_eq!(block.ref_count(), 2);
            assert_eq!(block.replayed_at(), client);
            assert!(block.refs().iter().all(|r| r.kind() == crate::code::RefKind::Disabled));
            assert_eq!(crate::object::header::record_kind(base), RecordKind::Code);
        }
    }

    #[test]
    fn test_init_weak_array() {
        let ty = GcType::weak_array();
        let size = size_array(&ty, 4).unwrap();
        let mut mem = vec![0x5usize; size / WORD];
        let base = mem.as_mut_ptr() as usize;
        unsafe {
            let client = init_weak_array(base, 1, size, 4);
            assert_eq!(array_count(client), 4);
            assert_eq!(weak_splatted(client), 0);
            weak_splat(client);
            assert_eq!(weak_splatted(client), 1);
            assert_eq!(*(array_elements(client) as *const usize), 0);
        }
    }
}
