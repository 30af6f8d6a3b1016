//! Object Header - Metadata preceding every heap record
//!
//! Record Layout (24 bytes of header on 64-bit):
//! ┌─────────────────────────────────────────┐
//! │         Flags (8 bytes)                 │  <- AtomicUsize
//! │  - Bits 0-1: Record tag                 │
//! │      0 object, 1 forward, 2 pad, 3 code │
//! │  - Bit 2: Has finalizer                 │
//! │  - Bit 3: Finalized                     │
//! │  - Bit 4: Marked (in-place survivors)   │
//! │  - Bits 8-63: Size (pad records only)   │
//! ├─────────────────────────────────────────┤
//! │         Word (8 bytes)                  │  <- AtomicUsize
//! │  - object: TypeHandle                   │
//! │  - forward: new client address         │
//! │  - code: instruction byte count         │
//! ├─────────────────────────────────────────┤
//! │         Size (8 bytes)                  │  <- Record size incl. header
//! └─────────────────────────────────────────┘
//!
//! Pad records fill gaps of any word multiple, so they only own the flags
//! word and keep their size in its upper bits. The client pointer handed out
//! by the allocator is the first byte after the header.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of object header in bytes
pub const HEADER_SIZE: usize = 24;

/// Minimum object alignment (bytes)
pub const OBJECT_ALIGNMENT: usize = 8;

/// Record tag values
pub const TAG_MASK: usize = 0b11;
pub const TAG_OBJECT: usize = 0;
pub const TAG_FORWARD: usize = 1;
pub const TAG_PAD: usize = 2;
pub const TAG_CODE: usize = 3;

/// Flag bits
pub const HAS_FINALIZER_MASK: usize = 1 << 2;
pub const FINALIZED_MASK: usize = 1 << 3;
pub const MARKED_MASK: usize = 1 << 4;

/// Pad records keep their size above this shift
pub const PAD_SHIFT: usize = 8;

/// What a heap record currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Regular object, array or weak array
    Object,
    /// Object that moved; `word` holds the new client address
    Forward,
    /// Unused gap
    Pad,
    /// JIT code block with a trailing reference table
    Code,
}

/// Object Header
#[repr(C)]
pub struct ObjectHeader {
    /// Tag and flag bits
    pub flags: AtomicUsize,
    /// Type handle, forwarding address or code size depending on the tag
    pub word: AtomicUsize,
    /// Record size in bytes (including header)
    pub size: usize,
}

impl ObjectHeader {
    /// Tag of this record
    #[inline]
    pub fn kind(&self) -> RecordKind {
        match self.flags.load(Ordering::Acquire) & TAG_MASK {
            TAG_OBJECT => RecordKind::Object,
            TAG_FORWARD => RecordKind::Forward,
            TAG_PAD => RecordKind::Pad,
            _ => RecordKind::Code,
        }
    }

    /// Check if the allocation was registered for finalization
    #[inline]
    pub fn has_finalizer(&self) -> bool {
        self.flags.load(Ordering::Acquire) & HAS_FINALIZER_MASK != 0
    }

    #[inline]
    pub fn set_has_finalizer(&self) {
        self.flags.fetch_or(HAS_FINALIZER_MASK, Ordering::AcqRel);
    }

    /// Check if the finalizer has started running
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FINALIZED_MASK != 0
    }

    /// Mark as finalized
    /// Returns true if it was already finalized
    #[inline]
    pub fn set_finalized(&self) -> bool {
        self.flags.fetch_or(FINALIZED_MASK, Ordering::AcqRel) & FINALIZED_MASK != 0
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags.load(Ordering::Acquire) & MARKED_MASK != 0
    }

    /// Set the mark bit
    /// Returns true if bit was already set
    #[inline]
    pub fn set_marked(&self) -> bool {
        self.flags.fetch_or(MARKED_MASK, Ordering::AcqRel) & MARKED_MASK != 0
    }

    #[inline]
    pub fn clear_mark(&self) {
        self.flags.fetch_and(!MARKED_MASK, Ordering::AcqRel);
    }

    /// Raw type handle of an object record
    #[inline]
    pub fn type_raw(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }

    /// Replace the type handle of an object record in place
    #[inline]
    pub fn set_type_raw(&self, raw: usize) {
        self.word.store(raw, Ordering::Release);
    }

    /// New client address of a forwarding record
    #[inline]
    pub fn forward_target(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }

    /// Instruction byte count of a code record
    #[inline]
    pub fn code_size(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }
}

/// Header of the record starting at `base`
///
/// # Safety
/// `base` must be the start of a non-pad record inside a mapped chunk.
#[inline]
pub unsafe fn header_at<'a>(base: usize) -> &'a ObjectHeader {
    &*(base as *const ObjectHeader)
}

/// Client pointer of the record starting at `base`
#[inline]
pub fn client_of(base: usize) -> usize {
    base + HEADER_SIZE
}

/// Record start of the client pointer `client`
#[inline]
pub fn base_of(client: usize) -> usize {
    client - HEADER_SIZE
}

/// Tag of the record starting at `base`
///
/// # Safety
/// `base` must be the start of a record inside a formatted chunk area.
#[inline]
pub unsafe fn record_kind(base: usize) -> RecordKind {
    let flags = &*(base as *const AtomicUsize);
    match flags.load(Ordering::Acquire) & TAG_MASK {
        TAG_OBJECT => RecordKind::Object,
        TAG_FORWARD => RecordKind::Forward,
        TAG_PAD => RecordKind::Pad,
        _ => RecordKind::Code,
    }
}

/// Size of the record starting at `base`, pad records included
///
/// # Safety
/// `base` must be the start of a record inside a formatted chunk area.
#[inline]
pub unsafe fn record_size(base: usize) -> usize {
    let flags = (*(base as *const AtomicUsize)).load(Ordering::Acquire);
    if flags & TAG_MASK == TAG_PAD {
        flags >> PAD_SHIFT
    } else {
        (*(base as *const ObjectHeader)).size
    }
}

/// Format an object record header
///
/// # Safety
/// `[base, base + size)` must be writable memory owned by the caller.
#[inline]
pub unsafe fn write_object(base: usize, type_raw: usize, size: usize) {
    std::ptr::write(
        base as *mut ObjectHeader,
        ObjectHeader {
            flags: AtomicUsize::new(TAG_OBJECT),
            word: AtomicUsize::new(type_raw),
            size,
        },
    );
}

/// Format a code record header
///
/// # Safety
/// `[base, base + size)` must be writable memory owned by the caller.
#[inline]
pub unsafe fn write_code(base: usize, code_bytes: usize, size: usize) {
    std::ptr::write(
        base as *mut ObjectHeader,
        ObjectHeader {
            flags: AtomicUsize::new(TAG_CODE),
            word: AtomicUsize::new(code_bytes),
            size,
        },
    );
}

/// Turn `[base, base + size)` into a pad record
///
/// # Safety
/// `size` must be a non-zero word multiple and the range writable.
#[inline]
pub unsafe fn write_pad(base: usize, size: usize) {
    debug_assert!(size >= OBJECT_ALIGNMENT && size % OBJECT_ALIGNMENT == 0);
    (*(base as *const AtomicUsize)).store(TAG_PAD | (size << PAD_SHIFT), Ordering::Release);
}

/// Turn the record at `base` into a forwarding record to `to_client`
///
/// The size word is kept so heap walks can still step over the record.
///
/// # Safety
/// `base` must start an object or code record.
#[inline]
pub unsafe fn write_forward(base: usize, to_client: usize) {
    let header = header_at(base);
    header.word.store(to_client, Ordering::Release);
    header.flags.store(TAG_FORWARD, Ordering::Release);
}
