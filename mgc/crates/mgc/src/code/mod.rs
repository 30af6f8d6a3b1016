//! Code Module - JIT code blocks and their reference tables
//!
//! A code block is a heap record holding raw machine instructions followed
//! by a `GcCode` table describing every pointer embedded in the
//! instructions:
//!
//! ```text
//! ┌────────────┬──────────────────────┬─────────────────────────────────┐
//! │ header     │ instructions (padded │ GcCode { ref_count, reserved }  │
//! │ tag = code │ to a word)           │ GcCodeRef[ref_count]            │
//! └────────────┴──────────────────────┴─────────────────────────────────┘
//! ```
//!
//! The collector never scans the instructions. It scans the `pointer`
//! payload of each reference entry, and after the block or any of its
//! targets moved it replays the table into the instruction stream (see
//! `patch::update_ptrs`). `reserved` remembers the block address the table
//! was last replayed for, which is how a move of the block itself is
//! detected.

pub mod patch;
pub mod table;

pub use patch::{finalize, update_ptrs};
pub use table::{CodeTable, CodeTables, UnwindRecord, UnwindTable};

use crate::object::header::{header_at, RecordKind, HEADER_SIZE};
use crate::util::constants::WORD;
use crate::util::Alignment;

/// How one embedded pointer is written into the instruction stream
///
/// Stored raw in `GcCodeRef::kind`, since emitters fill tables in directly.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Ignored entry
    Disabled = 0,
    /// Keeps `pointer` alive, never written into the code
    Stored = 1,
    /// Full pointer-sized write of `pointer`
    Absolute = 2,
    /// `pointer` relative to the end of the written field
    Relative = 3,
    /// `pointer` is an offset into this block, written as an absolute address
    Inside = 4,
    /// 32-bit distance from the end of the field to this entry's `pointer` slot
    RelativeHere = 5,
    /// `pointer` is a handle in the code identity table
    CodeInfo = 6,
    /// `pointer` is a handle in the unwind record table
    UnwindInfo = 7,
}

impl RefKind {
    /// Entries whose `pointer` is a heap reference the collector must trace
    #[inline]
    pub fn is_traced(self) -> bool {
        matches!(
            self,
            RefKind::Stored | RefKind::Absolute | RefKind::Relative | RefKind::RelativeHere
        )
    }

    /// Entries whose `pointer` indexes an external side table
    #[inline]
    pub fn is_external(self) -> bool {
        matches!(self, RefKind::CodeInfo | RefKind::UnwindInfo)
    }

    /// Width in bytes of the field written into the code
    #[inline]
    pub fn width(self) -> usize {
        match self {
            RefKind::RelativeHere => 4,
            RefKind::Absolute | RefKind::Relative | RefKind::Inside => WORD,
            _ => 0,
        }
    }
}

impl TryFrom<u32> for RefKind {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => RefKind::Disabled,
            1 => RefKind::Stored,
            2 => RefKind::Absolute,
            3 => RefKind::Relative,
            4 => RefKind::Inside,
            5 => RefKind::RelativeHere,
            6 => RefKind::CodeInfo,
            7 => RefKind::UnwindInfo,
            other => return Err(other),
        })
    }
}

/// One entry of a code block's reference table
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcCodeRef {
    /// Byte offset of the field inside the instructions
    pub offset: u32,
    /// How the field is written, a raw `RefKind`
    pub kind: u32,
    /// Target object, block offset or side-table handle depending on `kind`
    pub pointer: usize,
}

impl GcCodeRef {
    pub fn new(offset: u32, kind: RefKind, pointer: usize) -> Self {
        Self {
            offset,
            kind: kind as u32,
            pointer,
        }
    }

    /// Decoded kind; values outside `RefKind` act as `Disabled`
    pub fn kind(&self) -> RefKind {
        RefKind::try_from(self.kind).unwrap_or_else(|raw| {
            log::warn!("ignoring code reference at offset {} with unknown kind {}", self.offset, raw);
            RefKind::Disabled
        })
    }

    /// First instruction byte past the field this entry writes
    #[inline]
    pub fn field_end(&self) -> usize {
        self.offset as usize + self.kind().width()
    }
}

/// Reference table header trailing the instructions
#[repr(C)]
#[derive(Debug)]
pub struct GcCode {
    /// Number of `GcCodeRef` entries that follow
    pub ref_count: usize,
    /// Block address the table was last replayed for
    pub reserved: usize,
}

/// Size of the `GcCode` table header
pub const CODE_TABLE_HEADER: usize = std::mem::size_of::<GcCode>();

/// Size of one `GcCodeRef`
pub const CODE_REF_SIZE: usize = std::mem::size_of::<GcCodeRef>();

/// Offset of the reference table from the client pointer
#[inline]
pub fn table_offset(code_bytes: usize) -> usize {
    Alignment::align_up(code_bytes, WORD)
}

/// View of a code block in the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlock {
    client: usize,
}

impl CodeBlock {
    /// View the code block at `client`
    ///
    /// # Safety
    /// `client` must be the client address of a live code record. The view
    /// is only valid until the next collection, which may move the block.
    pub unsafe fn from_client(client: usize) -> Self {
        debug_assert_eq!(
            header_at(client - HEADER_SIZE).kind(),
            RecordKind::Code,
            "not a code block"
        );
        Self { client }
    }

    /// Client address of the block (start of the instructions)
    #[inline]
    pub fn address(&self) -> usize {
        self.client
    }

    /// Number of instruction bytes
    #[inline]
    pub fn code_size(&self) -> usize {
        // SAFETY: guaranteed by `from_client`.
        unsafe { header_at(self.client - HEADER_SIZE).code_size() }
    }

    /// Address of the `GcCode` table
    #[inline]
    pub fn table_addr(&self) -> usize {
        self.client + table_offset(self.code_size())
    }

    /// The reference table header
    #[inline]
    pub fn table(&self) -> &GcCode {
        // SAFETY: the table lies inside the record described by `from_client`.
        unsafe { &*(self.table_addr() as *const GcCode) }
    }

    #[inline]
    fn table_mut(&mut self) -> &mut GcCode {
        // SAFETY: as `table`.
        unsafe { &mut *(self.table_addr() as *mut GcCode) }
    }

    /// Number of reference entries
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.table().ref_count
    }

    /// Block address the table was last replayed for
    #[inline]
    pub fn replayed_at(&self) -> usize {
        self.table().reserved
    }

    pub(crate) fn set_replayed_at(&mut self, client: usize) {
        self.table_mut().reserved = client;
    }

    /// The reference entries
    pub fn refs(&self) -> &[GcCodeRef] {
        let first = (self.table_addr() + CODE_TABLE_HEADER) as *const GcCodeRef;
        // SAFETY: `ref_count` entries were reserved by `alloc_code`, and
        // zeroed memory is a valid `Disabled` entry.
        unsafe { std::slice::from_raw_parts(first, self.ref_count()) }
    }

    /// The reference entries, for the code emitter to fill in
    pub fn refs_mut(&mut self) -> &mut [GcCodeRef] {
        let first = (self.table_addr() + CODE_TABLE_HEADER) as *mut GcCodeRef;
        // SAFETY: as `refs`.
        unsafe { std::slice::from_raw_parts_mut(first, self.ref_count()) }
    }

    /// The instruction bytes
    pub fn code(&self) -> &[u8] {
        // SAFETY: `code_size` bytes follow the header.
        unsafe { std::slice::from_raw_parts(self.client as *const u8, self.code_size()) }
    }

    /// The instruction bytes, for the code emitter to fill in
    pub fn code_mut(&mut self) -> &mut [u8] {
        // SAFETY: as `code`.
        unsafe { std::slice::from_raw_parts_mut(self.client as *mut u8, self.code_size()) }
    }
}
