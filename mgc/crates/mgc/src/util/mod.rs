//! Util Module - Shared Utilities
//!
//! Utilities and helper functions used throughout MGC.

pub mod alignment;

pub use alignment::Alignment;

/// Constants for MGC
pub mod constants {
    /// Size of a pointer-sized slot in bytes
    pub const WORD: usize = std::mem::size_of::<usize>();

    /// Default alignment of every heap record: 8 bytes
    pub const DEFAULT_ALIGNMENT: usize = 8;

    /// Cache line size assumed when flushing patched code
    pub const CACHE_LINE: usize = 64;
}
