//! Error Module - MGC Error Types
//!
//! Defines all error types used in MGC.
//!
//! # Error Categories
//!
//! ## Allocation Errors
//! - `OutOfMemory` - No backend could satisfy the request
//! - `AllocationTooLarge` - Size computation overflowed
//! - `VirtualMemory` - Mapping a chunk from the OS failed
//!
//! ## Usage Errors
//! - `Usage` - Caller broke a contract (double root, wrong size class)
//! - `NotAttached` - Allocation from a thread without a `ThreadContext`
//!
//! ## Internal Errors
//! - `Backend` - A collector backend reported failure
//! - `Internal` - Invariant violation inside MGC
//! - `Config` - Invalid configuration

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all MGC operations
///
/// # Examples
///
/// ```rust
/// use mgc::error::GcError;
///
/// fn handle_error(err: GcError) {
///     match err {
///         GcError::OutOfMemory { requested, error_object } => {
///             eprintln!("OOM: requested {}, error object {:?}", requested, error_object);
///         }
///         GcError::AllocationTooLarge { what } => {
///             eprintln!("too large: {}", what);
///         }
///         _ => {
///             eprintln!("Other error: {}", err);
///         }
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum GcError {
    /// Out of memory - no pool could satisfy the request
    ///
    /// **When returned:** A reservation failed even after a full collection
    ///
    /// **Recovery strategy:** `error_object` carries a managed error object
    /// allocated from the non-moving reserve when the reflection layer has
    /// registered one. Throw it as a regular managed error. If it is `None`
    /// the reserve is exhausted too and the process should abort.
    #[error("Out of memory: requested {requested} bytes")]
    OutOfMemory {
        requested: usize,
        error_object: Option<usize>,
    },

    /// Allocation too large for the address space
    ///
    /// **When returned:** Size computation for `what` overflowed
    ///
    /// **Recovery strategy:** Report to the caller, never retried
    #[error("Allocation too large for system ({what})")]
    AllocationTooLarge { what: &'static str },

    /// Caller broke a usage contract
    ///
    /// **When returned:** Double root registration, unknown root handle,
    /// `switch_type` across size classes, querying a non-code block as code
    ///
    /// **Recovery strategy:** None - fix the caller
    #[error("Usage error: {0}")]
    Usage(String),

    /// Allocation from a thread not attached to this collector
    ///
    /// **When returned:** `ThreadContext::current` found no record, or the
    /// context belongs to a different collector instance
    #[error("Trying to allocate memory from a thread not registered with the GC")]
    NotAttached,

    /// Virtual memory error
    ///
    /// **When returned:** Mapping a heap chunk failed
    ///
    /// **Recovery strategy:** Collect and retry, else report `OutOfMemory`
    #[error("Virtual memory error: {0}")]
    VirtualMemory(String),

    /// Backend reported a non-success status
    ///
    /// **When returned:** A collector backend could not complete an operation
    ///
    /// **Recovery strategy:** Translated to the same path as `OutOfMemory`
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal error - indicates a bug in MGC
    ///
    /// **When returned:** Invariant violation or unexpected heap state
    ///
    /// **Action required:** Report with the heap summary attached
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GcError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GcError::OutOfMemory { .. } | GcError::AllocationTooLarge { .. } | GcError::Backend(_)
        )
    }

    /// Check if this error indicates a bug in the caller or in MGC
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            GcError::Usage(_) | GcError::NotAttached | GcError::Internal(_)
        )
    }

    /// Managed error object carried by an out-of-memory failure, if any
    pub fn error_object(&self) -> Option<usize> {
        match self {
            GcError::OutOfMemory { error_object, .. } => *error_object,
            _ => None,
        }
    }

    /// Fold a failure to map memory into `OutOfMemory` for `requested` bytes
    ///
    /// Other errors are returned unchanged.
    pub fn out_of_memory(self, requested: usize) -> GcError {
        match self {
            GcError::VirtualMemory(_) | GcError::Backend(_) => {
                log::warn!("reserving {} bytes failed: {}", requested, self);
                GcError::OutOfMemory {
                    requested,
                    error_object: None,
                }
            },
            other => other,
        }
    }
}

/// Result type alias for MGC operations
pub type Result<T> = std::result::Result<T, GcError>;

/// Return early with an error
#[macro_export]
macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

/// Ensure condition is true, otherwise return error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let oom = GcError::OutOfMemory {
            requested: 64,
            error_object: Some(0x1000),
        };
        assert!(oom.is_recoverable());
        assert!(!oom.is_bug());
        assert_eq!(oom.error_object(), Some(0x1000));

        let usage = GcError::Usage("root registered twice".to_string());
        assert!(usage.is_bug());
        assert!(!usage.is_recoverable());
        assert_eq!(usage.error_object(), None);
    }

    #[test]
    fn test_display() {
        let err = GcError::AllocationTooLarge { what: "allocArray" };
        assert_eq!(err.to_string(), "Allocation too large for system (allocArray)");
    }

    #[test]
    fn test_mapping_failures_become_out_of_memory() {
        let err = GcError::VirtualMemory("mmap: Cannot allocate memory".to_string()).out_of_memory(4096);
        assert!(matches!(
            err,
            GcError::OutOfMemory {
                requested: 4096,
                error_object: None
            }
        ));
        assert!(matches!(GcError::Backend("pool".to_string()).out_of_memory(8), GcError::OutOfMemory { .. }));
        assert!(matches!(GcError::NotAttached.out_of_memory(8), GcError::NotAttached));
    }

    fn checked(flag: bool) -> Result<u32> {
        ensure!(flag, GcError::Internal("flag".to_string()));
        Ok(1)
    }

    #[test]
    fn test_ensure_macro() {
        assert!(checked(true).is_ok());
        assert!(matches!(checked(false), Err(GcError::Internal(_))));
    }
}
