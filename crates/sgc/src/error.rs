//! Error Module - SGC Error Types
//!
//! Defines all error types used in SGC.
//!
//! # Error Categories
//!
//! ## Resource Exhaustion (recoverable)
//! - `OutOfMemory` - allocation failed even after a full collection
//!
//! ## Caller Misuse (recoverable, rejected at the call boundary)
//! - `InvalidArgument` - bad region parameters, invalid iterator use, bad layouts
//! - `InvalidState` - operation not valid in the current lifecycle state
//! - `ThreadNotRegistered` / `ThreadAlreadyRegistered`
//! - `Config` - invalid configuration
//!
//! ## Notifications
//! - `Interrupted` - a blocking operation was interrupted
//!
//! ## Fatal
//! - `HeapCorruption` - invalid reference or inconsistent header
//! - `VirtualMemory` - the OS layer refused a mapping operation
//! - `Internal` - a collector invariant was broken
//!
//! Fatal errors raised while the world is stopped never propagate: they are
//! handed to [`fatal`], which logs and aborts the process.

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all SGC operations
///
/// # Examples
///
/// ```rust
/// use sgc::error::SgcError;
///
/// fn handle_error(err: SgcError) {
///     match err {
///         SgcError::OutOfMemory { requested, available } => {
///             eprintln!("OOM: requested {}, available {}", requested, available);
///         }
///         other if other.is_fatal() => panic!("{}", other),
///         _ => {}
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum SgcError {
    /// Out of memory - heap exhaustion
    ///
    /// **When returned:** the allocation could not be satisfied by the active
    /// semispace even after one full collection and a retry.
    ///
    /// **Recovery strategy:** surface to managed code as an out-of-memory
    /// exception built from a pre-allocated instance.
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Bytes available
        available: usize,
    },

    /// Invalid argument passed to function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation called in the wrong lifecycle state
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Reference or header failed validation
    ///
    /// **When returned:** a reference below the minimum sane address, a
    /// reference outside the heap that is not stack-allocated, or an object
    /// whose class word does not describe a class.
    ///
    /// **Recovery strategy:** none, see [`fatal`].
    #[error("Heap corruption at {address:#x}: {reason}")]
    HeapCorruption {
        /// Offending address
        address: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Virtual memory operation failed
    #[error("Virtual memory error: {0}")]
    VirtualMemory(String),

    /// Calling thread is not attached to the runtime
    #[error("Current thread is not registered with the runtime")]
    ThreadNotRegistered,

    /// Calling thread is already attached to the runtime
    #[error("Current thread is already registered with the runtime")]
    ThreadAlreadyRegistered,

    /// Blocking operation interrupted
    #[error("Thread interrupted")]
    Interrupted,

    /// Configuration rejected by validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SgcError {
    /// Shorthand for a heap corruption error.
    pub fn corruption(address: usize, reason: impl Into<String>) -> Self {
        SgcError::HeapCorruption {
            address,
            reason: reason.into(),
        }
    }

    /// Check if the caller can reasonably continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SgcError::OutOfMemory { .. }
                | SgcError::Interrupted
                | SgcError::InvalidArgument(_)
                | SgcError::InvalidState { .. }
                | SgcError::ThreadNotRegistered
                | SgcError::ThreadAlreadyRegistered
                | SgcError::Config(_)
        )
    }

    /// Check if this error leaves no safe continuation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SgcError::HeapCorruption { .. } | SgcError::VirtualMemory(_) | SgcError::Internal(_)
        )
    }
}

/// Result type alias for SGC operations
pub type Result<T> = std::result::Result<T, SgcError>;

/// Log `err` and abort the process.
///
/// Used while the world is stopped: a corrupted graph or a failed remap
/// cannot be unwound, and resuming mutators would touch a half-moved heap.
#[cold]
pub fn fatal(err: SgcError) -> ! {
    log::error!("sgc: fatal: {}", err);
    std::process::abort()
}

/// Unwrap `result` or abort through [`fatal`].
pub(crate) trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for Result<T> {
    #[inline]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }
}
