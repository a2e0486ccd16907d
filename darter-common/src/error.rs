//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all infrastructure interfaces in darter.
pub type DarterResult<T> = Result<T, DarterError>;

/// High-level error categories for infrastructure surfaces.
///
/// Command-level outcomes do not travel through this enum; they are statuses
/// (`darter_core::status::OpStatus`) that cross the coordinator/shard boundary
/// by value instead of unwinding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DarterError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client payload is malformed or semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),
}
