//! Command-level status codes crossing the coordinator/shard boundary.

/// Result alias for operations that fail with a command-level status.
pub type OpResult<T> = Result<T, OpStatus>;

/// Outcome of one command callback or coordinator operation.
///
/// Statuses are values, not unwinding errors: a shard callback translates its
/// own recoverable failures into a status and returns it across the hop
/// barrier. Anything a callback cannot express here is a programming error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpStatus {
    /// Operation completed.
    #[default]
    Ok,
    /// Argument vector shape is invalid for the command.
    SyntaxErr,
    /// A numeric argument failed to parse.
    InvalidInt,
    /// The callback could not allocate; surfaced after the hop barrier.
    OutOfMemory,
    /// A blocking wait expired before a wakeup arrived.
    TimedOut,
    /// The wait was interrupted by shutdown.
    Cancelled,
}

impl OpStatus {
    /// Returns whether this status is `Ok`.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}
