//! Error types for the context runtime

use core::fmt;

/// Result type for runtime operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by the context runtime
///
/// `Interrupted` and `Terminated` are deliberately separate variants: a
/// caller that tolerates cooperative interruption must still propagate a
/// forced termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Cooperative cancellation observed at a suspension point
    Interrupted,

    /// Forced termination observed at a suspension point
    Terminated,

    /// A timed wait's deadline fired without a notification
    Timeout,

    /// Joined a context that can no longer signal its completion
    BrokenPromise,

    /// A current-context operation was called outside any context
    NotInContext,

    /// A reactor-thread-only operation was called from a foreign thread
    OffReactor,

    /// Invalid runtime configuration
    Config(&'static str),

    /// Stack allocation or protection failed
    Stack(StackError),
}

impl Error {
    /// True for `Interrupted` (and only `Interrupted`)
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }

    /// True for `Terminated`
    #[inline]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Error::Terminated)
    }

    /// True for either cancellation kind
    #[inline]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Interrupted | Error::Terminated)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Interrupted => write!(f, "context interrupted"),
            Error::Terminated => write!(f, "context terminated"),
            Error::Timeout => write!(f, "wait timed out"),
            Error::BrokenPromise => write!(f, "joined context cannot complete"),
            Error::NotInContext => write!(f, "not running inside a context"),
            Error::OffReactor => write!(f, "not on the reactor thread"),
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Stack(e) => write!(f, "stack error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Stack allocation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed
    AllocFailed,

    /// mprotect failed
    ProtectFailed,

    /// Requested size below the minimum usable stack
    TooSmall,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocFailed => write!(f, "stack allocation failed"),
            StackError::ProtectFailed => write!(f, "stack protection change failed"),
            StackError::TooSmall => write!(f, "requested stack too small"),
        }
    }
}

impl From<StackError> for Error {
    fn from(e: StackError) -> Self {
        Error::Stack(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Error::Interrupted), "context interrupted");
        assert_eq!(
            format!("{}", Error::Stack(StackError::AllocFailed)),
            "stack error: stack allocation failed"
        );
    }

    #[test]
    fn test_cancellation_kinds_distinct() {
        assert!(Error::Interrupted.is_interrupted());
        assert!(!Error::Terminated.is_interrupted());
        assert!(Error::Terminated.is_terminated());
        assert!(Error::Interrupted.is_cancellation());
        assert!(Error::Terminated.is_cancellation());
        assert!(!Error::Timeout.is_cancellation());
    }

    #[test]
    fn test_conversion() {
        let e: Error = StackError::TooSmall.into();
        assert!(matches!(e, Error::Stack(StackError::TooSmall)));
    }
}
