//! The crate's single public error type.

use thiserror::Error;

/// Everything that can go wrong when building or driving the scheduler.
///
/// Callback failures are deliberately not a variant here: a callback that
/// panics is caught, logged, and swallowed inside the dispatcher so that one
/// broken sequence can't bring down the transport. See the transport's
/// dispatcher loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A `Note`, `Sequence`, or `InstrumentConfig` was constructed with an
    /// out-of-range or otherwise nonsensical field.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A lookup by sequence id or instrument name found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was attempted in a state that doesn't support it (for
    /// example, scheduling an event on a transport that isn't running).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A configuration value was out of its accepted range.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias for fallible calls returning [`SchedulerError`].
pub type Result<T> = std::result::Result<T, SchedulerError>;
