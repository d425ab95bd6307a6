//! Errors surfaced by dispatch lifecycle operations.
use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

/// The result of a lifecycle operation (shutdown, flush, or a blocking wait).
pub type DispatchResult = Result<(), DispatchError>;

/// Errors reported through [`CompletionHandle`]s and blocking waits.
///
/// The type is `Clone` because a single outcome may be observed through any
/// number of handle clones and completion callbacks.
///
/// [`CompletionHandle`]: crate::CompletionHandle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DispatchError {
    /// A span processor reported failure during shutdown or flush.
    #[error("span processor failed: {0}")]
    ProcessorFailure(String),

    /// A blocking wait elapsed before the operation completed.
    #[error("operation did not complete within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    /// Other types of failures not covered by the variants above.
    Other(String),
}

impl<T> From<PoisonError<T>> for DispatchError {
    fn from(err: PoisonError<T>) -> Self {
        DispatchError::Other(err.to_string())
    }
}
