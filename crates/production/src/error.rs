//! Error types for the production runner.

use commission_failsafe::CommissioningError;
use thiserror::Error;

/// Errors returned to [`FailSafeHandle`](crate::FailSafeHandle) callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    /// The runner task has stopped.
    #[error("Fail-safe runner has shut down")]
    Closed,

    /// The command was rejected.
    #[error(transparent)]
    Commissioning(#[from] CommissioningError),
}
