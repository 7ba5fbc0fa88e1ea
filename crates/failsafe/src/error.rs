//! Error types for the fail-safe.

use commission_core::TimerError;
use thiserror::Error;

/// Recoverable fail-safe errors.
///
/// Contract violations (fabric-scoped queries while not armed) are not
/// represented here; they panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailSafeError {
    /// The operation is not allowed in the current state.
    #[error("Invalid fail-safe state: {0}")]
    InvalidState(String),

    /// The timer service could not schedule a fail-safe timer.
    #[error("Fail-safe timer could not be scheduled: {0}")]
    ResourceExhausted(#[from] TimerError),

    /// Configuration limits are incoherent.
    #[error("Invalid fail-safe configuration: {0}")]
    InvalidConfig(String),
}
