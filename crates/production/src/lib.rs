//! Production runner for the commissioning fail-safe.
//!
//! A single tokio task owns the [`FailSafeContext`](commission_failsafe::FailSafeContext).
//! Everything that touches it arrives as a message on one channel:
//!
//! - commands from [`FailSafeHandle`]s, answered over oneshot channels
//! - timer firings, posted by the sleep tasks of [`TokioTimers`]
//! - deferred work the fail-safe enqueues for itself
//!
//! Serializing all three through the channel is what gives the fail-safe its
//! single-context guarantees: a command queued behind an expiry observes
//! `Busy`, and the reset that follows a rollback is processed after every
//! command that was already waiting.

mod error;
mod handle;
mod runner;
mod timers;

pub use error::RunnerError;
pub use handle::{FailSafeHandle, FailSafeSnapshot, Latch};
pub use runner::{FailSafeRunner, RunnerConfig};
pub use timers::TokioTimers;
