//! Core types for the commissioning fail-safe.
//!
//! The fail-safe is a synchronous state machine. It never sleeps and never
//! touches a clock: timers are requested through the [`TimerService`] trait
//! and everything the surrounding system must do in response to a
//! transition is returned as an [`Action`]. Timer firings and deferred work
//! come back in as [`Event`]s, always on the single context that owns the
//! state machine.

mod action;
mod cleanup;
mod event;
mod traits;

pub use action::Action;
pub use cleanup::{FailSafeCleanup, InvocationFlags, RollbackPlan};
pub use event::Event;
pub use traits::{FailSafeRollback, TimerError, TimerService};
