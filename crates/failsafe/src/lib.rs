//! Commissioning fail-safe state machine.
//!
//! This crate provides the synchronous fail-safe that supervises a
//! provisioning window on a device being commissioned onto a fabric.
//!
//! # Architecture
//!
//! ```text
//!            arm_fail_safe                 TimerFired (step or cumulative)
//!  Disarmed ───────────────▶ Armed ─────────────────────────────▶ Busy
//!     ▲                        │  ▲                                 │
//!     │   disarm_fail_safe     │  │ arm_fail_safe (re-arm)          │
//!     └────────────────────────┘  └──────                           │
//!     ▲                                                             │
//!     └──────────────────────── CleanupCompleted ◀──────────────────┘
//! ```
//!
//! - `arm_fail_safe` → schedule the step timer (and the cumulative ceiling
//!   if none is running)
//! - `Event::TimerFired` → enter `Busy`, emit `Action::RollbackFailSafe`,
//!   enqueue `Event::CleanupCompleted` behind it
//! - `Event::CleanupCompleted` → reset to `Disarmed`
//! - `disarm_fail_safe` → reset to `Disarmed` synchronously (commit path)
//!
//! All I/O is performed by the runner via returned `Action`s.

mod commissioning;
mod config;
mod error;
mod state;

pub use commissioning::{CommissioningError, CompletedWindow, GeneralCommissioning};
pub use config::FailSafeConfig;
pub use error::FailSafeError;
pub use state::{FailSafeContext, FailSafeStatus};
