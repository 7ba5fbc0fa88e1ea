//! Value types shared by the commissioning crates.
//!
//! Nothing in here owns state or performs I/O; these are the identifiers
//! that flow between the fail-safe state machine, its timer service and the
//! runners that host it.

mod identifiers;
mod timer;

pub use identifiers::FabricIndex;
pub use timer::{TimerHandle, TimerKind};
