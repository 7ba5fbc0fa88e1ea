//! Deterministic simulation runner.
//!
//! This crate hosts the fail-safe in a fully deterministic environment:
//! virtual time, an ordered event queue and an in-memory fabric table. The
//! same sequence of calls always produces the same transitions, which makes
//! timing scenarios (re-arms, cumulative ceilings, expiry during rollback)
//! testable without a clock.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SimulationRunner                       │
//! │                                                         │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Event Queue (BTreeMap<EventKey, Event>)        │ │
//! │  │     Ordered by: time, priority, sequence           │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     FailSafeContext::handle(event)                 │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Actions → rollback collaborators, new events   │ │
//! │  └────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod event_queue;
mod fabric_table;
mod runner;

pub use event_queue::{EventKey, EventPriority, SimScheduler};
pub use fabric_table::SimFabricTable;
pub use runner::{SimulationRunner, SimulationStats};
