//! Test helpers for the commissioning crates.
//!
//! [`ManualTimers`] is a [`TimerService`] that never fires on its own. Tests
//! inspect what was scheduled and hand the firing back to the state machine
//! themselves, which keeps unit tests free of any clock.

use commission_core::{TimerError, TimerService};
use commission_types::{FabricIndex, TimerHandle, TimerKind};
use std::collections::BTreeMap;
use std::time::Duration;

/// Shorthand for a fabric index in tests.
pub fn fabric(index: u8) -> FabricIndex {
    FabricIndex(index)
}

/// A timer service driven entirely by the test.
#[derive(Debug, Default)]
pub struct ManualTimers {
    next_seq: u64,
    pending: BTreeMap<TimerHandle, Duration>,
    capacity: Option<usize>,
    scheduled_total: usize,
    canceled_total: usize,
}

impl ManualTimers {
    /// Create a timer service with unlimited capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a timer service that refuses to hold more than `capacity`
    /// outstanding timers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Change the capacity limit.
    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    /// The outstanding timer of the given kind, if exactly one exists.
    ///
    /// # Panics
    ///
    /// Panics if more than one timer of that kind is outstanding.
    pub fn pending_of(&self, kind: TimerKind) -> Option<TimerHandle> {
        let mut matching = self.pending.keys().filter(|h| h.kind == kind);
        let first = matching.next().copied();
        assert!(
            matching.next().is_none(),
            "more than one {} timer outstanding",
            kind.name()
        );
        first
    }

    /// Duration the given timer was scheduled with.
    pub fn duration_of(&self, handle: TimerHandle) -> Option<Duration> {
        self.pending.get(&handle).copied()
    }

    /// Check whether a timer is still outstanding.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    /// Number of outstanding timers.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remove a timer as if it had fired, returning its handle for delivery.
    ///
    /// # Panics
    ///
    /// Panics if no timer of that kind is outstanding.
    pub fn fire(&mut self, kind: TimerKind) -> TimerHandle {
        let handle = self
            .pending_of(kind)
            .unwrap_or_else(|| panic!("no {} timer outstanding", kind.name()));
        self.pending.remove(&handle);
        handle
    }

    /// Total successful `schedule` calls.
    pub fn scheduled_total(&self) -> usize {
        self.scheduled_total
    }

    /// Total `cancel` calls that removed an outstanding timer.
    pub fn canceled_total(&self) -> usize {
        self.canceled_total
    }
}

impl TimerService for ManualTimers {
    fn schedule(
        &mut self,
        kind: TimerKind,
        duration: Duration,
    ) -> Result<TimerHandle, TimerError> {
        if let Some(capacity) = self.capacity {
            if self.pending.len() >= capacity {
                return Err(TimerError::Exhausted { capacity });
            }
        }

        self.next_seq += 1;
        let handle = TimerHandle::new(kind, self.next_seq);
        self.pending.insert(handle, duration);
        self.scheduled_total += 1;
        Ok(handle)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if self.pending.remove(&handle).is_some() {
            self.canceled_total += 1;
        }
    }
}
