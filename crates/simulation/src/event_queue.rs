//! Ordered event queue and simulated timer service.

use commission_core::{Event, TimerError, TimerService};
use commission_types::{TimerHandle, TimerKind};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::trace;

/// Processing priority among events due at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    /// Timer firings.
    Timer = 0,
    /// Deferred work enqueued by the state machine.
    Internal = 1,
}

/// Key for ordering events in the simulation queue.
///
/// Events are ordered by time first, then priority, then insertion sequence,
/// so two runs with the same inputs process events in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    /// When the event is due.
    pub time: Duration,
    /// Tie-breaker between events due at the same time.
    pub priority: EventPriority,
    /// Insertion order.
    pub sequence: u64,
}

/// Virtual clock, event queue and timer service of a simulation.
#[derive(Debug)]
pub struct SimScheduler {
    now: Duration,
    next_sequence: u64,
    queue: BTreeMap<EventKey, Event>,
    /// Outstanding timers and where they sit in the queue.
    timers: HashMap<TimerHandle, EventKey>,
    /// Maximum number of outstanding timers.
    timer_capacity: usize,
}

impl SimScheduler {
    /// Create a scheduler at time zero.
    pub fn new(timer_capacity: usize) -> Self {
        Self {
            now: Duration::ZERO,
            next_sequence: 0,
            queue: BTreeMap::new(),
            timers: HashMap::new(),
            timer_capacity,
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Change the timer capacity. Outstanding timers are kept.
    pub fn set_timer_capacity(&mut self, timer_capacity: usize) {
        self.timer_capacity = timer_capacity;
    }

    /// Number of outstanding timers.
    pub fn outstanding_timers(&self) -> usize {
        self.timers.len()
    }

    /// Outstanding timers of the given kind.
    pub fn outstanding_of(&self, kind: TimerKind) -> usize {
        self.timers.keys().filter(|h| h.kind == kind).count()
    }

    /// When the outstanding timer of the given kind is due.
    pub fn deadline_of(&self, kind: TimerKind) -> Option<Duration> {
        self.timers
            .iter()
            .filter(|(h, _)| h.kind == kind)
            .map(|(_, key)| key.time)
            .min()
    }

    /// Number of queued events, timers included.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue an event for the current instant, behind any timer due now.
    pub fn enqueue_internal(&mut self, event: Event) {
        let key = self.next_key(self.now, EventPriority::Internal);
        self.queue.insert(key, event);
    }

    /// Pop the next event due at or before `deadline`, advancing the clock.
    pub fn pop_due(&mut self, deadline: Duration) -> Option<Event> {
        let (&key, _) = self.queue.first_key_value()?;
        if key.time > deadline {
            return None;
        }
        let event = self.queue.remove(&key)?;

        if let Event::TimerFired(handle) = &event {
            self.timers.remove(handle);
        }
        self.now = key.time;
        Some(event)
    }

    /// Advance the clock without processing anything.
    ///
    /// Callers must have drained every event due before `time`.
    pub fn advance_to(&mut self, time: Duration) {
        if time > self.now {
            self.now = time;
        }
    }

    fn next_key(&mut self, time: Duration, priority: EventPriority) -> EventKey {
        let key = EventKey {
            time,
            priority,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        key
    }
}

impl TimerService for SimScheduler {
    fn schedule(
        &mut self,
        kind: TimerKind,
        duration: Duration,
    ) -> Result<TimerHandle, TimerError> {
        if self.timers.len() >= self.timer_capacity {
            return Err(TimerError::Exhausted {
                capacity: self.timer_capacity,
            });
        }

        let key = self.next_key(self.now.saturating_add(duration), EventPriority::Timer);
        let handle = TimerHandle::new(kind, key.sequence);
        self.queue.insert(key, Event::TimerFired(handle));
        self.timers.insert(handle, key);

        trace!(timer = %handle, due = ?key.time, "Scheduled timer");
        Ok(handle)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(key) = self.timers.remove(&handle) {
            self.queue.remove(&key);
            trace!(timer = %handle, "Canceled timer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_by_time_then_priority() {
        let mut scheduler = SimScheduler::new(8);
        let late = scheduler
            .schedule(TimerKind::FailSafeCumulative, Duration::from_secs(20))
            .unwrap();
        scheduler.enqueue_internal(Event::CleanupCompleted);
        let now = scheduler
            .schedule(TimerKind::FailSafeStep, Duration::ZERO)
            .unwrap();

        // The zero-length timer beats the internal event queued before it.
        assert_eq!(
            scheduler.pop_due(Duration::from_secs(30)),
            Some(Event::TimerFired(now))
        );
        assert_eq!(
            scheduler.pop_due(Duration::from_secs(30)),
            Some(Event::CleanupCompleted)
        );
        assert_eq!(scheduler.pop_due(Duration::from_secs(10)), None);
        assert_eq!(
            scheduler.pop_due(Duration::from_secs(30)),
            Some(Event::TimerFired(late))
        );
        assert_eq!(scheduler.now(), Duration::from_secs(20));
        assert_eq!(scheduler.outstanding_timers(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut scheduler = SimScheduler::new(8);
        let handle = scheduler
            .schedule(TimerKind::FailSafeStep, Duration::from_secs(5))
            .unwrap();
        scheduler.cancel(handle);
        scheduler.cancel(handle);
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.pop_due(Duration::from_secs(10)), None);
    }

    #[test]
    fn test_capacity_limit() {
        let mut scheduler = SimScheduler::new(1);
        scheduler
            .schedule(TimerKind::FailSafeStep, Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            scheduler.schedule(TimerKind::FailSafeCumulative, Duration::from_secs(5)),
            Err(TimerError::Exhausted { capacity: 1 })
        );
    }

    #[test]
    fn test_far_deadline_saturates() {
        let mut scheduler = SimScheduler::new(4);
        scheduler.advance_to(Duration::from_secs(10));
        scheduler
            .schedule(TimerKind::FailSafeCumulative, Duration::MAX)
            .unwrap();
        assert_eq!(
            scheduler.deadline_of(TimerKind::FailSafeCumulative),
            Some(Duration::MAX)
        );
        assert_eq!(scheduler.pop_due(Duration::from_secs(3600)), None);
    }
}
