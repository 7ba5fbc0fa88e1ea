//! Timer service backed by tokio sleep tasks.

use crate::runner::RunnerMessage;
use commission_core::{Event, TimerError, TimerService};
use commission_types::{TimerHandle, TimerKind};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tracing::trace;

/// One sleep task per scheduled timer.
///
/// A firing is posted to the runner's channel as `Event::TimerFired`; the
/// fail-safe is never called from the sleep task itself. Canceling aborts
/// the task, and a firing that was already posted is recognized as stale by
/// its handle.
pub struct TokioTimers {
    sender: WeakUnboundedSender<RunnerMessage>,
    next_seq: u64,
    tasks: HashMap<TimerHandle, JoinHandle<()>>,
    capacity: usize,
}

impl TokioTimers {
    pub(crate) fn new(sender: WeakUnboundedSender<RunnerMessage>, capacity: usize) -> Self {
        Self {
            sender,
            next_seq: 0,
            tasks: HashMap::new(),
            capacity,
        }
    }

    /// Forget a timer whose firing has been delivered.
    pub(crate) fn fired(&mut self, handle: TimerHandle) {
        self.tasks.remove(&handle);
    }

    /// Number of outstanding timers.
    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Abort every outstanding timer.
    pub(crate) fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

impl TimerService for TokioTimers {
    fn schedule(
        &mut self,
        kind: TimerKind,
        duration: Duration,
    ) -> Result<TimerHandle, TimerError> {
        if self.tasks.len() >= self.capacity {
            return Err(TimerError::Exhausted {
                capacity: self.capacity,
            });
        }
        // Nobody is left to deliver the firing to.
        if self.sender.upgrade().is_none() {
            return Err(TimerError::RuntimeShutdown);
        }

        self.next_seq += 1;
        let handle = TimerHandle::new(kind, self.next_seq);
        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(RunnerMessage::Event(Event::TimerFired(handle)));
            }
        });
        self.tasks.insert(handle, task);

        trace!(timer = %handle, ?duration, "Scheduled timer");
        Ok(handle)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
            trace!(timer = %handle, "Canceled timer");
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
