//! The task that owns the fail-safe.

use crate::handle::{FailSafeHandle, FailSafeSnapshot, Latch};
use crate::TokioTimers;
use commission_core::{Action, Event, FailSafeCleanup, FailSafeRollback};
use commission_failsafe::{
    CommissioningError, FailSafeConfig, FailSafeContext, FailSafeError, FailSafeStatus,
    GeneralCommissioning,
};
use commission_types::FabricIndex;
use std::time::Duration;
use tokio::sync::mpsc::{self, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages consumed by the runner task.
pub(crate) enum RunnerMessage {
    Command(Command),
    Event(Event),
}

pub(crate) enum Command {
    Arm {
        fabric_index: FabricIndex,
        /// `None` uses the configured default.
        expiry: Option<Duration>,
        reply: oneshot::Sender<Result<(), CommissioningError>>,
    },
    Complete {
        fabric_index: FabricIndex,
        reply: oneshot::Sender<Result<FailSafeCleanup, CommissioningError>>,
    },
    Record {
        fabric_index: FabricIndex,
        latch: Latch,
        reply: oneshot::Sender<Result<(), CommissioningError>>,
    },
    Disarm {
        reply: oneshot::Sender<()>,
    },
    ForceExpiry {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<FailSafeSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub fail_safe: FailSafeConfig,

    /// Maximum number of outstanding timers.
    pub timer_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            fail_safe: FailSafeConfig::default(),
            timer_capacity: 16,
        }
    }
}

impl RunnerConfig {
    pub fn with_fail_safe(mut self, fail_safe: FailSafeConfig) -> Self {
        self.fail_safe = fail_safe;
        self
    }

    pub fn with_timer_capacity(mut self, timer_capacity: usize) -> Self {
        self.timer_capacity = timer_capacity;
        self
    }
}

/// Hosts one [`FailSafeContext`] on a tokio task.
///
/// The runner only holds a weak reference to its own channel, so it stops
/// once every [`FailSafeHandle`] is dropped or on an explicit shutdown.
pub struct FailSafeRunner {
    fail_safe: FailSafeContext,
    timers: TokioTimers,
    collaborators: Vec<Box<dyn FailSafeRollback + Send>>,
    receiver: mpsc::UnboundedReceiver<RunnerMessage>,
    sender: WeakUnboundedSender<RunnerMessage>,
    status: watch::Sender<FailSafeStatus>,
}

impl FailSafeRunner {
    /// Spawn the runner on the current tokio runtime.
    ///
    /// `collaborators` are invoked in order for every rollback.
    pub fn spawn(
        config: RunnerConfig,
        collaborators: Vec<Box<dyn FailSafeRollback + Send>>,
    ) -> Result<(FailSafeHandle, JoinHandle<()>), FailSafeError> {
        config.fail_safe.validate()?;
        if config.timer_capacity < 2 {
            warn!(
                capacity = config.timer_capacity,
                "Timer capacity below two; every arm will fail"
            );
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(FailSafeStatus::Disarmed);
        let weak = sender.downgrade();

        let runner = Self {
            fail_safe: FailSafeContext::new(config.fail_safe),
            timers: TokioTimers::new(weak.clone(), config.timer_capacity),
            collaborators,
            receiver,
            sender: weak,
            status,
        };
        let task = tokio::spawn(runner.run());

        Ok((FailSafeHandle::new(sender, status_rx), task))
    }

    async fn run(mut self) {
        info!(config = ?self.fail_safe.config(), "Fail-safe runner started");

        while let Some(message) = self.receiver.recv().await {
            match message {
                RunnerMessage::Event(event) => self.dispatch(event),
                RunnerMessage::Command(Command::Shutdown { reply }) => {
                    let _ = reply.send(());
                    break;
                }
                RunnerMessage::Command(command) => self.on_command(command),
            }
            self.publish_status();
        }

        if !self.fail_safe.is_fail_safe_fully_disarmed() {
            warn!(status = %self.fail_safe.status(), "Fail-safe runner stopped with an open window");
        }
        self.timers.cancel_all();
        info!("Fail-safe runner stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════════════════

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Arm {
                fabric_index,
                expiry,
                reply,
            } => {
                let armed = {
                    let mut commissioning =
                        GeneralCommissioning::new(&mut self.fail_safe, &mut self.timers);
                    match expiry {
                        Some(expiry) => commissioning.arm_fail_safe(fabric_index, expiry),
                        None => commissioning.arm_fail_safe_default(fabric_index),
                    }
                };
                let result = armed.map(|actions| self.process_actions(actions));
                let _ = reply.send(result);
            }
            Command::Complete {
                fabric_index,
                reply,
            } => {
                let completed = GeneralCommissioning::new(&mut self.fail_safe, &mut self.timers)
                    .commissioning_complete(fabric_index);
                let result = completed.map(|window| {
                    self.process_actions(window.actions);
                    window.committed
                });
                let _ = reply.send(result);
            }
            Command::Record {
                fabric_index,
                latch,
                reply,
            } => {
                let admitted = GeneralCommissioning::new(&mut self.fail_safe, &mut self.timers)
                    .require_armed(fabric_index);
                let result = admitted.map(|()| self.record(latch));
                let _ = reply.send(result);
            }
            Command::Disarm { reply } => {
                let actions = self.fail_safe.disarm_fail_safe(&mut self.timers);
                self.process_actions(actions);
                let _ = reply.send(());
            }
            Command::ForceExpiry { reply } => {
                let actions = self.fail_safe.force_fail_safe_timer_expiry(&mut self.timers);
                self.process_actions(actions);
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn record(&mut self, latch: Latch) {
        let fail_safe = &mut self.fail_safe;
        match latch {
            Latch::AddNoc { new_fabric } => fail_safe.set_add_noc_command_invoked(new_fabric),
            Latch::UpdateNoc => fail_safe.set_update_noc_command_invoked(),
            Latch::AddTrustedRoot => fail_safe.set_add_trusted_root_cert_invoked(),
            Latch::CsrRequest { for_update_noc } => {
                fail_safe.set_csr_request_for_update_noc(for_update_noc)
            }
            Latch::UpdateTermsAndConditions => fail_safe.set_update_terms_and_conditions_invoked(),
            Latch::SetVidVerificationStatement => {
                fail_safe.record_set_vid_verification_statement_invoked()
            }
            #[cfg(feature = "joint-fabric")]
            Latch::AddIcac => fail_safe.set_add_icac_invoked(),
        }
        debug!(?latch, "Recorded fail-safe latch");
    }

    fn snapshot(&self) -> FailSafeSnapshot {
        let fail_safe = &self.fail_safe;
        FailSafeSnapshot {
            status: fail_safe.status(),
            fabric_index: fail_safe
                .is_fail_safe_armed()
                .then(|| fail_safe.fabric_index()),
            flags: fail_safe.invocation_flags(),
            cumulative_timer_running: fail_safe.is_cumulative_timer_running(),
            outstanding_timers: self.timers.outstanding(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Events and actions
    // ═══════════════════════════════════════════════════════════════════════════

    fn dispatch(&mut self, event: Event) {
        if let Event::TimerFired(handle) = &event {
            self.timers.fired(*handle);
        }
        debug!(event = event.type_name(), "Dispatching event");

        let actions = self.fail_safe.handle(&mut self.timers, event);
        self.process_actions(actions);
    }

    fn process_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::ArmedStateChanged { armed } => {
                    debug!(armed, "Armed state changed");
                }
                Action::RollbackFailSafe(cleanup) => {
                    let plan = cleanup.rollback_plan();
                    for collaborator in &mut self.collaborators {
                        collaborator.rollback(&cleanup, &plan);
                    }
                    info!(
                        fabric = %cleanup.fabric_index,
                        collaborators = self.collaborators.len(),
                        "Fail-safe rollback executed"
                    );
                }
                Action::EnqueueInternal { event } => self.post(event),
            }
        }
    }

    /// Queue deferred work behind every message already waiting.
    fn post(&mut self, event: Event) {
        match self.sender.upgrade() {
            Some(sender) => {
                let _ = sender.send(RunnerMessage::Event(event));
            }
            // No handle is left to queue behind.
            None => self.dispatch(event),
        }
    }

    fn publish_status(&self) {
        let current = self.fail_safe.status();
        self.status.send_if_modified(|status| {
            if *status == current {
                false
            } else {
                *status = current;
                true
            }
        });
    }
}
