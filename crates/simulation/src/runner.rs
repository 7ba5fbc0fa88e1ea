//! Simulation runner hosting one fail-safe.

use crate::{SimFabricTable, SimScheduler};
use commission_core::{Action, Event, FailSafeCleanup, FailSafeRollback};
use commission_failsafe::{
    CommissioningError, FailSafeConfig, FailSafeContext, FailSafeError, FailSafeStatus,
    GeneralCommissioning,
};
use commission_types::FabricIndex;
use std::time::Duration;
use tracing::{debug, info};

/// Default number of timer slots.
const DEFAULT_TIMER_CAPACITY: usize = 16;

/// Counters collected over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationStats {
    /// Events handed to the fail-safe.
    pub events_processed: u64,
    /// Timer firings among them.
    pub timers_fired: u64,
    /// Rollback actions executed.
    pub rollbacks: u64,
    /// Armed/disarmed transitions observed.
    pub armed_transitions: u64,
}

/// Deterministic host for a [`FailSafeContext`].
///
/// Owns the fail-safe, the simulated clock and timer service, the simulated
/// fabric table and any extra rollback collaborators. Commands run
/// synchronously at the current simulated time; time only moves in
/// [`run_until`](Self::run_until) and friends.
pub struct SimulationRunner {
    fail_safe: FailSafeContext,
    scheduler: SimScheduler,
    fabric_table: SimFabricTable,
    collaborators: Vec<Box<dyn FailSafeRollback>>,
    stats: SimulationStats,
}

impl SimulationRunner {
    /// Create a runner with an empty fabric table.
    ///
    /// # Errors
    ///
    /// Returns [`FailSafeError::InvalidConfig`] if `config` does not validate.
    pub fn new(config: FailSafeConfig) -> Result<Self, FailSafeError> {
        config.validate()?;
        Ok(Self {
            fail_safe: FailSafeContext::new(config),
            scheduler: SimScheduler::new(DEFAULT_TIMER_CAPACITY),
            fabric_table: SimFabricTable::new(),
            collaborators: Vec::new(),
            stats: SimulationStats::default(),
        })
    }

    /// Replace the fabric table.
    pub fn with_fabric_table(mut self, fabric_table: SimFabricTable) -> Self {
        self.fabric_table = fabric_table;
        self
    }

    /// Limit the number of outstanding timers.
    pub fn with_timer_capacity(mut self, capacity: usize) -> Self {
        self.scheduler.set_timer_capacity(capacity);
        self
    }

    /// Register an additional rollback collaborator.
    ///
    /// Collaborators run after the fabric table, in registration order.
    pub fn add_collaborator(&mut self, collaborator: Box<dyn FailSafeRollback>) {
        self.collaborators.push(collaborator);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    pub fn fail_safe(&self) -> &FailSafeContext {
        &self.fail_safe
    }

    /// Mutable access for latch setters.
    pub fn fail_safe_mut(&mut self) -> &mut FailSafeContext {
        &mut self.fail_safe
    }

    pub fn status(&self) -> FailSafeStatus {
        self.fail_safe.status()
    }

    pub fn scheduler(&self) -> &SimScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut SimScheduler {
        &mut self.scheduler
    }

    pub fn fabric_table(&self) -> &SimFabricTable {
        &self.fabric_table
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Fail-safe operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Arm the fail-safe directly.
    pub fn arm(&mut self, fabric_index: FabricIndex, expiry: Duration) -> Result<(), FailSafeError> {
        let actions = self
            .fail_safe
            .arm_fail_safe(&mut self.scheduler, fabric_index, expiry)?;
        self.process_actions(actions);
        Ok(())
    }

    /// Disarm the fail-safe directly.
    pub fn disarm(&mut self) {
        let actions = self.fail_safe.disarm_fail_safe(&mut self.scheduler);
        self.process_actions(actions);
    }

    /// Force the abort path.
    pub fn force_expiry(&mut self) {
        let actions = self
            .fail_safe
            .force_fail_safe_timer_expiry(&mut self.scheduler);
        self.process_actions(actions);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Commissioning commands
    // ═══════════════════════════════════════════════════════════════════════════

    /// ArmFailSafe command from `fabric_index`.
    pub fn arm_fail_safe_command(
        &mut self,
        fabric_index: FabricIndex,
        expiry: Duration,
    ) -> Result<(), CommissioningError> {
        let actions = GeneralCommissioning::new(&mut self.fail_safe, &mut self.scheduler)
            .arm_fail_safe(fabric_index, expiry)?;
        self.process_actions(actions);
        Ok(())
    }

    /// AddTrustedRootCertificate command from `fabric_index`.
    pub fn add_trusted_root(&mut self, fabric_index: FabricIndex) -> Result<(), CommissioningError> {
        self.require_armed(fabric_index)?;
        self.fabric_table.stage_trusted_root();
        self.fail_safe.set_add_trusted_root_cert_invoked();
        Ok(())
    }

    /// AddNOC command from the window owner, staging `new_fabric`.
    pub fn add_noc(
        &mut self,
        fabric_index: FabricIndex,
        new_fabric: FabricIndex,
    ) -> Result<(), CommissioningError> {
        self.require_armed(fabric_index)?;
        self.fabric_table.stage_fabric(new_fabric);
        self.fabric_table.open_session(new_fabric);
        self.fail_safe.set_add_noc_command_invoked(new_fabric);
        Ok(())
    }

    /// UpdateNOC command from `fabric_index`.
    pub fn update_noc(&mut self, fabric_index: FabricIndex) -> Result<(), CommissioningError> {
        self.require_armed(fabric_index)?;
        self.fabric_table.stage_update(fabric_index);
        self.fail_safe.set_update_noc_command_invoked();
        Ok(())
    }

    /// CommissioningComplete command from `fabric_index`.
    ///
    /// Commits the fabric table and returns what was committed.
    pub fn commissioning_complete(
        &mut self,
        fabric_index: FabricIndex,
    ) -> Result<FailSafeCleanup, CommissioningError> {
        let completed = GeneralCommissioning::new(&mut self.fail_safe, &mut self.scheduler)
            .commissioning_complete(fabric_index)?;
        self.fabric_table.commit();
        self.process_actions(completed.actions);
        Ok(completed.committed)
    }

    fn require_armed(&mut self, fabric_index: FabricIndex) -> Result<(), CommissioningError> {
        GeneralCommissioning::new(&mut self.fail_safe, &mut self.scheduler)
            .require_armed(fabric_index)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Time
    // ═══════════════════════════════════════════════════════════════════════════

    /// Process every event due up to and including `time`, then move the
    /// clock to `time`.
    pub fn run_until(&mut self, time: Duration) {
        while let Some(event) = self.scheduler.pop_due(time) {
            self.dispatch(event);
        }
        self.scheduler.advance_to(time);
    }

    /// Run for `duration` of simulated time.
    pub fn advance(&mut self, duration: Duration) {
        let until = self.now().saturating_add(duration);
        self.run_until(until);
    }

    /// Process events until the queue is empty.
    ///
    /// Terminates because every window is bounded by its timers.
    pub fn run_until_idle(&mut self) {
        while let Some(event) = self.scheduler.pop_due(Duration::MAX) {
            self.dispatch(event);
        }
    }

    /// Process only the events due at the current instant.
    pub fn run_pending(&mut self) {
        let now = self.now();
        self.run_until(now);
    }

    fn dispatch(&mut self, event: Event) {
        self.stats.events_processed += 1;
        if matches!(event, Event::TimerFired(_)) {
            self.stats.timers_fired += 1;
        }
        debug!(now = ?self.now(), event = event.type_name(), "Dispatching event");

        let actions = self.fail_safe.handle(&mut self.scheduler, event);
        self.process_actions(actions);
    }

    fn process_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::ArmedStateChanged { armed } => {
                    self.stats.armed_transitions += 1;
                    debug!(now = ?self.now(), armed, "Armed state changed");
                }
                Action::RollbackFailSafe(cleanup) => {
                    let plan = cleanup.rollback_plan();
                    self.fabric_table.rollback(&cleanup, &plan);
                    for collaborator in &mut self.collaborators {
                        collaborator.rollback(&cleanup, &plan);
                    }
                    self.stats.rollbacks += 1;
                    info!(now = ?self.now(), fabric = %cleanup.fabric_index, "Fail-safe rollback executed");
                }
                Action::EnqueueInternal { event } => {
                    self.scheduler.enqueue_internal(event);
                }
            }
        }
    }
}
