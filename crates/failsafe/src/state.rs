//! Fail-safe state machine.

use crate::{FailSafeConfig, FailSafeError};
use commission_core::{Action, Event, FailSafeCleanup, InvocationFlags, TimerService};
use commission_types::{FabricIndex, TimerHandle, TimerKind};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Externally visible fail-safe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailSafeStatus {
    /// No window open; a new arm is possible.
    Disarmed,
    /// A window is open and owned by a fabric.
    Armed,
    /// A window expired and its rollback is in flight.
    Busy,
}

impl fmt::Display for FailSafeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailSafeStatus::Disarmed => write!(f, "Disarmed"),
            FailSafeStatus::Armed => write!(f, "Armed"),
            FailSafeStatus::Busy => write!(f, "Busy"),
        }
    }
}

/// How much of the provisioning attempt a reset closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetScope {
    /// Close the current window only; the cumulative ceiling keeps counting.
    Window,
    /// Close the whole attempt, including the cumulative ceiling.
    Attempt,
}

/// The fail-safe of one device.
///
/// Constructed once by the commissioning subsystem and handed by reference
/// to the command handlers and to the runner that delivers its events. Every
/// method must be called on that single owning context.
///
/// Methods that may touch timers take the [`TimerService`] explicitly.
/// Methods that change state return the [`Action`]s the runner must perform.
pub struct FailSafeContext {
    config: FailSafeConfig,

    /// A window is open.
    armed: bool,

    /// A window expired and cleanup has not completed yet.
    busy: bool,

    /// Owner of the open window. Meaningful only while armed.
    fabric_index: FabricIndex,

    /// Latches recorded during the open window.
    flags: InvocationFlags,

    /// Live per-step timer.
    step_timer: Option<TimerHandle>,

    /// Live cumulative ceiling.
    cumulative_timer: Option<TimerHandle>,
}

impl FailSafeContext {
    /// Create a disarmed fail-safe.
    pub fn new(config: FailSafeConfig) -> Self {
        Self {
            config,
            armed: false,
            busy: false,
            fabric_index: FabricIndex::UNDEFINED,
            flags: InvocationFlags::default(),
            step_timer: None,
            cumulative_timer: None,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &FailSafeConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Arm the fail-safe for `fabric_index`, or re-arm it.
    ///
    /// Re-arming an armed fail-safe replaces the step timer and the owning
    /// fabric without passing through `Busy`. The cumulative ceiling is
    /// started only if none is running. `expiry` is clamped to
    /// [`FailSafeConfig::per_step_max`].
    ///
    /// # Errors
    ///
    /// - [`FailSafeError::InvalidState`] while `Busy`
    /// - [`FailSafeError::ResourceExhausted`] if a timer cannot be scheduled
    ///
    /// On error the state machine and its timers are exactly as before.
    pub fn arm_fail_safe(
        &mut self,
        timers: &mut dyn TimerService,
        fabric_index: FabricIndex,
        expiry: Duration,
    ) -> Result<Vec<Action>, FailSafeError> {
        if self.busy {
            warn!(fabric = %fabric_index, "Rejecting arm: fail-safe busy with cleanup");
            return Err(FailSafeError::InvalidState(
                "fail-safe is not fully disarmed".to_string(),
            ));
        }

        let clamped = self.config.clamp_expiry(expiry);
        if clamped != expiry {
            debug!(requested = ?expiry, clamped = ?clamped, "Clamped fail-safe expiry");
        }

        let new_cumulative = match self.cumulative_timer {
            Some(_) => None,
            None => Some(
                timers.schedule(TimerKind::FailSafeCumulative, self.config.cumulative_max)?,
            ),
        };

        let step = match timers.schedule(TimerKind::FailSafeStep, clamped) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(handle) = new_cumulative {
                    timers.cancel(handle);
                }
                warn!(fabric = %fabric_index, error = %e, "Failed to arm fail-safe");
                return Err(e.into());
            }
        };

        // Scheduled first, replaced second: a failure above leaves the old
        // step timer running.
        if let Some(previous) = self.step_timer.replace(step) {
            timers.cancel(previous);
            debug!(
                previous_fabric = %self.fabric_index,
                fabric = %fabric_index,
                expiry = ?clamped,
                "Re-armed fail-safe"
            );
        }
        if new_cumulative.is_some() {
            self.cumulative_timer = new_cumulative;
        }
        self.fabric_index = fabric_index;

        let mut actions = vec![];
        self.set_armed(true, &mut actions);

        info!(fabric = %fabric_index, expiry = ?clamped, "Fail-safe armed");
        Ok(actions)
    }

    /// Cleanly disarm, e.g. when commissioning completes.
    ///
    /// Goes straight to `Disarmed` through the same reset routine used after
    /// an expiry, without `Busy`: there is no rollback to wait for. The
    /// cumulative ceiling keeps counting so that a re-arm within the same
    /// attempt still shares it.
    ///
    /// Does nothing when not armed. While `Busy` the pending cleanup owns
    /// the reset, so this is ignored as well.
    pub fn disarm_fail_safe(&mut self, timers: &mut dyn TimerService) -> Vec<Action> {
        self.disarm(timers, ResetScope::Window)
    }

    /// Cleanly disarm and close the provisioning attempt.
    ///
    /// Same as [`disarm_fail_safe`](Self::disarm_fail_safe) but the
    /// cumulative ceiling is canceled too, so the next arm starts a new
    /// attempt with a full ceiling. Used when commissioning completes.
    pub fn complete_fail_safe(&mut self, timers: &mut dyn TimerService) -> Vec<Action> {
        self.disarm(timers, ResetScope::Attempt)
    }

    fn disarm(&mut self, timers: &mut dyn TimerService, scope: ResetScope) -> Vec<Action> {
        if self.busy {
            warn!("Ignoring disarm: fail-safe cleanup in flight");
            return vec![];
        }
        if !self.armed {
            debug!("Disarm requested while not armed");
            return vec![];
        }

        let mut actions = vec![];
        self.reset(timers, scope, &mut actions);

        info!(?scope, "Fail-safe cleanly disarmed");
        actions
    }

    /// Expire the open window now.
    ///
    /// Behaves exactly like the step timer firing. Does nothing when not
    /// armed.
    pub fn force_fail_safe_timer_expiry(&mut self, timers: &mut dyn TimerService) -> Vec<Action> {
        if !self.armed {
            return vec![];
        }

        if let Some(handle) = self.step_timer.take() {
            timers.cancel(handle);
        }

        info!(fabric = %self.fabric_index, "Forcing fail-safe expiry");
        self.fail_safe_timer_expired(timers)
    }

    /// Enter `Busy` and schedule rollback of the window.
    ///
    /// The snapshot handed to rollback carries `fabric_index` and the NOC
    /// latches given here; every other latch is taken from the window. The
    /// actual reset happens when the enqueued `Event::CleanupCompleted` is
    /// processed, which the runner guarantees is after the rollback action.
    ///
    /// Does nothing if a cleanup is already in flight.
    pub fn schedule_fail_safe_cleanup(
        &mut self,
        timers: &mut dyn TimerService,
        fabric_index: FabricIndex,
        add_noc_invoked: bool,
        update_noc_invoked: bool,
    ) -> Vec<Action> {
        if self.busy {
            debug!(fabric = %fabric_index, "Fail-safe cleanup already scheduled");
            return vec![];
        }

        if let Some(handle) = self.step_timer.take() {
            timers.cancel(handle);
        }

        let cleanup = FailSafeCleanup {
            fabric_index,
            flags: self
                .flags
                .with_noc_latches(add_noc_invoked, update_noc_invoked),
        };

        // Not armed, but busy: no new arm until the reset below has run.
        let mut actions = vec![];
        self.busy = true;
        self.set_armed(false, &mut actions);

        actions.push(Action::RollbackFailSafe(cleanup));
        actions.push(Action::EnqueueInternal {
            event: Event::CleanupCompleted,
        });
        actions
    }

    /// Process an event delivered by the runner.
    pub fn handle(&mut self, timers: &mut dyn TimerService, event: Event) -> Vec<Action> {
        match event {
            Event::TimerFired(handle) => self.on_timer_fired(timers, handle),
            Event::CleanupCompleted => self.on_cleanup_completed(timers),
        }
    }

    fn on_timer_fired(&mut self, timers: &mut dyn TimerService, handle: TimerHandle) -> Vec<Action> {
        let live = match handle.kind {
            TimerKind::FailSafeStep => &mut self.step_timer,
            TimerKind::FailSafeCumulative => &mut self.cumulative_timer,
        };
        if *live != Some(handle) {
            debug!(timer = %handle, "Ignoring stale fail-safe timer");
            return vec![];
        }
        *live = None;

        if handle.kind == TimerKind::FailSafeCumulative {
            if self.armed {
                info!(fabric = %self.fabric_index, "Cumulative fail-safe ceiling reached");
            } else {
                debug!("Cumulative fail-safe ceiling elapsed while not armed");
            }
        }

        self.fail_safe_timer_expired(timers)
    }

    fn fail_safe_timer_expired(&mut self, timers: &mut dyn TimerService) -> Vec<Action> {
        if !self.armed {
            return vec![];
        }

        info!(fabric = %self.fabric_index, "Fail-safe timer expired");
        let add_noc = self.flags.add_noc();
        let update_noc = self.flags.update_noc();
        self.schedule_fail_safe_cleanup(timers, self.fabric_index, add_noc, update_noc)
    }

    fn on_cleanup_completed(&mut self, timers: &mut dyn TimerService) -> Vec<Action> {
        if !self.busy {
            warn!("Fail-safe cleanup completed while not busy");
            return vec![];
        }

        let mut actions = vec![];
        self.reset(timers, ResetScope::Attempt, &mut actions);

        info!("Fail-safe reset after cleanup");
        actions
    }

    /// The only path that clears the latches.
    fn reset(&mut self, timers: &mut dyn TimerService, scope: ResetScope, actions: &mut Vec<Action>) {
        if let Some(handle) = self.step_timer.take() {
            timers.cancel(handle);
        }
        if scope == ResetScope::Attempt {
            if let Some(handle) = self.cumulative_timer.take() {
                timers.cancel(handle);
            }
        }

        self.set_armed(false, actions);
        self.busy = false;
        self.fabric_index = FabricIndex::UNDEFINED;
        self.flags = InvocationFlags::default();
    }

    fn set_armed(&mut self, armed: bool, actions: &mut Vec<Action>) {
        if self.armed != armed {
            actions.push(Action::ArmedStateChanged { armed });
        }
        self.armed = armed;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Latch setters
    // ═══════════════════════════════════════════════════════════════════════════

    /// Record an AddNOC and the fabric it added.
    pub fn set_add_noc_command_invoked(&mut self, noc_fabric_index: FabricIndex) {
        if self.latch_allowed("AddNOC") {
            self.flags.record_add_noc();
            self.fabric_index = noc_fabric_index;
        }
    }

    pub fn set_update_noc_command_invoked(&mut self) {
        if self.latch_allowed("UpdateNOC") {
            self.flags.record_update_noc();
        }
    }

    pub fn set_add_trusted_root_cert_invoked(&mut self) {
        if self.latch_allowed("AddTrustedRootCertificate") {
            self.flags.record_add_trusted_root();
        }
    }

    pub fn set_csr_request_for_update_noc(&mut self, is_for_update_noc: bool) {
        if self.latch_allowed("CSRRequest") {
            self.flags.set_csr_for_update_noc(is_for_update_noc);
        }
    }

    pub fn set_update_terms_and_conditions_invoked(&mut self) {
        if self.latch_allowed("SetTCAcknowledgements") {
            self.flags.record_update_terms_and_conditions();
        }
    }

    pub fn record_set_vid_verification_statement_invoked(&mut self) {
        if self.latch_allowed("SetVIDVerificationStatement") {
            self.flags.record_set_vid_verification_statement();
        }
    }

    #[cfg(feature = "joint-fabric")]
    pub fn set_add_icac_invoked(&mut self) {
        if self.latch_allowed("AddICAC") {
            self.flags.record_add_icac();
        }
    }

    /// Latches outside an armed window would leak into the next window.
    fn latch_allowed(&self, command: &'static str) -> bool {
        if !self.armed {
            warn!(command, status = %self.status(), "Ignoring latch: fail-safe not armed");
        }
        self.armed
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current state.
    pub fn status(&self) -> FailSafeStatus {
        if self.armed {
            FailSafeStatus::Armed
        } else if self.busy {
            FailSafeStatus::Busy
        } else {
            FailSafeStatus::Disarmed
        }
    }

    pub fn is_fail_safe_armed(&self) -> bool {
        self.armed
    }

    /// Armed, and owned by `accessing_fabric_index`.
    pub fn is_fail_safe_armed_for(&self, accessing_fabric_index: FabricIndex) -> bool {
        self.is_fail_safe_armed() && self.matches_fabric_index(accessing_fabric_index)
    }

    /// Commands that need an armed fail-safe can no longer run, and a new
    /// fail-safe cannot be armed yet.
    pub fn is_fail_safe_busy(&self) -> bool {
        self.busy
    }

    /// An initial arm is currently possible.
    pub fn is_fail_safe_fully_disarmed(&self) -> bool {
        !self.is_fail_safe_armed() && !self.is_fail_safe_busy()
    }

    /// Check whether the open window belongs to `accessing_fabric_index`.
    ///
    /// # Panics
    ///
    /// Panics if the fail-safe is not armed. Check
    /// [`is_fail_safe_armed`](Self::is_fail_safe_armed) first.
    pub fn matches_fabric_index(&self, accessing_fabric_index: FabricIndex) -> bool {
        assert!(
            self.is_fail_safe_armed(),
            "matches_fabric_index called while fail-safe is {}",
            self.status()
        );
        accessing_fabric_index == self.fabric_index
    }

    /// Fabric owning the open window.
    ///
    /// # Panics
    ///
    /// Panics if the fail-safe is not armed.
    pub fn fabric_index(&self) -> FabricIndex {
        assert!(
            self.is_fail_safe_armed(),
            "fabric_index called while fail-safe is {}",
            self.status()
        );
        self.fabric_index
    }

    /// Latches of the open window; empty unless armed.
    pub fn invocation_flags(&self) -> InvocationFlags {
        if self.armed {
            self.flags
        } else {
            InvocationFlags::default()
        }
    }

    pub fn noc_command_has_been_invoked(&self) -> bool {
        self.invocation_flags().any_noc()
    }

    pub fn add_noc_command_has_been_invoked(&self) -> bool {
        self.invocation_flags().add_noc()
    }

    pub fn update_noc_command_has_been_invoked(&self) -> bool {
        self.invocation_flags().update_noc()
    }

    pub fn add_trusted_root_cert_has_been_invoked(&self) -> bool {
        self.invocation_flags().add_trusted_root()
    }

    pub fn is_csr_request_for_update_noc(&self) -> bool {
        self.invocation_flags().csr_for_update_noc()
    }

    pub fn update_terms_and_conditions_has_been_invoked(&self) -> bool {
        self.invocation_flags().update_terms_and_conditions()
    }

    pub fn set_vid_verification_statement_has_been_invoked(&self) -> bool {
        self.invocation_flags().set_vid_verification_statement()
    }

    #[cfg(feature = "joint-fabric")]
    pub fn add_icac_command_has_been_invoked(&self) -> bool {
        self.invocation_flags().add_icac()
    }

    /// A cumulative ceiling is counting.
    pub fn is_cumulative_timer_running(&self) -> bool {
        self.cumulative_timer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commission_test_helpers::{fabric, ManualTimers};
    use tracing_test::traced_test;

    fn make_context() -> (FailSafeContext, ManualTimers) {
        let config = FailSafeConfig::new(Duration::from_secs(60), Duration::from_secs(120))
            .with_default_expiry(Duration::from_secs(30));
        (FailSafeContext::new(config), ManualTimers::new())
    }

    /// Drive an expiry to completion the way a runner would.
    fn run_actions(
        ctx: &mut FailSafeContext,
        timers: &mut ManualTimers,
        actions: Vec<Action>,
    ) -> Vec<FailSafeCleanup> {
        let mut rollbacks = vec![];
        let mut pending = vec![];
        for action in actions {
            match action {
                Action::RollbackFailSafe(cleanup) => rollbacks.push(cleanup),
                Action::EnqueueInternal { event } => pending.push(event),
                Action::ArmedStateChanged { .. } => {}
            }
        }
        for event in pending {
            let more = ctx.handle(timers, event);
            rollbacks.extend(run_actions(ctx, timers, more));
        }
        rollbacks
    }

    #[traced_test]
    #[test]
    fn test_arm_and_disarm() {
        let (mut ctx, mut timers) = make_context();
        assert_eq!(ctx.status(), FailSafeStatus::Disarmed);

        let actions = ctx
            .arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(30))
            .unwrap();
        assert_eq!(actions, vec![Action::ArmedStateChanged { armed: true }]);
        assert!(ctx.is_fail_safe_armed());
        assert!(ctx.is_fail_safe_armed_for(fabric(1)));
        assert!(!ctx.is_fail_safe_armed_for(fabric(2)));
        assert_eq!(ctx.fabric_index(), fabric(1));
        assert!(logs_contain("Fail-safe armed"));

        let step = timers.pending_of(TimerKind::FailSafeStep).unwrap();
        assert_eq!(timers.duration_of(step), Some(Duration::from_secs(30)));
        let cumulative = timers.pending_of(TimerKind::FailSafeCumulative).unwrap();
        assert_eq!(timers.duration_of(cumulative), Some(Duration::from_secs(120)));

        let actions = ctx.disarm_fail_safe(&mut timers);
        assert_eq!(actions, vec![Action::ArmedStateChanged { armed: false }]);
        assert!(!ctx.is_fail_safe_armed());
        assert!(ctx.is_fail_safe_fully_disarmed());
        assert!(!timers.is_pending(step));
        // The ceiling outlives a clean disarm.
        assert!(timers.is_pending(cumulative));
        assert!(logs_contain("Fail-safe cleanly disarmed"));
    }

    #[test]
    fn test_complete_closes_attempt() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(30))
            .unwrap();
        ctx.set_add_noc_command_invoked(fabric(1));

        let actions = ctx.complete_fail_safe(&mut timers);
        assert_eq!(actions, vec![Action::ArmedStateChanged { armed: false }]);
        assert!(ctx.is_fail_safe_fully_disarmed());
        assert!(!ctx.is_cumulative_timer_running());
        assert_eq!(timers.pending_count(), 0);
        assert_eq!(timers.canceled_total(), 2);

        // The next attempt gets a fresh ceiling.
        ctx.arm_fail_safe(&mut timers, fabric(2), Duration::from_secs(30))
            .unwrap();
        let cumulative = timers.pending_of(TimerKind::FailSafeCumulative).unwrap();
        assert_eq!(timers.duration_of(cumulative), Some(Duration::from_secs(120)));
    }

    #[traced_test]
    #[test]
    fn test_rearm_replaces_step_timer() {
        let (mut ctx, mut timers) = make_context();

        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(30))
            .unwrap();
        let first_step = timers.pending_of(TimerKind::FailSafeStep).unwrap();
        let cumulative = timers.pending_of(TimerKind::FailSafeCumulative).unwrap();

        let actions = ctx
            .arm_fail_safe(&mut timers, fabric(2), Duration::from_secs(30))
            .unwrap();
        // No transition through Busy or Disarmed.
        assert!(actions.is_empty());
        assert_eq!(ctx.fabric_index(), fabric(2));

        let second_step = timers.pending_of(TimerKind::FailSafeStep).unwrap();
        assert_ne!(first_step, second_step);
        assert!(!timers.is_pending(first_step));
        assert_eq!(
            timers.pending_of(TimerKind::FailSafeCumulative),
            Some(cumulative)
        );

        // The replaced timer's firing, if it was already in flight, is stale.
        assert!(ctx.handle(&mut timers, Event::TimerFired(first_step)).is_empty());
        assert!(ctx.is_fail_safe_armed());
        assert!(logs_contain("Ignoring stale fail-safe timer"));
    }

    #[traced_test]
    #[test]
    fn test_expiry_goes_through_busy() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(7), Duration::from_secs(5))
            .unwrap();
        ctx.set_add_trusted_root_cert_invoked();
        ctx.set_add_noc_command_invoked(fabric(7));

        let step = timers.fire(TimerKind::FailSafeStep);
        let actions = ctx.handle(&mut timers, Event::TimerFired(step));

        assert_eq!(ctx.status(), FailSafeStatus::Busy);
        assert!(!ctx.is_fail_safe_armed());
        assert!(!ctx.is_fail_safe_fully_disarmed());
        assert!(!ctx.add_noc_command_has_been_invoked());

        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0], Action::ArmedStateChanged { armed: false });
        let Action::RollbackFailSafe(cleanup) = &actions[1] else {
            panic!("expected rollback, got {:?}", actions[1]);
        };
        assert_eq!(cleanup.fabric_index, fabric(7));
        assert!(cleanup.flags.add_noc());
        assert!(cleanup.flags.add_trusted_root());
        assert_eq!(
            actions[2],
            Action::EnqueueInternal {
                event: Event::CleanupCompleted
            }
        );

        let reset = ctx.handle(&mut timers, Event::CleanupCompleted);
        assert!(reset.is_empty());
        assert_eq!(ctx.status(), FailSafeStatus::Disarmed);
        assert!(ctx.invocation_flags().is_clear());
        // Expiry closes the attempt.
        assert_eq!(timers.pending_count(), 0);
        assert!(!ctx.is_cumulative_timer_running());
    }

    #[traced_test]
    #[test]
    fn test_arm_while_busy_is_rejected() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(5))
            .unwrap();
        let step = timers.fire(TimerKind::FailSafeStep);
        ctx.handle(&mut timers, Event::TimerFired(step));

        let scheduled = timers.scheduled_total();
        let err = ctx
            .arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, FailSafeError::InvalidState(_)));
        assert_eq!(ctx.status(), FailSafeStatus::Busy);
        assert_eq!(timers.scheduled_total(), scheduled);
        assert!(logs_contain("Rejecting arm"));
    }

    #[traced_test]
    #[test]
    fn test_cumulative_ceiling_forces_expiry() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(3), Duration::from_secs(60))
            .unwrap();
        ctx.arm_fail_safe(&mut timers, fabric(3), Duration::from_secs(60))
            .unwrap();

        let cumulative = timers.fire(TimerKind::FailSafeCumulative);
        let rollbacks = {
            let actions = ctx.handle(&mut timers, Event::TimerFired(cumulative));
            assert_eq!(ctx.status(), FailSafeStatus::Busy);
            run_actions(&mut ctx, &mut timers, actions)
        };

        assert_eq!(rollbacks.len(), 1);
        assert_eq!(rollbacks[0].fabric_index, fabric(3));
        assert_eq!(ctx.status(), FailSafeStatus::Disarmed);
        assert_eq!(timers.pending_count(), 0);
        assert!(logs_contain("Cumulative fail-safe ceiling reached"));
    }

    #[test]
    fn test_cumulative_elapsing_while_disarmed_retires_ceiling() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        ctx.disarm_fail_safe(&mut timers);
        assert!(ctx.is_cumulative_timer_running());

        let cumulative = timers.fire(TimerKind::FailSafeCumulative);
        assert!(ctx
            .handle(&mut timers, Event::TimerFired(cumulative))
            .is_empty());
        assert!(ctx.is_fail_safe_fully_disarmed());
        assert!(!ctx.is_cumulative_timer_running());

        // The next attempt gets a fresh ceiling.
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        assert!(timers.pending_of(TimerKind::FailSafeCumulative).is_some());
    }

    #[test]
    fn test_exhausted_timers_leave_state_unchanged() {
        let (mut ctx, _) = make_context();

        // Room for the ceiling but not the step timer.
        let mut timers = ManualTimers::with_capacity(1);
        let err = ctx
            .arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, FailSafeError::ResourceExhausted(_)));
        assert!(ctx.is_fail_safe_fully_disarmed());
        assert!(!ctx.is_cumulative_timer_running());
        assert_eq!(timers.pending_count(), 0);

        // Re-arm failure keeps the original window intact.
        timers.set_capacity(None);
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        let step = timers.pending_of(TimerKind::FailSafeStep).unwrap();
        timers.set_capacity(Some(2));
        let err = ctx
            .arm_fail_safe(&mut timers, fabric(2), Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, FailSafeError::ResourceExhausted(_)));
        assert_eq!(ctx.fabric_index(), fabric(1));
        assert!(timers.is_pending(step));
    }

    #[test]
    fn test_add_noc_latch_tracks_latest_fabric() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();

        ctx.set_add_noc_command_invoked(fabric(4));
        ctx.set_add_noc_command_invoked(fabric(5));
        assert!(ctx.add_noc_command_has_been_invoked());
        assert!(ctx.noc_command_has_been_invoked());
        assert!(!ctx.update_noc_command_has_been_invoked());
        assert_eq!(ctx.fabric_index(), fabric(5));

        let step = timers.fire(TimerKind::FailSafeStep);
        let actions = ctx.handle(&mut timers, Event::TimerFired(step));
        let rollbacks = run_actions(&mut ctx, &mut timers, actions);
        assert_eq!(rollbacks[0].fabric_index, fabric(5));

        assert!(!ctx.add_noc_command_has_been_invoked());
        assert!(!ctx.noc_command_has_been_invoked());
    }

    #[test]
    fn test_every_latch_is_cleared_by_reset() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(2), Duration::from_secs(10))
            .unwrap();

        ctx.set_update_noc_command_invoked();
        ctx.set_add_trusted_root_cert_invoked();
        ctx.set_csr_request_for_update_noc(true);
        ctx.set_update_terms_and_conditions_invoked();
        ctx.record_set_vid_verification_statement_invoked();
        assert!(ctx.update_noc_command_has_been_invoked());
        assert!(ctx.add_trusted_root_cert_has_been_invoked());
        assert!(ctx.is_csr_request_for_update_noc());
        assert!(ctx.update_terms_and_conditions_has_been_invoked());
        assert!(ctx.set_vid_verification_statement_has_been_invoked());

        ctx.disarm_fail_safe(&mut timers);
        assert!(ctx.invocation_flags().is_clear());

        // A fresh window starts clean.
        ctx.arm_fail_safe(&mut timers, fabric(2), Duration::from_secs(10))
            .unwrap();
        assert!(ctx.invocation_flags().is_clear());
    }

    #[traced_test]
    #[test]
    fn test_latch_outside_window_is_ignored() {
        let (mut ctx, mut timers) = make_context();
        ctx.set_add_noc_command_invoked(fabric(9));
        assert!(logs_contain("Ignoring latch"));

        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        assert!(!ctx.add_noc_command_has_been_invoked());
        assert_eq!(ctx.fabric_index(), fabric(1));
    }

    #[test]
    fn test_force_expiry() {
        let (mut ctx, mut timers) = make_context();
        assert!(ctx.force_fail_safe_timer_expiry(&mut timers).is_empty());

        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        let step = timers.pending_of(TimerKind::FailSafeStep).unwrap();
        let actions = ctx.force_fail_safe_timer_expiry(&mut timers);
        assert!(!timers.is_pending(step));
        assert_eq!(ctx.status(), FailSafeStatus::Busy);

        // Forcing again while busy is a no-op.
        assert!(ctx.force_fail_safe_timer_expiry(&mut timers).is_empty());

        run_actions(&mut ctx, &mut timers, actions);
        assert!(ctx.is_fail_safe_fully_disarmed());
    }

    #[test]
    fn test_expiry_clamped_to_per_step_max() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(600))
            .unwrap();
        let step = timers.pending_of(TimerKind::FailSafeStep).unwrap();
        assert_eq!(timers.duration_of(step), Some(Duration::from_secs(60)));
    }

    #[traced_test]
    #[test]
    fn test_unexpected_cleanup_completion_is_ignored() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        assert!(ctx.handle(&mut timers, Event::CleanupCompleted).is_empty());
        assert!(ctx.is_fail_safe_armed());
        assert!(logs_contain("cleanup completed while not busy"));
    }

    #[test]
    fn test_disarm_while_busy_waits_for_cleanup() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        let actions = ctx.force_fail_safe_timer_expiry(&mut timers);

        assert!(ctx.disarm_fail_safe(&mut timers).is_empty());
        assert_eq!(ctx.status(), FailSafeStatus::Busy);

        run_actions(&mut ctx, &mut timers, actions);
        assert_eq!(ctx.status(), FailSafeStatus::Disarmed);
    }

    #[test]
    fn test_explicit_cleanup_uses_caller_snapshot() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        ctx.set_add_noc_command_invoked(fabric(1));
        ctx.set_update_terms_and_conditions_invoked();

        let actions = ctx.schedule_fail_safe_cleanup(&mut timers, fabric(1), false, false);
        let rollbacks = run_actions(&mut ctx, &mut timers, actions);

        assert!(!rollbacks[0].flags.add_noc());
        assert!(rollbacks[0].flags.update_terms_and_conditions());
        assert!(ctx.is_fail_safe_fully_disarmed());
    }

    #[test]
    #[should_panic(expected = "fabric_index called while fail-safe is Disarmed")]
    fn test_fabric_index_while_disarmed_panics() {
        let (ctx, _) = make_context();
        let _ = ctx.fabric_index();
    }

    #[test]
    #[should_panic(expected = "matches_fabric_index called while fail-safe is Busy")]
    fn test_matches_fabric_index_while_busy_panics() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        ctx.force_fail_safe_timer_expiry(&mut timers);
        let _ = ctx.matches_fabric_index(fabric(1));
    }

    #[cfg(feature = "joint-fabric")]
    #[test]
    fn test_add_icac_latch() {
        let (mut ctx, mut timers) = make_context();
        ctx.arm_fail_safe(&mut timers, fabric(1), Duration::from_secs(10))
            .unwrap();
        ctx.set_add_icac_invoked();
        assert!(ctx.add_icac_command_has_been_invoked());
        ctx.disarm_fail_safe(&mut timers);
        assert!(!ctx.add_icac_command_has_been_invoked());
    }

    mod sequences {
        use super::*;
        use proptest::prelude::*;
        use std::collections::VecDeque;

        #[derive(Debug, Clone)]
        enum Step {
            Arm { fabric: u8, secs: u64 },
            Disarm,
            Complete,
            ForceExpiry,
            AddNoc(u8),
            UpdateNoc,
            AddTrustedRoot,
            FireStep,
            FireCumulative,
            DeliverInternal,
        }

        fn step_strategy() -> impl Strategy<Value = Step> {
            prop_oneof![
                (1u8..=3, 1u64..=90).prop_map(|(fabric, secs)| Step::Arm { fabric, secs }),
                Just(Step::Disarm),
                Just(Step::Complete),
                Just(Step::ForceExpiry),
                (1u8..=3).prop_map(Step::AddNoc),
                Just(Step::UpdateNoc),
                Just(Step::AddTrustedRoot),
                Just(Step::FireStep),
                Just(Step::FireCumulative),
                Just(Step::DeliverInternal),
            ]
        }

        fn fire(ctx: &mut FailSafeContext, timers: &mut ManualTimers, kind: TimerKind) -> Vec<Action> {
            if timers.pending_of(kind).is_none() {
                return vec![];
            }
            let handle = timers.fire(kind);
            ctx.handle(timers, Event::TimerFired(handle))
        }

        /// Apply one step, checking its immediate postcondition.
        fn apply(
            ctx: &mut FailSafeContext,
            timers: &mut ManualTimers,
            queue: &mut VecDeque<Event>,
            step: &Step,
        ) {
            let was_busy = ctx.is_fail_safe_busy();
            let actions = match *step {
                Step::Arm { fabric: index, secs } => {
                    match ctx.arm_fail_safe(timers, fabric(index), Duration::from_secs(secs)) {
                        Ok(actions) => {
                            assert!(ctx.is_fail_safe_armed());
                            assert_eq!(ctx.fabric_index(), fabric(index));
                            actions
                        }
                        Err(err) => {
                            assert!(was_busy, "arm failed outside Busy: {err}");
                            assert!(matches!(err, FailSafeError::InvalidState(_)));
                            vec![]
                        }
                    }
                }
                Step::Disarm => {
                    let actions = ctx.disarm_fail_safe(timers);
                    if !was_busy {
                        assert!(!ctx.is_fail_safe_armed());
                    }
                    actions
                }
                Step::Complete => {
                    let actions = ctx.complete_fail_safe(timers);
                    if !was_busy {
                        assert!(ctx.is_fail_safe_fully_disarmed());
                        assert!(!ctx.is_cumulative_timer_running());
                    }
                    actions
                }
                Step::ForceExpiry => ctx.force_fail_safe_timer_expiry(timers),
                Step::AddNoc(index) => {
                    ctx.set_add_noc_command_invoked(fabric(index));
                    vec![]
                }
                Step::UpdateNoc => {
                    ctx.set_update_noc_command_invoked();
                    vec![]
                }
                Step::AddTrustedRoot => {
                    ctx.set_add_trusted_root_cert_invoked();
                    vec![]
                }
                Step::FireStep => fire(ctx, timers, TimerKind::FailSafeStep),
                Step::FireCumulative => fire(ctx, timers, TimerKind::FailSafeCumulative),
                Step::DeliverInternal => match queue.pop_front() {
                    Some(event) => ctx.handle(timers, event),
                    None => vec![],
                },
            };

            for action in actions {
                if let Action::EnqueueInternal { event } = action {
                    queue.push_back(event);
                }
            }
        }

        fn check_invariants(ctx: &FailSafeContext, timers: &ManualTimers, queue: &VecDeque<Event>) {
            assert!(!(ctx.armed && ctx.busy), "armed and busy at once");
            if !ctx.is_fail_safe_armed() {
                assert!(ctx.invocation_flags().is_clear());
            }
            if ctx.is_fail_safe_fully_disarmed() {
                assert!(ctx.flags.is_clear());
            }

            // pending_of panics if more than one timer of a kind is outstanding.
            let step = timers.pending_of(TimerKind::FailSafeStep);
            let cumulative = timers.pending_of(TimerKind::FailSafeCumulative);
            assert_eq!(step, ctx.step_timer);
            assert_eq!(cumulative, ctx.cumulative_timer);
            assert_eq!(step.is_some(), ctx.is_fail_safe_armed());

            // Busy exactly while the reset is still queued.
            assert_eq!(ctx.is_fail_safe_busy(), !queue.is_empty());
        }

        proptest! {
            #[test]
            fn test_random_sequences_hold_invariants(
                steps in prop::collection::vec(step_strategy(), 1..80)
            ) {
                let (mut ctx, mut timers) = make_context();
                let mut queue = VecDeque::new();
                for step in &steps {
                    apply(&mut ctx, &mut timers, &mut queue, step);
                    check_invariants(&ctx, &timers, &queue);
                }
            }
        }
    }
}
