//! Commissioning command handling on top of the fail-safe.
//!
//! Applies the single-fabric ownership rules a commissioner sees: only the
//! fabric that armed the fail-safe may extend, expire or complete it, and a
//! `Busy` fail-safe turns every administrator away.

use crate::{FailSafeContext, FailSafeError};
use commission_core::{Action, FailSafeCleanup, TimerService};
use commission_types::FabricIndex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Command-level failures reported back to the commissioner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommissioningError {
    /// The fail-safe is busy, or armed by a different administrator.
    #[error("Fail-safe is busy with another administrator")]
    BusyWithOtherAdmin,

    /// No fail-safe is armed.
    #[error("No fail-safe is armed")]
    NoFailSafe,

    /// The fail-safe is armed by a different fabric.
    #[error("Fail-safe is armed by a different fabric")]
    InvalidAuthentication,

    /// The command needs a fail-safe armed by the accessing fabric.
    #[error("Command requires a fail-safe armed by the accessing fabric")]
    FailSafeRequired,

    /// The fail-safe itself refused the operation.
    #[error(transparent)]
    FailSafe(#[from] FailSafeError),
}

/// A window closed by CommissioningComplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedWindow {
    /// What the window installed; the caller commits it.
    pub committed: FailSafeCleanup,
    /// Actions produced by the disarm.
    pub actions: Vec<Action>,
}

/// General Commissioning command handlers.
///
/// Borrows the fail-safe and the timer service for the duration of one
/// command.
pub struct GeneralCommissioning<'a> {
    fail_safe: &'a mut FailSafeContext,
    timers: &'a mut dyn TimerService,
}

impl<'a> GeneralCommissioning<'a> {
    pub fn new(fail_safe: &'a mut FailSafeContext, timers: &'a mut dyn TimerService) -> Self {
        Self { fail_safe, timers }
    }

    /// ArmFailSafe.
    ///
    /// An expiry of zero expires the caller's window immediately instead of
    /// arming. Busy fail-safes and windows owned by other fabrics are
    /// rejected with [`CommissioningError::BusyWithOtherAdmin`].
    pub fn arm_fail_safe(
        &mut self,
        accessing_fabric_index: FabricIndex,
        expiry: Duration,
    ) -> Result<Vec<Action>, CommissioningError> {
        let fail_safe = &mut *self.fail_safe;

        if fail_safe.is_fail_safe_busy()
            || (fail_safe.is_fail_safe_armed()
                && !fail_safe.matches_fabric_index(accessing_fabric_index))
        {
            debug!(fabric = %accessing_fabric_index, status = %fail_safe.status(), "ArmFailSafe refused");
            return Err(CommissioningError::BusyWithOtherAdmin);
        }

        if expiry.is_zero() {
            return Ok(fail_safe.force_fail_safe_timer_expiry(self.timers));
        }

        Ok(fail_safe.arm_fail_safe(self.timers, accessing_fabric_index, expiry)?)
    }

    /// ArmFailSafe with the configured default expiry.
    pub fn arm_fail_safe_default(
        &mut self,
        accessing_fabric_index: FabricIndex,
    ) -> Result<Vec<Action>, CommissioningError> {
        let expiry = self.fail_safe.config().default_expiry;
        self.arm_fail_safe(accessing_fabric_index, expiry)
    }

    /// CommissioningComplete.
    ///
    /// Closes the caller's window and its provisioning attempt without a
    /// rollback, and returns what the window installed so the caller can
    /// commit it.
    pub fn commissioning_complete(
        &mut self,
        accessing_fabric_index: FabricIndex,
    ) -> Result<CompletedWindow, CommissioningError> {
        let fail_safe = &mut *self.fail_safe;

        if !fail_safe.is_fail_safe_armed() {
            return Err(CommissioningError::NoFailSafe);
        }
        if !fail_safe.matches_fabric_index(accessing_fabric_index) {
            return Err(CommissioningError::InvalidAuthentication);
        }

        let committed = FailSafeCleanup {
            fabric_index: fail_safe.fabric_index(),
            flags: fail_safe.invocation_flags(),
        };
        let actions = fail_safe.complete_fail_safe(self.timers);

        info!(fabric = %accessing_fabric_index, "Commissioning complete");
        Ok(CompletedWindow { committed, actions })
    }

    /// Admission check for commands that need the caller's armed window.
    pub fn require_armed(&self, accessing_fabric_index: FabricIndex) -> Result<(), CommissioningError> {
        if self.fail_safe.is_fail_safe_armed_for(accessing_fabric_index) {
            Ok(())
        } else {
            Err(CommissioningError::FailSafeRequired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailSafeConfig, FailSafeStatus};
    use commission_core::Event;
    use commission_test_helpers::{fabric, ManualTimers};
    use commission_types::TimerKind;

    fn make_context() -> (FailSafeContext, ManualTimers) {
        (
            FailSafeContext::new(FailSafeConfig::default()),
            ManualTimers::new(),
        )
    }

    #[test]
    fn test_other_fabric_is_busy() {
        let (mut ctx, mut timers) = make_context();
        let mut gc = GeneralCommissioning::new(&mut ctx, &mut timers);

        gc.arm_fail_safe(fabric(1), Duration::from_secs(60)).unwrap();
        assert_eq!(
            gc.arm_fail_safe(fabric(2), Duration::from_secs(60)),
            Err(CommissioningError::BusyWithOtherAdmin)
        );
        // The owner may extend.
        assert!(gc.arm_fail_safe(fabric(1), Duration::from_secs(90)).is_ok());
        assert!(gc.require_armed(fabric(1)).is_ok());
        assert_eq!(
            gc.require_armed(fabric(2)),
            Err(CommissioningError::FailSafeRequired)
        );
    }

    #[test]
    fn test_zero_expiry_expires_window() {
        let (mut ctx, mut timers) = make_context();
        {
            let mut gc = GeneralCommissioning::new(&mut ctx, &mut timers);
            gc.arm_fail_safe_default(fabric(1)).unwrap();
            let actions = gc.arm_fail_safe(fabric(1), Duration::ZERO).unwrap();
            assert!(actions
                .iter()
                .any(|a| matches!(a, Action::RollbackFailSafe(_))));
            assert_eq!(
                gc.arm_fail_safe(fabric(1), Duration::from_secs(60)),
                Err(CommissioningError::BusyWithOtherAdmin)
            );
            assert_eq!(
                gc.require_armed(fabric(1)),
                Err(CommissioningError::FailSafeRequired)
            );
        }
        assert_eq!(ctx.status(), FailSafeStatus::Busy);

        ctx.handle(&mut timers, Event::CleanupCompleted);
        assert!(ctx.is_fail_safe_fully_disarmed());
    }

    #[test]
    fn test_zero_expiry_while_disarmed_is_noop() {
        let (mut ctx, mut timers) = make_context();
        let mut gc = GeneralCommissioning::new(&mut ctx, &mut timers);
        assert_eq!(gc.arm_fail_safe(fabric(1), Duration::ZERO), Ok(vec![]));
    }

    #[test]
    fn test_default_expiry_is_used() {
        let (mut ctx, mut timers) = make_context();
        GeneralCommissioning::new(&mut ctx, &mut timers)
            .arm_fail_safe_default(fabric(3))
            .unwrap();
        let step = timers.pending_of(TimerKind::FailSafeStep).unwrap();
        assert_eq!(timers.duration_of(step), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_commissioning_complete() {
        let (mut ctx, mut timers) = make_context();
        let mut gc = GeneralCommissioning::new(&mut ctx, &mut timers);

        assert_eq!(
            gc.commissioning_complete(fabric(1)),
            Err(CommissioningError::NoFailSafe)
        );

        gc.arm_fail_safe(fabric(1), Duration::from_secs(60)).unwrap();
        assert_eq!(
            gc.commissioning_complete(fabric(2)),
            Err(CommissioningError::InvalidAuthentication)
        );

        gc.fail_safe.set_add_trusted_root_cert_invoked();
        gc.fail_safe.set_add_noc_command_invoked(fabric(1));

        let completed = gc.commissioning_complete(fabric(1)).unwrap();
        assert_eq!(completed.committed.fabric_index, fabric(1));
        assert!(completed.committed.flags.add_noc());
        assert_eq!(
            completed.actions,
            vec![Action::ArmedStateChanged { armed: false }]
        );
        assert!(ctx.is_fail_safe_fully_disarmed());
        assert!(!ctx.noc_command_has_been_invoked());
        // Completion ends the attempt; no ceiling is left to abort the next one.
        assert!(!ctx.is_cumulative_timer_running());
        assert_eq!(timers.pending_count(), 0);
    }

    #[test]
    fn test_timer_exhaustion_surfaces_as_failure() {
        let mut ctx = FailSafeContext::new(FailSafeConfig::default());
        let mut timers = ManualTimers::with_capacity(0);
        let err = GeneralCommissioning::new(&mut ctx, &mut timers)
            .arm_fail_safe(fabric(1), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(
            err,
            CommissioningError::FailSafe(FailSafeError::ResourceExhausted(_))
        ));
    }
}
