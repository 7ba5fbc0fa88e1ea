//! Invocation latches and the cleanup snapshot handed to rollback logic.

use commission_types::FabricIndex;
use serde::{Deserialize, Serialize};

/// Which sensitive operations happened during the current armed window.
///
/// Every latch except the CSR marker only ever moves from `false` to `true`.
/// There is deliberately no way to clear a single latch: the fail-safe
/// replaces the whole set with `InvocationFlags::default()` when it resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationFlags {
    add_noc: bool,
    update_noc: bool,
    add_trusted_root: bool,
    // Whether a CSR happened at all is tracked by the credential store.
    csr_for_update_noc: bool,
    update_terms_and_conditions: bool,
    set_vid_verification_statement: bool,
    #[cfg(feature = "joint-fabric")]
    add_icac: bool,
}

impl InvocationFlags {
    /// Create an empty set of latches.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_add_noc(&mut self) {
        self.add_noc = true;
    }

    pub fn record_update_noc(&mut self) {
        self.update_noc = true;
    }

    pub fn record_add_trusted_root(&mut self) {
        self.add_trusted_root = true;
    }

    /// Record whether the most recent CSR was requested for an UpdateNOC.
    pub fn set_csr_for_update_noc(&mut self, is_for_update_noc: bool) {
        self.csr_for_update_noc = is_for_update_noc;
    }

    pub fn record_update_terms_and_conditions(&mut self) {
        self.update_terms_and_conditions = true;
    }

    pub fn record_set_vid_verification_statement(&mut self) {
        self.set_vid_verification_statement = true;
    }

    #[cfg(feature = "joint-fabric")]
    pub fn record_add_icac(&mut self) {
        self.add_icac = true;
    }

    pub fn add_noc(&self) -> bool {
        self.add_noc
    }

    pub fn update_noc(&self) -> bool {
        self.update_noc
    }

    /// True if either AddNOC or UpdateNOC was invoked.
    pub fn any_noc(&self) -> bool {
        self.add_noc || self.update_noc
    }

    pub fn add_trusted_root(&self) -> bool {
        self.add_trusted_root
    }

    pub fn csr_for_update_noc(&self) -> bool {
        self.csr_for_update_noc
    }

    pub fn update_terms_and_conditions(&self) -> bool {
        self.update_terms_and_conditions
    }

    pub fn set_vid_verification_statement(&self) -> bool {
        self.set_vid_verification_statement
    }

    #[cfg(feature = "joint-fabric")]
    pub fn add_icac(&self) -> bool {
        self.add_icac
    }

    /// True if no latch is set.
    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }

    /// Copy of these latches with the NOC latches replaced.
    ///
    /// Used to build cleanup snapshots whose NOC history is dictated by the
    /// caller scheduling the cleanup.
    pub fn with_noc_latches(mut self, add_noc: bool, update_noc: bool) -> Self {
        self.add_noc = add_noc;
        self.update_noc = update_noc;
        self
    }
}

/// Snapshot of an expiring window, taken as the fail-safe enters `Busy`.
///
/// Rollback collaborators read the window through this snapshot rather than
/// through the live context: once `Busy`, the context no longer answers
/// fabric-scoped queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailSafeCleanup {
    /// Fabric that owned the window (or was targeted by AddNOC).
    pub fabric_index: FabricIndex,
    /// Latches recorded during the window.
    pub flags: InvocationFlags,
}

impl FailSafeCleanup {
    /// Derive the rollback steps this window requires.
    pub fn rollback_plan(&self) -> RollbackPlan {
        let flags = &self.flags;
        let fabric = self.fabric_index;

        RollbackPlan {
            // A fabric added under the fail-safe never became permanent.
            remove_fabric: flags.add_noc().then_some(fabric),
            // Sessions established with the provisional credentials must go.
            expire_sessions: flags.any_noc().then_some(fabric),
            revert_pending_update: flags.update_noc(),
            // Removing a fabric also removes its root, so only a dangling
            // root needs its own step.
            revert_trusted_root: flags.add_trusted_root() && !flags.add_noc(),
            revert_terms_and_conditions: flags.update_terms_and_conditions(),
            revert_vid_verification_statement: flags.set_vid_verification_statement(),
            #[cfg(feature = "joint-fabric")]
            revert_icac: flags.add_icac(),
        }
    }
}

/// Rollback steps derived from a [`FailSafeCleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackPlan {
    /// Delete this fabric from the fabric table.
    pub remove_fabric: Option<FabricIndex>,
    /// Expire all secure sessions on this fabric.
    pub expire_sessions: Option<FabricIndex>,
    /// Discard a pending operational certificate update.
    pub revert_pending_update: bool,
    /// Discard a trusted root added without a matching NOC.
    pub revert_trusted_root: bool,
    /// Restore the previously accepted terms and conditions.
    pub revert_terms_and_conditions: bool,
    /// Restore the previous VID verification statement.
    pub revert_vid_verification_statement: bool,
    /// Discard a pending intermediate CA certificate.
    #[cfg(feature = "joint-fabric")]
    pub revert_icac: bool,
}

impl RollbackPlan {
    /// True if the window left nothing behind to roll back.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
