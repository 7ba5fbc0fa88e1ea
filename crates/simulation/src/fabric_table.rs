//! In-memory fabric table used as the simulation's rollback collaborator.

use commission_core::{FailSafeCleanup, FailSafeRollback, RollbackPlan};
use commission_types::FabricIndex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Simulated fabric and session state of a device.
///
/// Credential commands stage their effects as pending data; the pending data
/// becomes permanent on commit and disappears on rollback.
#[derive(Debug, Default)]
pub struct SimFabricTable {
    /// Fabrics that survived a commissioning complete.
    committed: BTreeSet<FabricIndex>,
    /// Fabric added by AddNOC, not yet committed.
    pending_fabric: Option<FabricIndex>,
    /// Fabric whose credentials an UpdateNOC replaced, not yet committed.
    pending_update: Option<FabricIndex>,
    /// A trusted root staged by AddTrustedRootCertificate.
    pending_root: bool,
    /// Open secure sessions per fabric.
    sessions: BTreeMap<FabricIndex, u32>,
    /// Rollbacks applied so far.
    rollbacks: Vec<FailSafeCleanup>,
}

impl SimFabricTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table that already holds committed fabrics.
    pub fn with_committed(fabrics: impl IntoIterator<Item = FabricIndex>) -> Self {
        Self {
            committed: fabrics.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn stage_trusted_root(&mut self) {
        self.pending_root = true;
    }

    pub fn stage_fabric(&mut self, fabric_index: FabricIndex) {
        self.pending_fabric = Some(fabric_index);
    }

    pub fn stage_update(&mut self, fabric_index: FabricIndex) {
        self.pending_update = Some(fabric_index);
    }

    pub fn open_session(&mut self, fabric_index: FabricIndex) {
        *self.sessions.entry(fabric_index).or_default() += 1;
    }

    /// Make all pending data permanent.
    pub fn commit(&mut self) {
        if let Some(fabric_index) = self.pending_fabric.take() {
            info!(fabric = %fabric_index, "Committed new fabric");
            self.committed.insert(fabric_index);
        }
        self.pending_update = None;
        self.pending_root = false;
    }

    pub fn is_committed(&self, fabric_index: FabricIndex) -> bool {
        self.committed.contains(&fabric_index)
    }

    /// True if anything is staged and uncommitted.
    pub fn has_pending(&self) -> bool {
        self.pending_fabric.is_some() || self.pending_update.is_some() || self.pending_root
    }

    /// Fabric staged by AddNOC.
    pub fn pending_fabric(&self) -> Option<FabricIndex> {
        self.pending_fabric
    }

    pub fn session_count(&self, fabric_index: FabricIndex) -> u32 {
        self.sessions.get(&fabric_index).copied().unwrap_or(0)
    }

    /// Every rollback applied, oldest first.
    pub fn rollbacks(&self) -> &[FailSafeCleanup] {
        &self.rollbacks
    }
}

impl FailSafeRollback for SimFabricTable {
    fn rollback(&mut self, cleanup: &FailSafeCleanup, plan: &RollbackPlan) {
        if let Some(fabric_index) = plan.remove_fabric {
            if self.pending_fabric == Some(fabric_index) {
                self.pending_fabric = None;
            }
            self.committed.remove(&fabric_index);
            debug!(fabric = %fabric_index, "Removed fabric added under fail-safe");
        }
        if let Some(fabric_index) = plan.expire_sessions {
            let expired = self.sessions.remove(&fabric_index).unwrap_or(0);
            debug!(fabric = %fabric_index, expired, "Expired sessions");
        }
        if plan.revert_pending_update {
            self.pending_update = None;
        }
        if plan.revert_trusted_root {
            self.pending_root = false;
        }

        // Whatever the plan says, nothing staged survives an expired window.
        self.pending_fabric = None;
        self.pending_update = None;
        self.pending_root = false;

        info!(fabric = %cleanup.fabric_index, "Rolled back fail-safe window");
        self.rollbacks.push(*cleanup);
    }
}
