//! Client side of the runner.

use crate::runner::{Command, RunnerMessage};
use crate::RunnerError;
use commission_core::{FailSafeCleanup, InvocationFlags};
use commission_failsafe::FailSafeStatus;
use commission_types::FabricIndex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// A credential command recorded against the open window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latch {
    /// AddNOC staged `new_fabric`; the window now answers to it.
    AddNoc { new_fabric: FabricIndex },
    UpdateNoc,
    AddTrustedRoot,
    /// CSRRequest, and whether it was issued for an UpdateNOC.
    CsrRequest { for_update_noc: bool },
    UpdateTermsAndConditions,
    SetVidVerificationStatement,
    #[cfg(feature = "joint-fabric")]
    AddIcac,
}

/// Point-in-time view of the fail-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailSafeSnapshot {
    pub status: FailSafeStatus,
    /// Owner of the window, only while armed.
    pub fabric_index: Option<FabricIndex>,
    pub flags: InvocationFlags,
    pub cumulative_timer_running: bool,
    pub outstanding_timers: usize,
}

/// Cloneable handle to a running [`FailSafeRunner`](crate::FailSafeRunner).
///
/// Every call is a message to the runner task. Calls made from one task are
/// processed in the order they were made.
#[derive(Clone)]
pub struct FailSafeHandle {
    sender: mpsc::UnboundedSender<RunnerMessage>,
    status: watch::Receiver<FailSafeStatus>,
}

impl FailSafeHandle {
    pub(crate) fn new(
        sender: mpsc::UnboundedSender<RunnerMessage>,
        status: watch::Receiver<FailSafeStatus>,
    ) -> Self {
        Self { sender, status }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RunnerError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(RunnerMessage::Command(build(reply)))
            .map_err(|_| RunnerError::Closed)?;
        response.await.map_err(|_| RunnerError::Closed)
    }

    /// ArmFailSafe from `fabric_index`. A zero expiry aborts the window.
    pub async fn arm_fail_safe(
        &self,
        fabric_index: FabricIndex,
        expiry: Duration,
    ) -> Result<(), RunnerError> {
        Ok(self
            .request(|reply| Command::Arm {
                fabric_index,
                expiry: Some(expiry),
                reply,
            })
            .await??)
    }

    /// ArmFailSafe with the configured default expiry.
    pub async fn arm_fail_safe_default(&self, fabric_index: FabricIndex) -> Result<(), RunnerError> {
        Ok(self
            .request(|reply| Command::Arm {
                fabric_index,
                expiry: None,
                reply,
            })
            .await??)
    }

    /// CommissioningComplete from `fabric_index`.
    ///
    /// Returns what the window installed; committing it is up to the caller.
    pub async fn commissioning_complete(
        &self,
        fabric_index: FabricIndex,
    ) -> Result<FailSafeCleanup, RunnerError> {
        Ok(self
            .request(|reply| Command::Complete {
                fabric_index,
                reply,
            })
            .await??)
    }

    /// Record `latch` for a command issued by `fabric_index`.
    ///
    /// Refused unless the window is armed and owned by `fabric_index`.
    pub async fn record(&self, fabric_index: FabricIndex, latch: Latch) -> Result<(), RunnerError> {
        Ok(self
            .request(|reply| Command::Record {
                fabric_index,
                latch,
                reply,
            })
            .await??)
    }

    /// Clean disarm.
    pub async fn disarm(&self) -> Result<(), RunnerError> {
        self.request(|reply| Command::Disarm { reply }).await
    }

    /// Take the abort path now.
    pub async fn force_expiry(&self) -> Result<(), RunnerError> {
        self.request(|reply| Command::ForceExpiry { reply }).await
    }

    pub async fn snapshot(&self) -> Result<FailSafeSnapshot, RunnerError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the runner. Outstanding timers are dropped.
    pub async fn shutdown(&self) -> Result<(), RunnerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Last status published by the runner.
    pub fn status(&self) -> FailSafeStatus {
        *self.status.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe(&self) -> watch::Receiver<FailSafeStatus> {
        self.status.clone()
    }
}
