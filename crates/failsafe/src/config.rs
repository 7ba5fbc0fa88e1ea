//! Configuration for the fail-safe.

use crate::FailSafeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing limits for the fail-safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailSafeConfig {
    /// Upper bound for a single arm.
    ///
    /// Longer requests are clamped to this value.
    pub per_step_max: Duration,

    /// Upper bound for total armed time across re-arms of one attempt.
    pub cumulative_max: Duration,

    /// Expiry used when a caller arms without naming a duration.
    pub default_expiry: Duration,
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        Self {
            per_step_max: Duration::from_secs(900),
            cumulative_max: Duration::from_secs(900),
            // Conservative initial arm used by commissioners.
            default_expiry: Duration::from_secs(60),
        }
    }
}

impl FailSafeConfig {
    /// Create a config with the given per-step and cumulative limits.
    pub fn new(per_step_max: Duration, cumulative_max: Duration) -> Self {
        Self {
            per_step_max,
            cumulative_max,
            ..Default::default()
        }
    }

    /// Set the per-step limit.
    pub fn with_per_step_max(mut self, per_step_max: Duration) -> Self {
        self.per_step_max = per_step_max;
        self
    }

    /// Set the cumulative limit.
    pub fn with_cumulative_max(mut self, cumulative_max: Duration) -> Self {
        self.cumulative_max = cumulative_max;
        self
    }

    /// Set the default expiry.
    pub fn with_default_expiry(mut self, default_expiry: Duration) -> Self {
        self.default_expiry = default_expiry;
        self
    }

    /// Check the limits are coherent.
    ///
    /// # Errors
    ///
    /// Returns [`FailSafeError::InvalidConfig`] if the cumulative ceiling is
    /// zero or if either per-step duration exceeds it.
    pub fn validate(&self) -> Result<(), FailSafeError> {
        if self.cumulative_max.is_zero() {
            return Err(FailSafeError::InvalidConfig(
                "cumulative_max must be non-zero".to_string(),
            ));
        }
        if self.per_step_max > self.cumulative_max {
            return Err(FailSafeError::InvalidConfig(format!(
                "per_step_max {:?} exceeds cumulative_max {:?}",
                self.per_step_max, self.cumulative_max
            )));
        }
        if self.default_expiry > self.per_step_max {
            return Err(FailSafeError::InvalidConfig(format!(
                "default_expiry {:?} exceeds per_step_max {:?}",
                self.default_expiry, self.per_step_max
            )));
        }
        Ok(())
    }

    /// Clamp a requested arm duration to the per-step limit.
    pub fn clamp_expiry(&self, requested: Duration) -> Duration {
        requested.min(self.per_step_max)
    }
}
