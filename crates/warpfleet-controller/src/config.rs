//! Controller tuning knobs, read from the `[controller]` config section.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Concurrent reconciles across different upgrade groups.
    pub workers: usize,
    pub reconcile_timeout_secs: u64,
    /// Delay before the next pass of a budget-limited rollout.
    pub rollout_requeue_secs: u64,
    /// Delay before rechecking an upgrade group that was not found.
    pub missing_requeue_secs: u64,
    /// Upper bound on a single wait for the activation time.
    pub gate_max_requeue_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    /// Period of the full re-enqueue of every upgrade group.
    pub resync_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            reconcile_timeout_secs: 30,
            rollout_requeue_secs: 15,
            missing_requeue_secs: 300,
            gate_max_requeue_secs: 300,
            backoff_base_ms: 500,
            backoff_max_secs: 300,
            resync_interval_secs: 600,
        }
    }
}

impl ControllerConfig {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn rollout_requeue(&self) -> Duration {
        Duration::from_secs(self.rollout_requeue_secs)
    }

    pub fn missing_requeue(&self) -> Duration {
        Duration::from_secs(self.missing_requeue_secs)
    }

    pub fn gate_max_requeue(&self) -> Duration {
        Duration::from_secs(self.gate_max_requeue_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("controller.workers must be at least 1".to_string());
        }
        if self.reconcile_timeout_secs == 0 {
            return Err("controller.reconcile_timeout_secs must be positive".to_string());
        }
        if self.resync_interval_secs == 0 {
            return Err("controller.resync_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}
