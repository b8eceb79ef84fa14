//! Rollout strategy resolution.
//!
//! A strategy is stored as integer-or-percentage quantities; the engine
//! needs plain counts for the member set it is looking at right now.

use tracing::debug;

use warpfleet_state::{RolloutStrategy, RolloutStrategyType};

/// Limits in force for one evaluation of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RolloutLimits {
    /// Cap on members simultaneously not ready. `None` means unlimited.
    pub max_rollouts: Option<usize>,
}

impl RolloutLimits {
    /// No concurrency limit: update everything eligible in one pass.
    pub fn unlimited() -> Self {
        Self { max_rollouts: None }
    }

    /// Resolve `strategy` against a member set of `members` clusters.
    ///
    /// `rolloutDelay` and `maxFailures` are accepted but not enforced.
    pub fn resolve(strategy: Option<&RolloutStrategy>, members: usize) -> Self {
        let Some(strategy) = strategy else {
            return Self::unlimited();
        };
        let rolling = match strategy.strategy_type {
            RolloutStrategyType::RollingUpdate => strategy.rolling_update.as_ref(),
        };
        let Some(rolling) = rolling else {
            return Self::unlimited();
        };

        if rolling.rollout_delay.is_some() || rolling.max_failures.is_some() {
            debug!(
                rollout_delay = ?rolling.rollout_delay,
                max_failures = ?rolling.max_failures,
                "reserved rolling update fields are not enforced"
            );
        }

        Self {
            max_rollouts: rolling.max_rollouts.map(|q| q.resolve(members)),
        }
    }
}
