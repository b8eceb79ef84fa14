//! Reconcile error types.

use thiserror::Error;

use warpfleet_rollout::RolloutError;
use warpfleet_state::StateError;

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Why a reconcile pass did not finish cleanly.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// An object disappeared mid-pass.
    #[error("not found: {0}")]
    NotFound(String),

    /// A target's selectors do not compile.
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] RolloutError),

    /// The activation annotation is not a unix timestamp.
    #[error("invalid schedule {value:?}: {reason}")]
    InvalidSchedule { value: String, reason: String },

    /// The directory or group store failed a read or write.
    #[error("directory error: {0}")]
    Directory(StateError),

    /// A compare-and-swap write lost against a concurrent writer.
    #[error("concurrency conflict: {0}")]
    Conflict(StateError),

    /// The pass ran past its deadline or the daemon is stopping.
    #[error("reconcile cancelled: {0}")]
    Cancelled(&'static str),
}

impl ControllerError {
    /// Errors that a retry cannot fix without a spec change.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ControllerError::InvalidTarget(_) | ControllerError::InvalidSchedule { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ControllerError::Cancelled(_))
    }
}

impl From<StateError> for ControllerError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(key) => ControllerError::NotFound(key),
            err @ StateError::Conflict { .. } => ControllerError::Conflict(err),
            err => ControllerError::Directory(err),
        }
    }
}
