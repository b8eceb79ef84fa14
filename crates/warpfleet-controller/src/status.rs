//! Upgrade group status: per-target accounting and conditions.

use warpfleet_state::{Condition, ConditionStatus, TargetStatus};

pub const READY: &str = "Ready";
pub const PROGRESSING: &str = "Progressing";

pub mod reason {
    pub const ROLLOUT_COMPLETE: &str = "RolloutComplete";
    pub const ROLLOUT_IN_PROGRESS: &str = "RolloutInProgress";
    pub const ROLLOUT_BLOCKED: &str = "RolloutBlocked";
    pub const TARGET_ERROR: &str = "TargetError";
    pub const WAITING_FOR_SCHEDULE: &str = "WaitingForSchedule";
    pub const INVALID_SCHEDULE: &str = "InvalidSchedule";
}

/// Insert or replace a condition.
///
/// `last_transition_time` only moves when the status value flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: String,
    now: u64,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: now,
        }),
    }
}

/// Derive `Ready` and `Progressing` from the target statuses of a pass.
pub fn summarize(conditions: &mut Vec<Condition>, targets: &[TargetStatus], now: u64) {
    let failed: Vec<&str> = targets
        .iter()
        .filter(|t| t.error.is_some())
        .map(|t| t.name.as_str())
        .collect();
    let blocked = targets.iter().filter(|t| t.blocked).count();
    let pending: u32 = targets.iter().map(|t| t.pending).sum();

    let (ready, ready_reason, ready_message) = if !failed.is_empty() {
        (
            ConditionStatus::False,
            reason::TARGET_ERROR,
            format!("targets failed: {}", failed.join(", ")),
        )
    } else if blocked > 0 {
        (
            ConditionStatus::False,
            reason::ROLLOUT_BLOCKED,
            format!("{blocked} target(s) waiting for unavailable clusters to recover"),
        )
    } else if pending > 0 {
        (
            ConditionStatus::False,
            reason::ROLLOUT_IN_PROGRESS,
            format!("{pending} cluster(s) pending"),
        )
    } else {
        (
            ConditionStatus::True,
            reason::ROLLOUT_COMPLETE,
            "all targets converged".to_string(),
        )
    };
    set_condition(conditions, READY, ready, ready_reason, ready_message, now);

    let (progressing, progressing_reason) = if pending == 0 {
        (ConditionStatus::False, reason::ROLLOUT_COMPLETE)
    } else if blocked > 0 {
        (ConditionStatus::True, reason::ROLLOUT_BLOCKED)
    } else {
        (ConditionStatus::True, reason::ROLLOUT_IN_PROGRESS)
    };
    set_condition(
        conditions,
        PROGRESSING,
        progressing,
        progressing_reason,
        format!("{pending} cluster(s) pending"),
        now,
    );
}
