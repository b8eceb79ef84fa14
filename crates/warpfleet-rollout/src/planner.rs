//! Rollout engine: decides which members move to the desired class.
//!
//! ```text
//! needs_update = members whose class != desired
//! not_ready    = members whose readiness is not True
//!
//! needs_update == 0            → complete, nothing to do
//! no eligible member           → complete, held back by doNotDeploy
//! max_rollouts unset           → move every eligible member
//! budget = max_rollouts - not_ready
//! budget <= 0                  → blocked, requeue
//! otherwise                    → move up to `budget` eligible members,
//!                                requeue if eligible members remain
//! ```
//!
//! Eligible means: needs an update and its target is not `doNotDeploy`.
//! Members are taken in snapshot order; readiness does not reorder them.
//! Clusters moved in one pass are expected to turn not-ready while the
//! change is applied, which shrinks the next pass's budget.

use tracing::debug;

use warpfleet_state::{Cluster, RolloutStrategy};

use crate::strategy::RolloutLimits;

/// A matched cluster as seen by the engine.
#[derive(Debug, Clone, Copy)]
pub struct Member<'a> {
    pub cluster: &'a Cluster,
    /// Counted but never mutated.
    pub do_not_deploy: bool,
}

impl<'a> Member<'a> {
    pub fn new(cluster: &'a Cluster, do_not_deploy: bool) -> Self {
        Self {
            cluster,
            do_not_deploy,
        }
    }

    fn needs_update(&self, desired_class: &str) -> bool {
        self.cluster.class_ref.as_deref() != Some(desired_class)
    }
}

/// One class-reference write the reconciler should perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMutation {
    /// `{namespace}/{name}` of the cluster.
    pub key: String,
    pub name: String,
    /// Version observed when planning; the patch is conditional on it.
    pub resource_version: u64,
    pub from_class: Option<String>,
    pub to_class: String,
}

/// Member accounting for one target. The counts overlap: a cluster can be
/// both `needs_update` and `not_ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RolloutTally {
    pub members: usize,
    pub needs_update: usize,
    pub ready: usize,
    pub not_ready: usize,
    /// Members needing an update that are held back by `doNotDeploy`.
    pub do_not_deploy: usize,
}

/// Outcome of one planning pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RolloutPlan {
    pub mutations: Vec<ClusterMutation>,
    /// No mutations because the unavailability budget is used up.
    pub blocked: bool,
    /// The target needs another pass after these mutations land.
    pub requeue: bool,
    /// Budget available this pass, when a limit is configured.
    pub budget: Option<usize>,
    pub tally: RolloutTally,
}

impl RolloutPlan {
    /// Every member already runs the desired class.
    pub fn is_complete(&self) -> bool {
        self.tally.needs_update == 0
    }

    /// Deployable members still on another class once this plan is applied.
    pub fn pending_after(&self) -> usize {
        self.tally
            .needs_update
            .saturating_sub(self.tally.do_not_deploy)
            .saturating_sub(self.mutations.len())
    }
}

/// Plan one rollout pass for a target's members.
///
/// Pure and infallible; applying the mutations is the caller's job.
pub fn plan_rollout(
    members: &[Member<'_>],
    desired_class: &str,
    strategy: Option<&RolloutStrategy>,
) -> RolloutPlan {
    let limits = RolloutLimits::resolve(strategy, members.len());
    plan_with_limits(members, desired_class, limits)
}

/// [`plan_rollout`] with already-resolved limits.
pub fn plan_with_limits(
    members: &[Member<'_>],
    desired_class: &str,
    limits: RolloutLimits,
) -> RolloutPlan {
    let tally = tally(members, desired_class);

    if tally.needs_update == tally.do_not_deploy {
        return RolloutPlan {
            tally,
            ..Default::default()
        };
    }

    let mut eligible = members
        .iter()
        .filter(|m| !m.do_not_deploy && m.needs_update(desired_class))
        .peekable();

    let Some(max_rollouts) = limits.max_rollouts else {
        let mutations: Vec<_> = eligible.map(|m| mutation(m, desired_class)).collect();
        debug!(
            desired = %desired_class,
            count = mutations.len(),
            "no rollout limit, updating all eligible members"
        );
        return RolloutPlan {
            mutations,
            tally,
            ..Default::default()
        };
    };

    if max_rollouts <= tally.not_ready {
        debug!(
            max_rollouts,
            not_ready = tally.not_ready,
            "rollout blocked, unavailability budget exhausted"
        );
        return RolloutPlan {
            blocked: true,
            requeue: true,
            budget: Some(0),
            tally,
            ..Default::default()
        };
    }

    let budget = max_rollouts - tally.not_ready;
    let mutations: Vec<_> = eligible
        .by_ref()
        .take(budget)
        .map(|m| mutation(m, desired_class))
        .collect();
    let more_remaining = eligible.peek().is_some();

    debug!(
        max_rollouts,
        budget,
        count = mutations.len(),
        more_remaining,
        "rollout batch planned"
    );

    RolloutPlan {
        mutations,
        blocked: false,
        requeue: more_remaining,
        budget: Some(budget),
        tally,
    }
}

fn tally(members: &[Member<'_>], desired_class: &str) -> RolloutTally {
    let mut tally = RolloutTally {
        members: members.len(),
        ..Default::default()
    };
    for m in members {
        if m.cluster.is_ready() {
            tally.ready += 1;
        } else {
            tally.not_ready += 1;
        }
        if m.needs_update(desired_class) {
            tally.needs_update += 1;
            if m.do_not_deploy {
                tally.do_not_deploy += 1;
            }
        }
    }
    tally
}

fn mutation(member: &Member<'_>, desired_class: &str) -> ClusterMutation {
    let meta = &member.cluster.metadata;
    ClusterMutation {
        key: meta.key(),
        name: meta.name.clone(),
        resource_version: meta.resource_version,
        from_class: member.cluster.class_ref.clone(),
        to_class: desired_class.to_string(),
    }
}
