//! Upgrade group reconciler: one observe/plan/act pass.
//!
//! ```text
//! fetch group ──▶ gate ──▶ list clusters + groups (once)
//!                              │
//!            for each target:  ▼
//!              match members ──▶ plan ──▶ patch clusters one by one
//!                              │
//!                              ▼
//!                   write status if it changed ──▶ Action
//! ```
//!
//! Targets are independent. A bad selector or a failed patch is recorded
//! in that target's status and the remaining targets still run; the first
//! such error is returned once status is persisted. Patches already made
//! are never rolled back: the next pass plans from whatever the directory
//! holds then. Within a pass, later targets see the clusters earlier
//! targets patched.

use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use warpfleet_rollout::{GroupIndex, Member, RolloutPlan, TargetMatcher, plan_rollout};
use warpfleet_state::{
    Cluster, ConditionStatus, Target, TargetStatus, UpgradeGroup, UpgradeGroupStatus, epoch_secs,
};

use crate::cancel::Cancellation;
use crate::config::ControllerConfig;
use crate::directory::{ClusterDirectory, UpgradeGroupStore};
use crate::error::{ControllerError, ControllerResult};
use crate::gate::{self, Gate};
use crate::status::{self, READY, reason};

/// What the caller should do with the key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until something changes.
    AwaitChange,
    /// Run again after the delay.
    Requeue(Duration),
}

pub struct Reconciler<D, S> {
    directory: D,
    groups: S,
    config: ControllerConfig,
}

/// Result of evaluating one target.
struct TargetOutcome {
    status: TargetStatus,
    requeue: bool,
    error: Option<ControllerError>,
    /// Clusters as stored after this target's patches.
    patched: Vec<Cluster>,
}

impl TargetOutcome {
    fn done(status: TargetStatus, requeue: bool, patched: Vec<Cluster>) -> Self {
        Self {
            status,
            requeue,
            error: None,
            patched,
        }
    }

    fn failed(mut status: TargetStatus, error: ControllerError, patched: Vec<Cluster>) -> Self {
        if !error.is_cancelled() {
            status.error = Some(error.to_string());
        }
        Self {
            status,
            requeue: false,
            error: Some(error),
            patched,
        }
    }
}

impl<D: ClusterDirectory, S: UpgradeGroupStore> Reconciler<D, S> {
    pub fn new(directory: D, groups: S, config: ControllerConfig) -> Self {
        Self {
            directory,
            groups,
            config,
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn groups(&self) -> &S {
        &self.groups
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Reconcile the upgrade group stored under `key`.
    pub fn reconcile(&self, key: &str, cancel: &Cancellation) -> ControllerResult<Action> {
        let span = info_span!("reconcile", group = %key);
        let _enter = span.enter();

        let Some(group) = self.groups.get_upgrade_group(key)? else {
            debug!("upgrade group not found");
            return Ok(Action::Requeue(self.config.missing_requeue()));
        };

        if group.metadata.is_deleting() {
            debug!("upgrade group is being deleted, skipping");
            return Ok(Action::AwaitChange);
        }

        let now = epoch_secs();
        match gate::evaluate(&group.metadata.annotations, now) {
            Gate::Open => {}
            Gate::Closed {
                not_before,
                remaining,
            } => {
                debug!(not_before, remaining_secs = remaining.as_secs(), "activation gate closed");
                let mut next = group.status.clone();
                status::set_condition(
                    &mut next.conditions,
                    READY,
                    ConditionStatus::False,
                    reason::WAITING_FOR_SCHEDULE,
                    format!("rollout starts at {not_before}"),
                    now,
                );
                self.persist_status(&group, next, cancel)?;
                return Ok(Action::Requeue(remaining.min(self.config.gate_max_requeue())));
            }
            Gate::Invalid { value, reason: why } => {
                warn!(%value, reason = %why, "invalid activation annotation");
                let mut next = group.status.clone();
                status::set_condition(
                    &mut next.conditions,
                    READY,
                    ConditionStatus::False,
                    reason::INVALID_SCHEDULE,
                    format!("{} is not a unix timestamp: {value:?}", gate::NOT_BEFORE_ANNOTATION),
                    now,
                );
                self.persist_status(&group, next, cancel)?;
                return Err(ControllerError::InvalidSchedule { value, reason: why });
            }
        }

        let namespace = group.metadata.namespace.as_str();
        let mut clusters = self.directory.list_clusters(namespace)?;
        let cluster_groups = self.directory.list_cluster_groups(namespace)?;
        let index = GroupIndex::new(&cluster_groups);

        let mut targets = Vec::with_capacity(group.spec.targets.len());
        let mut requeue = false;
        let mut first_error: Option<ControllerError> = None;

        for (i, target) in group.spec.targets.iter().enumerate() {
            let outcome = self.reconcile_target(&group, target, i, &clusters, &index, cancel);
            refresh(&mut clusters, outcome.patched);
            requeue |= outcome.requeue;
            if let Some(err) = outcome.error {
                if err.is_cancelled() {
                    return Err(err);
                }
                first_error.get_or_insert(err);
            }
            targets.push(outcome.status);
        }

        let mut next = group.status.clone();
        next.observed_generation = group.metadata.generation;
        status::summarize(&mut next.conditions, &targets, now);
        next.targets = targets;
        let written = self.persist_status(&group, next, cancel)?;

        if let Some(err) = first_error {
            return Err(err);
        }
        if !written {
            // Status write raced with deletion.
            return Ok(Action::Requeue(self.config.missing_requeue()));
        }
        if requeue {
            return Ok(Action::Requeue(self.config.rollout_requeue()));
        }
        Ok(Action::AwaitChange)
    }

    fn reconcile_target(
        &self,
        group: &UpgradeGroup,
        target: &Target,
        index: usize,
        clusters: &[Cluster],
        groups: &GroupIndex<'_>,
        cancel: &Cancellation,
    ) -> TargetOutcome {
        let name = target.display_name(index);
        let span = info_span!("target", target = %name);
        let _enter = span.enter();

        let mut status = TargetStatus {
            name,
            do_not_deploy: target.do_not_deploy,
            ..Default::default()
        };

        let matcher = match TargetMatcher::new(target, index) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "target selectors do not compile");
                return TargetOutcome::failed(status, e.into(), Vec::new());
            }
        };

        let members: Vec<Member<'_>> = matcher
            .resolve_members(clusters, groups)
            .into_iter()
            .map(|c| Member::new(c, matcher.do_not_deploy()))
            .collect();
        if members.is_empty() {
            debug!("no member clusters");
            return TargetOutcome::done(status, false, Vec::new());
        }

        let plan = plan_rollout(
            &members,
            &group.spec.class_name,
            group.spec.rollout_strategy.as_ref(),
        );
        let (patched, error) = self.apply(&plan, cancel);
        fill_status(&mut status, &plan, patched.len());

        if plan.blocked {
            info!(
                not_ready = plan.tally.not_ready,
                pending = status.pending,
                "rollout blocked by unavailable clusters"
            );
        } else if plan.is_complete() {
            debug!(members = plan.tally.members, "target converged");
        }

        match error {
            Some(err) => TargetOutcome::failed(status, err, patched),
            None => TargetOutcome::done(status, plan.requeue, patched),
        }
    }

    /// Patch clusters in plan order, stopping at the first failure.
    fn apply(
        &self,
        plan: &RolloutPlan,
        cancel: &Cancellation,
    ) -> (Vec<Cluster>, Option<ControllerError>) {
        let mut patched = Vec::with_capacity(plan.mutations.len());
        for mutation in &plan.mutations {
            if let Err(e) = cancel.check() {
                return (patched, Some(e));
            }
            match self.directory.patch_cluster_class(
                &mutation.key,
                mutation.resource_version,
                &mutation.to_class,
            ) {
                Ok(cluster) => {
                    patched.push(cluster);
                    info!(
                        cluster = %mutation.key,
                        from = mutation.from_class.as_deref().unwrap_or(""),
                        to = %mutation.to_class,
                        "cluster class updated"
                    );
                }
                Err(e) => {
                    warn!(
                        cluster = %mutation.key,
                        error = %e,
                        skipped = plan.mutations.len() - patched.len() - 1,
                        "cluster patch failed, aborting target"
                    );
                    return (patched, Some(e.into()));
                }
            }
        }
        (patched, None)
    }

    /// Write `next` as the group's status unless nothing changed.
    ///
    /// Returns false when the group vanished before the write.
    fn persist_status(
        &self,
        group: &UpgradeGroup,
        next: UpgradeGroupStatus,
        cancel: &Cancellation,
    ) -> ControllerResult<bool> {
        if next == group.status {
            return Ok(true);
        }
        cancel.check()?;

        let mut updated = group.clone();
        updated.status = next;
        match self.groups.update_status(&updated) {
            Ok(stored) => {
                debug!(version = stored.metadata.resource_version, "status written");
                Ok(true)
            }
            Err(e) => match ControllerError::from(e) {
                ControllerError::NotFound(_) => {
                    debug!("upgrade group deleted before status write");
                    Ok(false)
                }
                err => Err(err),
            },
        }
    }
}

/// Replace snapshot entries with their patched versions.
fn refresh(clusters: &mut [Cluster], patched: Vec<Cluster>) {
    for cluster in patched {
        let key = cluster.metadata.key();
        if let Some(slot) = clusters.iter_mut().find(|c| c.metadata.key() == key) {
            *slot = cluster;
        }
    }
}

fn fill_status(status: &mut TargetStatus, plan: &RolloutPlan, applied: usize) {
    let tally = &plan.tally;
    let unapplied = plan.mutations.len() - applied;
    status.members = count(tally.members);
    status.up_to_date = count(tally.members - tally.needs_update + applied);
    status.not_ready = count(tally.not_ready);
    status.pending = count(plan.pending_after() + unapplied);
    status.blocked = plan.blocked;
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PROGRESSING;
    use warpfleet_state::{
        ClusterGroup, IntOrPercent, ObjectMeta, RolloutStrategy, StateStore, UpgradeGroupSpec,
    };

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn add_cluster(store: &StateStore, name: &str, class: &str, ready: ConditionStatus) {
        let cluster = Cluster {
            metadata: ObjectMeta::new("fleet", name),
            group: None,
            class_ref: Some(class.to_string()),
            ready,
        };
        store.create(&cluster).unwrap();
    }

    fn add_group(store: &StateStore, spec: UpgradeGroupSpec) -> UpgradeGroup {
        store
            .create(&UpgradeGroup::new("fleet", "ug", spec))
            .unwrap()
    }

    fn spec(strategy: Option<RolloutStrategy>) -> UpgradeGroupSpec {
        UpgradeGroupSpec {
            class_name: "v2".to_string(),
            rollout_strategy: strategy,
            targets: vec![Target::default()],
        }
    }

    fn reconciler(store: &StateStore) -> Reconciler<StateStore, StateStore> {
        Reconciler::new(store.clone(), store.clone(), ControllerConfig::default())
    }

    fn classes(store: &StateStore) -> Vec<String> {
        store
            .list_in::<Cluster>("fleet")
            .unwrap()
            .into_iter()
            .map(|c| c.class_ref.unwrap_or_default())
            .collect()
    }

    #[test]
    fn missing_group_requeues_without_error() {
        let store = store();
        let action = reconciler(&store)
            .reconcile("fleet/ghost", &Cancellation::never())
            .unwrap();
        assert_eq!(action, Action::Requeue(Duration::from_secs(300)));
    }

    #[test]
    fn unlimited_rollout_updates_every_member() {
        let store = store();
        for i in 0..5 {
            add_cluster(&store, &format!("c{i}"), "v1", ConditionStatus::True);
        }
        add_group(&store, spec(None));

        let action = reconciler(&store)
            .reconcile("fleet/ug", &Cancellation::never())
            .unwrap();
        assert_eq!(action, Action::AwaitChange);
        assert!(classes(&store).iter().all(|c| c == "v2"));

        let group: UpgradeGroup = store.get("fleet/ug").unwrap().unwrap();
        let target = &group.status.targets[0];
        assert_eq!(target.name, "target-000");
        assert_eq!(target.members, 5);
        assert_eq!(target.up_to_date, 5);
        assert_eq!(target.pending, 0);
        assert_eq!(
            group.status.condition(READY).unwrap().status,
            ConditionStatus::True
        );
    }

    #[test]
    fn converged_group_writes_status_once() {
        let store = store();
        add_cluster(&store, "c0", "v2", ConditionStatus::True);
        add_group(&store, spec(None));
        let r = reconciler(&store);

        r.reconcile("fleet/ug", &Cancellation::never()).unwrap();
        let first: UpgradeGroup = store.get("fleet/ug").unwrap().unwrap();
        r.reconcile("fleet/ug", &Cancellation::never()).unwrap();
        let second: UpgradeGroup = store.get("fleet/ug").unwrap().unwrap();

        assert_eq!(
            first.metadata.resource_version,
            second.metadata.resource_version
        );
    }

    #[test]
    fn limited_rollout_requeues() {
        let store = store();
        for i in 0..4 {
            add_cluster(&store, &format!("c{i}"), "v1", ConditionStatus::True);
        }
        add_group(
            &store,
            spec(Some(RolloutStrategy::rolling(IntOrPercent::Count(1)))),
        );

        let action = reconciler(&store)
            .reconcile("fleet/ug", &Cancellation::never())
            .unwrap();
        assert_eq!(action, Action::Requeue(Duration::from_secs(15)));
        assert_eq!(classes(&store), vec!["v2", "v1", "v1", "v1"]);

        let group: UpgradeGroup = store.get("fleet/ug").unwrap().unwrap();
        assert_eq!(group.status.targets[0].pending, 3);
        assert_eq!(
            group.status.condition(PROGRESSING).unwrap().status,
            ConditionStatus::True
        );
    }

    #[test]
    fn deleting_group_is_left_alone() {
        let store = store();
        add_cluster(&store, "c0", "v1", ConditionStatus::True);
        add_group(&store, spec(None));
        store.request_deletion::<UpgradeGroup>("fleet/ug").unwrap();

        let action = reconciler(&store)
            .reconcile("fleet/ug", &Cancellation::never())
            .unwrap();
        assert_eq!(action, Action::AwaitChange);
        assert_eq!(classes(&store), vec!["v1"]);
    }

    #[test]
    fn expired_deadline_writes_nothing() {
        let store = store();
        add_cluster(&store, "c0", "v1", ConditionStatus::True);
        let created = add_group(&store, spec(None));

        let cancel = Cancellation::with_deadline(std::time::Instant::now());
        let err = reconciler(&store).reconcile("fleet/ug", &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(classes(&store), vec!["v1"]);

        let group: UpgradeGroup = store.get("fleet/ug").unwrap().unwrap();
        assert_eq!(
            group.metadata.resource_version,
            created.metadata.resource_version
        );
    }

    #[test]
    fn listing_is_scoped_to_the_group_namespace() {
        let store = store();
        add_cluster(&store, "c0", "v1", ConditionStatus::True);
        let mut other = Cluster::new("elsewhere", "c0");
        other.class_ref = Some("v1".to_string());
        store.create(&other).unwrap();
        store.create(&ClusterGroup::new("fleet", "prod")).unwrap();
        add_group(&store, spec(None));

        reconciler(&store)
            .reconcile("fleet/ug", &Cancellation::never())
            .unwrap();
        let untouched: Cluster = store.get("elsewhere/c0").unwrap().unwrap();
        assert_eq!(untouched.class_ref.as_deref(), Some("v1"));
        assert_eq!(classes(&store), vec!["v2"]);
    }
}
