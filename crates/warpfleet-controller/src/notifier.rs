//! Change notifier: maps store events to the upgrade groups they affect.
//!
//! | changed object | enqueued groups (same namespace) |
//! |---|---|
//! | upgrade group applied or deleted | itself |
//! | upgrade group status | none, those are our own writes |
//! | cluster | groups whose class is the cluster's class, or with a target matching it |
//! | deleted or unreadable cluster | every group |
//! | cluster class | groups converging to that class |
//! | cluster group | groups with a target constrained by group |

use tracing::debug;

use warpfleet_rollout::{GroupIndex, TargetMatcher};
use warpfleet_state::{ChangeEvent, ChangeOp, Cluster, ResourceKind, StateResult, UpgradeGroup};

use crate::directory::{ClusterDirectory, UpgradeGroupStore};

/// Keys of the upgrade groups to reconcile after `event`.
pub fn affected_groups<D, S>(
    event: &ChangeEvent,
    directory: &D,
    groups: &S,
) -> StateResult<Vec<String>>
where
    D: ClusterDirectory + ?Sized,
    S: UpgradeGroupStore + ?Sized,
{
    let keys = match event.kind {
        ResourceKind::UpgradeGroup => match event.op {
            ChangeOp::StatusUpdated => Vec::new(),
            ChangeOp::Applied | ChangeOp::Deleted => vec![event.key()],
        },
        ResourceKind::Cluster => {
            let candidates = groups.list_upgrade_groups(Some(&event.namespace))?;
            let cluster = match event.op {
                ChangeOp::Deleted => None,
                _ => directory.get_cluster(&event.key())?,
            };
            match cluster {
                Some(cluster) => {
                    let cluster_groups = directory.list_cluster_groups(&event.namespace)?;
                    let index = GroupIndex::new(&cluster_groups);
                    keys_where(&candidates, |g| references_cluster(g, &cluster, &index))
                }
                None => keys_where(&candidates, |_| true),
            }
        }
        ResourceKind::ClusterClass => {
            let candidates = groups.list_upgrade_groups(Some(&event.namespace))?;
            keys_where(&candidates, |g| g.spec.class_name == event.name)
        }
        ResourceKind::ClusterGroup => {
            let candidates = groups.list_upgrade_groups(Some(&event.namespace))?;
            keys_where(&candidates, |g| {
                g.spec.targets.iter().any(|t| t.has_group_constraint())
            })
        }
    };

    debug!(
        kind = %event.kind,
        object = %event.key(),
        op = ?event.op,
        groups = keys.len(),
        "change mapped"
    );
    Ok(keys)
}

fn keys_where(groups: &[UpgradeGroup], pred: impl Fn(&UpgradeGroup) -> bool) -> Vec<String> {
    groups
        .iter()
        .filter(|g| pred(g))
        .map(|g| g.metadata.key())
        .collect()
}

/// Whether `group` converges `cluster`'s class or has a target matching it.
///
/// A target whose selectors do not compile counts as a match so the group
/// gets a pass that reports the error.
fn references_cluster(group: &UpgradeGroup, cluster: &Cluster, index: &GroupIndex<'_>) -> bool {
    if cluster.class_ref.as_deref() == Some(group.spec.class_name.as_str()) {
        return true;
    }
    group
        .spec
        .targets
        .iter()
        .enumerate()
        .any(|(i, target)| match TargetMatcher::new(target, i) {
            Ok(matcher) => matcher.matches_cluster(cluster, index),
            Err(_) => true,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use warpfleet_state::{
        ClusterClass, ClusterGroup, LabelSelector, ObjectMeta, StateStore, Target,
        UpgradeGroupSpec,
    };

    fn event(kind: ResourceKind, name: &str, op: ChangeOp) -> ChangeEvent {
        ChangeEvent {
            kind,
            namespace: "fleet".to_string(),
            name: name.to_string(),
            op,
        }
    }

    fn add_group(store: &StateStore, name: &str, class: &str, targets: Vec<Target>) {
        let spec = UpgradeGroupSpec {
            class_name: class.to_string(),
            rollout_strategy: None,
            targets,
        };
        store.create(&UpgradeGroup::new("fleet", name, spec)).unwrap();
    }

    fn selecting(selector: &str) -> Target {
        Target {
            cluster_selector: Some(LabelSelector::Expression(selector.to_string())),
            ..Default::default()
        }
    }

    fn map(store: &StateStore, event: &ChangeEvent) -> Vec<String> {
        affected_groups(event, store, store).unwrap()
    }

    fn fixture() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        add_group(&store, "by-class", "v2", vec![selecting("tier=none")]);
        add_group(&store, "by-target", "v3", vec![selecting("tier=edge")]);
        add_group(
            &store,
            "by-group",
            "v4",
            vec![Target {
                cluster_group: Some("prod".to_string()),
                ..Default::default()
            }],
        );
        store
    }

    #[test]
    fn own_status_writes_are_ignored() {
        let store = fixture();
        let e = event(ResourceKind::UpgradeGroup, "by-class", ChangeOp::StatusUpdated);
        assert!(map(&store, &e).is_empty());

        let e = event(ResourceKind::UpgradeGroup, "by-class", ChangeOp::Applied);
        assert_eq!(map(&store, &e), vec!["fleet/by-class"]);
    }

    #[test]
    fn cluster_maps_by_class_and_by_target() {
        let store = fixture();
        let mut cluster = Cluster::new("fleet", "c0");
        cluster.metadata = ObjectMeta::new("fleet", "c0").with_label("tier", "edge");
        cluster.class_ref = Some("v2".to_string());
        store.create(&cluster).unwrap();

        let e = event(ResourceKind::Cluster, "c0", ChangeOp::Applied);
        assert_eq!(map(&store, &e), vec!["fleet/by-class", "fleet/by-target"]);
    }

    #[test]
    fn deleted_cluster_maps_to_every_group() {
        let store = fixture();
        let e = event(ResourceKind::Cluster, "gone", ChangeOp::Deleted);
        assert_eq!(map(&store, &e).len(), 3);
    }

    #[test]
    fn class_change_maps_to_groups_converging_to_it() {
        let store = fixture();
        store.create(&ClusterClass::new("fleet", "v3")).unwrap();
        let e = event(ResourceKind::ClusterClass, "v3", ChangeOp::Applied);
        assert_eq!(map(&store, &e), vec!["fleet/by-target"]);
    }

    #[test]
    fn cluster_group_change_maps_to_group_constrained_targets() {
        let store = fixture();
        store.create(&ClusterGroup::new("fleet", "prod")).unwrap();
        let e = event(ResourceKind::ClusterGroup, "prod", ChangeOp::Applied);
        assert_eq!(map(&store, &e), vec!["fleet/by-group"]);
    }

    #[test]
    fn broken_targets_still_get_a_pass() {
        let store = StateStore::open_in_memory().unwrap();
        add_group(&store, "broken", "v9", vec![selecting("tier in (edge")]);
        let mut cluster = Cluster::new("fleet", "c0");
        cluster.class_ref = Some("v1".to_string());
        store.create(&cluster).unwrap();

        let e = event(ResourceKind::Cluster, "c0", ChangeOp::Applied);
        assert_eq!(map(&store, &e), vec!["fleet/broken"]);
    }
}
