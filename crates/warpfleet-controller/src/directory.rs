//! The reconciler's view of the object store.
//!
//! Each trait exposes only what the controller is allowed to do: read
//! clusters and patch their class, read upgrade groups and write their
//! status.

use warpfleet_state::{Cluster, ClusterGroup, StateResult, StateStore, UpgradeGroup};

pub trait ClusterDirectory: Send + Sync {
    /// Clusters of a namespace in listing order.
    fn list_clusters(&self, namespace: &str) -> StateResult<Vec<Cluster>>;

    fn list_cluster_groups(&self, namespace: &str) -> StateResult<Vec<ClusterGroup>>;

    fn get_cluster(&self, key: &str) -> StateResult<Option<Cluster>>;

    /// Set a cluster's class reference if it is still at `expected_version`.
    fn patch_cluster_class(
        &self,
        key: &str,
        expected_version: u64,
        class_name: &str,
    ) -> StateResult<Cluster>;
}

pub trait UpgradeGroupStore: Send + Sync {
    fn get_upgrade_group(&self, key: &str) -> StateResult<Option<UpgradeGroup>>;

    /// Every upgrade group, or those of one namespace.
    fn list_upgrade_groups(&self, namespace: Option<&str>) -> StateResult<Vec<UpgradeGroup>>;

    /// Write `group.status` if the stored group is still at
    /// `group.metadata.resource_version`.
    fn update_status(&self, group: &UpgradeGroup) -> StateResult<UpgradeGroup>;
}

impl ClusterDirectory for StateStore {
    fn list_clusters(&self, namespace: &str) -> StateResult<Vec<Cluster>> {
        self.list_in(namespace)
    }

    fn list_cluster_groups(&self, namespace: &str) -> StateResult<Vec<ClusterGroup>> {
        self.list_in(namespace)
    }

    fn get_cluster(&self, key: &str) -> StateResult<Option<Cluster>> {
        self.get(key)
    }

    fn patch_cluster_class(
        &self,
        key: &str,
        expected_version: u64,
        class_name: &str,
    ) -> StateResult<Cluster> {
        StateStore::patch_cluster_class(self, key, expected_version, class_name)
    }
}

impl UpgradeGroupStore for StateStore {
    fn get_upgrade_group(&self, key: &str) -> StateResult<Option<UpgradeGroup>> {
        self.get(key)
    }

    fn list_upgrade_groups(&self, namespace: Option<&str>) -> StateResult<Vec<UpgradeGroup>> {
        match namespace {
            Some(ns) => self.list_in(ns),
            None => self.list(),
        }
    }

    fn update_status(&self, group: &UpgradeGroup) -> StateResult<UpgradeGroup> {
        StateStore::update_status(self, group)
    }
}
