//! Target matcher: which clusters belong to a target.
//!
//! Constraints are ANDed in this order: group name and group selector
//! (against the labels of the cluster's group), cluster selector (against
//! the cluster's own labels), exact cluster name. A cluster without a class
//! reference is never a member of anything.

use std::collections::HashMap;

use warpfleet_state::{Cluster, ClusterGroup, LabelSelector, Labels, Target};

use crate::error::RolloutError;
use crate::selector::Selector;

static NO_LABELS: Labels = Labels::new();

/// Group name → group labels, built once per directory snapshot.
pub struct GroupIndex<'a> {
    labels: HashMap<&'a str, &'a Labels>,
}

impl<'a> GroupIndex<'a> {
    pub fn new(groups: &'a [ClusterGroup]) -> Self {
        Self {
            labels: groups
                .iter()
                .map(|g| (g.metadata.name.as_str(), &g.metadata.labels))
                .collect(),
        }
    }

    /// Labels of a group; a group with no record has no labels.
    pub fn labels(&self, group: &str) -> &Labels {
        self.labels.get(group).copied().unwrap_or(&NO_LABELS)
    }
}

/// A target with its selectors compiled.
#[derive(Debug, Clone)]
pub struct TargetMatcher {
    name: String,
    cluster_name: Option<String>,
    cluster_group: Option<String>,
    group_selector: Option<Selector>,
    cluster_selector: Option<Selector>,
    do_not_deploy: bool,
}

impl TargetMatcher {
    /// Compile `target`, the `index`-th target of its upgrade group.
    ///
    /// Fails with [`RolloutError::Configuration`] naming the target when a
    /// selector is malformed.
    pub fn new(target: &Target, index: usize) -> Result<Self, RolloutError> {
        let name = target.display_name(index);
        let compile = |selector: &Option<LabelSelector>| {
            selector
                .as_ref()
                .map(Selector::compile)
                .transpose()
                .map_err(|source| RolloutError::Configuration {
                    target: name.clone(),
                    source,
                })
        };
        let group_selector = compile(&target.cluster_group_selector)?;
        let cluster_selector = compile(&target.cluster_selector)?;

        Ok(Self {
            name: name.clone(),
            cluster_name: target.cluster_name.clone(),
            cluster_group: target.cluster_group.clone(),
            group_selector,
            cluster_selector,
            do_not_deploy: target.do_not_deploy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn do_not_deploy(&self) -> bool {
        self.do_not_deploy
    }

    pub fn has_group_constraint(&self) -> bool {
        self.cluster_group.is_some() || self.group_selector.is_some()
    }

    /// Evaluate the target against one cluster's identity and labels.
    pub fn matches(
        &self,
        cluster_name: &str,
        cluster_group: Option<&str>,
        group_labels: &Labels,
        cluster_labels: &Labels,
    ) -> bool {
        if self.has_group_constraint() {
            let Some(group) = cluster_group else {
                return false;
            };
            if self.cluster_group.as_deref().is_some_and(|want| want != group) {
                return false;
            }
            if self
                .group_selector
                .as_ref()
                .is_some_and(|sel| !sel.matches(group_labels))
            {
                return false;
            }
        }

        if self
            .cluster_selector
            .as_ref()
            .is_some_and(|sel| !sel.matches(cluster_labels))
        {
            return false;
        }

        self.cluster_name
            .as_deref()
            .is_none_or(|want| want == cluster_name)
    }

    /// Evaluate the target against a stored cluster.
    pub fn matches_cluster(&self, cluster: &Cluster, groups: &GroupIndex<'_>) -> bool {
        if cluster.class_ref.is_none() {
            return false;
        }
        let group = cluster.group.as_deref();
        let group_labels = group.map(|g| groups.labels(g)).unwrap_or(&NO_LABELS);
        self.matches(
            &cluster.metadata.name,
            group,
            group_labels,
            &cluster.metadata.labels,
        )
    }

    /// Members of this target in snapshot order.
    pub fn resolve_members<'c>(
        &self,
        clusters: &'c [Cluster],
        groups: &GroupIndex<'_>,
    ) -> Vec<&'c Cluster> {
        clusters
            .iter()
            .filter(|c| self.matches_cluster(c, groups))
            .collect()
    }
}
