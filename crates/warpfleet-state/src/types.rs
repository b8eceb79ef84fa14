//! Object types for the warpfleet state store.
//!
//! These types are the persisted shape of clusters, cluster groups,
//! configuration classes and upgrade groups. All types serialize to/from
//! camelCase JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Labels and annotations are ordered maps so serialized records are stable.
pub type Labels = BTreeMap<String, String>;

// ── Kinds & metadata ───────────────────────────────────────────────

/// The kinds of object held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Cluster,
    ClusterGroup,
    ClusterClass,
    UpgradeGroup,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Cluster => "Cluster",
            ResourceKind::ClusterGroup => "ClusterGroup",
            ResourceKind::ClusterClass => "ClusterClass",
            ResourceKind::UpgradeGroup => "UpgradeGroup",
        };
        f.write_str(s)
    }
}

/// Metadata common to every stored object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
    /// Bumped by the store on every successful write.
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped by the store on spec writes only.
    #[serde(default)]
    pub generation: u64,
    /// Unix timestamp (seconds) at which deletion was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_requested_at: Option<u64>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Add a label (builder style).
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Add an annotation (builder style).
    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// Build the composite key used by every table.
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }

    /// Whether deletion of this object has been requested.
    pub fn is_deleting(&self) -> bool {
        self.deletion_requested_at.is_some()
    }
}

/// Build a `{namespace}/{name}` key.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// An object the store knows how to persist.
pub trait Resource: Serialize + DeserializeOwned + Clone {
    const KIND: ResourceKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Carry over fields a spec writer must not overwrite (the status
    /// sub-resource) from the stored copy.
    fn preserve_status(&mut self, _stored: &Self) {}
}

/// Tri-state condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

// ── Cluster ───────────────────────────────────────────────────────

/// A member cluster, owned by an external provisioning system.
///
/// The rollout controller only ever rewrites `class_ref`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub metadata: ObjectMeta,
    /// Name of the cluster group this cluster belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Current configuration class. `None` means the cluster has no managed
    /// topology and is never a rollout member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_ref: Option<String>,
    /// Readiness as reported by the provisioning system.
    #[serde(default)]
    pub ready: ConditionStatus,
}

impl Cluster {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            group: None,
            class_ref: None,
            ready: ConditionStatus::Unknown,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready == ConditionStatus::True
    }
}

impl Resource for Cluster {
    const KIND: ResourceKind = ResourceKind::Cluster;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ── Cluster group ─────────────────────────────────────────────────

/// A named population of clusters. Its labels are what
/// `clusterGroupSelector` is evaluated against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroup {
    pub metadata: ObjectMeta,
}

impl ClusterGroup {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
        }
    }
}

impl Resource for ClusterGroup {
    const KIND: ResourceKind = ResourceKind::ClusterGroup;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ── Cluster class ─────────────────────────────────────────────────

/// A configuration revision clusters can be moved to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterClass {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl ClusterClass {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            revision: None,
        }
    }
}

impl Resource for ClusterClass {
    const KIND: ResourceKind = ResourceKind::ClusterClass;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ── Upgrade group ─────────────────────────────────────────────────

/// Desired state: every cluster matched by `targets` converges to
/// `class_name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeGroup {
    pub metadata: ObjectMeta,
    pub spec: UpgradeGroupSpec,
    #[serde(default)]
    pub status: UpgradeGroupStatus,
}

impl UpgradeGroup {
    pub fn new(namespace: &str, name: &str, spec: UpgradeGroupSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: UpgradeGroupStatus::default(),
        }
    }
}

impl Resource for UpgradeGroup {
    const KIND: ResourceKind = ResourceKind::UpgradeGroup;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn preserve_status(&mut self, stored: &Self) {
        self.status = stored.status.clone();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeGroupSpec {
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_strategy: Option<RolloutStrategy>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// One population of clusters within an upgrade group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,
    #[serde(default)]
    pub do_not_deploy: bool,
}

impl Target {
    /// Display name, defaulted from the target's position when unset.
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("target-{index:03}"),
        }
    }

    /// Whether the target constrains group membership at all.
    pub fn has_group_constraint(&self) -> bool {
        self.cluster_group.is_some() || self.cluster_group_selector.is_some()
    }
}

/// A label selector, either as an expression string
/// (`"tier=edge,env in (prod,staging)"`) or in structured form.
///
/// Selectors are validated when a matcher is built, not when the object is
/// stored, so a malformed selector fails only the target that carries it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LabelSelector {
    Expression(String),
    Match(MatchSelector),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MatchSelector {
    #[serde(default)]
    pub match_labels: Labels,
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    pub key: String,
    /// `In`, `NotIn`, `Exists` or `DoesNotExist`.
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

// ── Rollout strategy ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RolloutStrategyType {
    #[default]
    RollingUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    #[serde(rename = "type", default)]
    pub strategy_type: RolloutStrategyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

impl RolloutStrategy {
    pub fn rolling(max_rollouts: IntOrPercent) -> Self {
        Self {
            strategy_type: RolloutStrategyType::RollingUpdate,
            rolling_update: Some(RollingUpdate {
                max_rollouts: Some(max_rollouts),
                ..Default::default()
            }),
        }
    }
}

/// Rolling update parameters.
///
/// Only `max_rollouts` is enforced. `rollout_delay`, `max_failures` and the
/// retired `failure_action` are accepted so objects carrying them stay valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rollouts: Option<IntOrPercent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_delay: Option<IntOrPercent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<IntOrPercent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_action: Option<String>,
}

/// An absolute count or a percentage of the member set.
///
/// Serialized as a JSON integer (`2`) or a percentage string (`"25%"`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawIntOrPercent", into = "RawIntOrPercent")]
pub enum IntOrPercent {
    Count(u32),
    Percent(u32),
}

impl IntOrPercent {
    /// Resolve against a member-set size. Percentages round up.
    pub fn resolve(self, total: usize) -> usize {
        match self {
            IntOrPercent::Count(n) => n as usize,
            IntOrPercent::Percent(p) => (total * p as usize).div_ceil(100),
        }
    }
}

impl FromStr for IntOrPercent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let p: u32 = pct
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentage: {s:?}"))?;
            return Ok(IntOrPercent::Percent(p));
        }
        s.parse()
            .map(IntOrPercent::Count)
            .map_err(|_| format!("invalid count or percentage: {s:?}"))
    }
}

impl fmt::Display for IntOrPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntOrPercent::Count(n) => write!(f, "{n}"),
            IntOrPercent::Percent(p) => write!(f, "{p}%"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawIntOrPercent {
    Int(u32),
    Str(String),
}

impl TryFrom<RawIntOrPercent> for IntOrPercent {
    type Error = String;

    fn try_from(raw: RawIntOrPercent) -> Result<Self, Self::Error> {
        match raw {
            RawIntOrPercent::Int(n) => Ok(IntOrPercent::Count(n)),
            RawIntOrPercent::Str(s) => s.parse(),
        }
    }
}

impl From<IntOrPercent> for RawIntOrPercent {
    fn from(value: IntOrPercent) -> Self {
        match value {
            IntOrPercent::Count(n) => RawIntOrPercent::Int(n),
            pct @ IntOrPercent::Percent(_) => RawIntOrPercent::Str(pct.to_string()),
        }
    }
}

// ── Upgrade group status ──────────────────────────────────────────

/// Status sub-resource, written only by the rollout controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeGroupStatus {
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default)]
    pub targets: Vec<TargetStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl UpgradeGroupStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Rollout accounting for one target as of the last reconcile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub name: String,
    pub members: u32,
    pub up_to_date: u32,
    pub not_ready: u32,
    /// Deployable members still on another class after this pass's patches.
    pub pending: u32,
    pub do_not_deploy: bool,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Unix timestamp (seconds) of the last status flip.
    pub last_transition_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_or_percent_parses_both_forms() {
        assert_eq!("3".parse::<IntOrPercent>().unwrap(), IntOrPercent::Count(3));
        assert_eq!("25%".parse::<IntOrPercent>().unwrap(), IntOrPercent::Percent(25));
        assert!("x%".parse::<IntOrPercent>().is_err());
        assert!("-1".parse::<IntOrPercent>().is_err());
    }

    #[test]
    fn int_or_percent_resolves_rounding_up() {
        assert_eq!(IntOrPercent::Count(2).resolve(10), 2);
        assert_eq!(IntOrPercent::Percent(25).resolve(10), 3);
        assert_eq!(IntOrPercent::Percent(10).resolve(5), 1);
        assert_eq!(IntOrPercent::Percent(50).resolve(0), 0);
        assert_eq!(IntOrPercent::Percent(100).resolve(7), 7);
    }

    #[test]
    fn int_or_percent_json_shapes() {
        let count: IntOrPercent = serde_json::from_str("2").unwrap();
        assert_eq!(count, IntOrPercent::Count(2));
        let pct: IntOrPercent = serde_json::from_str("\"40%\"").unwrap();
        assert_eq!(pct, IntOrPercent::Percent(40));
        assert_eq!(serde_json::to_string(&pct).unwrap(), "\"40%\"");
        assert!(serde_json::from_str::<IntOrPercent>("\"lots\"").is_err());
    }

    #[test]
    fn upgrade_group_accepts_reserved_fields() {
        let json = r#"{
            "metadata": {"namespace": "fleet", "name": "ug"},
            "spec": {
                "className": "quick-start-v2",
                "rolloutStrategy": {
                    "type": "RollingUpdate",
                    "rollingUpdate": {
                        "maxRollouts": "20%",
                        "rolloutDelay": 30,
                        "maxFailures": 1,
                        "failureAction": "Pause"
                    }
                },
                "targets": [
                    {"clusterGroup": "prod", "clusterSelector": "tier=edge"},
                    {"clusterSelector": {"matchLabels": {"env": "dev"}}, "doNotDeploy": true}
                ]
            }
        }"#;
        let group: UpgradeGroup = serde_json::from_str(json).unwrap();
        let rolling = group.spec.rollout_strategy.unwrap().rolling_update.unwrap();
        assert_eq!(rolling.max_rollouts, Some(IntOrPercent::Percent(20)));
        assert_eq!(rolling.failure_action.as_deref(), Some("Pause"));
        assert_eq!(group.spec.targets.len(), 2);
        assert!(matches!(
            group.spec.targets[0].cluster_selector,
            Some(LabelSelector::Expression(_))
        ));
        assert!(matches!(
            group.spec.targets[1].cluster_selector,
            Some(LabelSelector::Match(_))
        ));
        assert!(group.spec.targets[1].do_not_deploy);
        assert_eq!(group.status, UpgradeGroupStatus::default());
    }

    #[test]
    fn target_name_defaults_positionally() {
        let unnamed = Target::default();
        assert_eq!(unnamed.display_name(0), "target-000");
        assert_eq!(unnamed.display_name(12), "target-012");

        let named = Target {
            name: Some("edge".to_string()),
            ..Default::default()
        };
        assert_eq!(named.display_name(3), "edge");
    }

    #[test]
    fn cluster_readiness_defaults_to_unknown() {
        let c: Cluster =
            serde_json::from_str(r#"{"metadata": {"namespace": "a", "name": "b"}}"#).unwrap();
        assert_eq!(c.ready, ConditionStatus::Unknown);
        assert!(!c.is_ready());
        assert!(c.class_ref.is_none());
    }
}
