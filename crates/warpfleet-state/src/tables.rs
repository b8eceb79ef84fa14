//! redb table definitions for the warpfleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized objects).
//! Keys follow the pattern `{namespace}/{name}`.

use redb::TableDefinition;

/// Cluster records keyed by `{namespace}/{name}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Cluster groups keyed by `{namespace}/{name}`.
pub const CLUSTER_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_groups");

/// Configuration classes keyed by `{namespace}/{name}`.
pub const CLUSTER_CLASSES: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_classes");

/// Upgrade groups keyed by `{namespace}/{name}`.
pub const UPGRADE_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("upgrade_groups");
