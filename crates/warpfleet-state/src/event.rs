//! Change events published by the store after every committed write.

use crate::types::ResourceKind;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    /// Created, or its spec/metadata was written.
    Applied,
    /// Only the status sub-resource changed.
    StatusUpdated,
    /// Removed from the store.
    Deleted,
}

/// A committed change to one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub op: ChangeOp,
}

impl ChangeEvent {
    /// The `{namespace}/{name}` key of the changed object.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
