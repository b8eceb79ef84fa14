//! StateStore: redb-backed object persistence for warpfleet.
//!
//! Provides typed get/list/create/update/delete over every [`Resource`]
//! kind, plus the two narrow writes the rollout controller performs:
//! patching a cluster's class reference and replacing an upgrade group's
//! status. Every write is a read-compare-write inside one redb write
//! transaction, so a version check and the write that follows it are atomic.
//!
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::event::{ChangeEvent, ChangeOp};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Capacity of the change-event channel. Slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 1024;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

fn table_for(kind: ResourceKind) -> Table {
    match kind {
        ResourceKind::Cluster => CLUSTERS,
        ResourceKind::ClusterGroup => CLUSTER_GROUPS,
        ResourceKind::ClusterClass => CLUSTER_CLASSES,
        ResourceKind::UpgradeGroup => UPGRADE_GROUPS,
    }
}

/// Which part of an object a compare-and-swap write touches.
enum WriteScope {
    Spec,
    Status,
}

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<ChangeEvent>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(CLUSTER_GROUPS).map_err(map_err!(Table))?;
        txn.open_table(CLUSTER_CLASSES).map_err(map_err!(Table))?;
        txn.open_table(UPGRADE_GROUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to committed changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    fn publish(&self, kind: ResourceKind, meta: &ObjectMeta, op: ChangeOp) {
        // No subscribers is not an error.
        let _ = self.events.send(ChangeEvent {
            kind,
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            op,
        });
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get an object by `{namespace}/{name}` key.
    pub fn get<T: Resource>(&self, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(table_for(T::KIND))
            .map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let obj: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// List every object of a kind, in key order.
    pub fn list<T: Resource>(&self) -> StateResult<Vec<T>> {
        self.scan(None)
    }

    /// List the objects of a kind in one namespace, in key order.
    pub fn list_in<T: Resource>(&self, namespace: &str) -> StateResult<Vec<T>> {
        self.scan(Some(&format!("{namespace}/")))
    }

    fn scan<T: Resource>(&self, prefix: Option<&str>) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(table_for(T::KIND))
            .map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if prefix.is_some_and(|p| !key.value().starts_with(p)) {
                continue;
            }
            let obj: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(obj);
        }
        Ok(results)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert a new object. Fails if the key is taken.
    ///
    /// The stored copy starts at resource version 1 and generation 1; the
    /// incoming version fields are ignored.
    pub fn create<T: Resource>(&self, obj: &T) -> StateResult<T> {
        let key = obj.meta().key();
        let now = epoch_secs();
        let mut stored = obj.clone();
        {
            let meta = stored.meta_mut();
            meta.resource_version = 1;
            meta.generation = 1;
            meta.created_at = now;
            meta.updated_at = now;
        }
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(kind = %T::KIND, %key, "object created");
        self.publish(T::KIND, stored.meta(), ChangeOp::Applied);
        Ok(stored)
    }

    /// Replace an object's spec and metadata.
    ///
    /// `obj.meta().resource_version` is the expected version: the write is
    /// rejected with [`StateError::Conflict`] if the stored copy moved. The
    /// status sub-resource of the stored copy is kept.
    pub fn update<T: Resource>(&self, obj: &T) -> StateResult<T> {
        let key = obj.meta().key();
        let expected = obj.meta().resource_version;
        let incoming = obj.clone();
        self.compare_and_swap(&key, Some(expected), WriteScope::Spec, |stored: &mut T| {
            let mut next = incoming;
            next.preserve_status(stored);
            let meta = next.meta_mut();
            meta.created_at = stored.meta().created_at;
            meta.generation = stored.meta().generation;
            meta.resource_version = stored.meta().resource_version;
            *stored = next;
        })
    }

    /// Replace an upgrade group's status.
    ///
    /// `group.metadata.resource_version` is the expected version. Spec and
    /// metadata of the stored copy are left untouched and the generation
    /// does not move.
    pub fn update_status(&self, group: &UpgradeGroup) -> StateResult<UpgradeGroup> {
        let key = group.metadata.key();
        let expected = group.metadata.resource_version;
        let status = group.status.clone();
        self.compare_and_swap(
            &key,
            Some(expected),
            WriteScope::Status,
            |stored: &mut UpgradeGroup| stored.status = status,
        )
    }

    /// Point a cluster at a new configuration class.
    ///
    /// This is the only cluster field the rollout controller writes. The
    /// patch is rejected if the cluster's resource version is no longer
    /// `expected_version`.
    pub fn patch_cluster_class(
        &self,
        key: &str,
        expected_version: u64,
        class_name: &str,
    ) -> StateResult<Cluster> {
        let class_name = class_name.to_string();
        self.compare_and_swap(
            key,
            Some(expected_version),
            WriteScope::Spec,
            |stored: &mut Cluster| stored.class_ref = Some(class_name),
        )
    }

    /// Mark an object for deletion without removing it.
    pub fn request_deletion<T: Resource>(&self, key: &str) -> StateResult<T> {
        let now = epoch_secs();
        self.compare_and_swap(key, None, WriteScope::Spec, |stored: &mut T| {
            stored.meta_mut().deletion_requested_at.get_or_insert(now);
        })
    }

    /// Delete an object by key. Returns true if it existed.
    pub fn delete<T: Resource>(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed: Option<Vec<u8>>;
        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            removed = table
                .remove(key)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec());
        }
        txn.commit().map_err(map_err!(Transaction))?;

        let existed = removed.is_some();
        if let Some(bytes) = removed {
            let obj: T = serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            self.publish(T::KIND, obj.meta(), ChangeOp::Deleted);
        }
        debug!(kind = %T::KIND, %key, existed, "object deleted");
        Ok(existed)
    }

    /// Read, check version, mutate and write back in one write transaction.
    fn compare_and_swap<T, F>(
        &self,
        key: &str,
        expected: Option<u64>,
        scope: WriteScope,
        mutate: F,
    ) -> StateResult<T>
    where
        T: Resource,
        F: FnOnce(&mut T),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored: T;
        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(key.to_string()))?;
            let mut obj: T = serde_json::from_slice(&current).map_err(map_err!(Deserialize))?;

            let actual = obj.meta().resource_version;
            if let Some(expected) = expected
                && expected != actual
            {
                return Err(StateError::Conflict {
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }

            mutate(&mut obj);
            let meta = obj.meta_mut();
            meta.resource_version = actual + 1;
            meta.updated_at = epoch_secs();
            if matches!(scope, WriteScope::Spec) {
                meta.generation += 1;
            }

            let value = serde_json::to_vec(&obj).map_err(map_err!(Serialize))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
            stored = obj;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        let op = match scope {
            WriteScope::Spec => ChangeOp::Applied,
            WriteScope::Status => ChangeOp::StatusUpdated,
        };
        debug!(
            kind = %T::KIND,
            %key,
            version = stored.meta().resource_version,
            "object written"
        );
        self.publish(T::KIND, stored.meta(), op);
        Ok(stored)
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
