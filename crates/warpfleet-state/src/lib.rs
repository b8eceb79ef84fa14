//! warpfleet-state: embedded object store for warpfleet.
//!
//! Backed by [redb](https://docs.rs/redb), holds the declarative objects the
//! rollout controller reads and writes: clusters, cluster groups,
//! configuration classes and upgrade groups.
//!
//! # Architecture
//!
//! Every object is JSON-serialized into redb's `&[u8]` value columns under a
//! `{namespace}/{name}` key. Each write bumps the object's
//! `resource_version`; writers that pass an expected version get
//! compare-and-swap semantics and a [`StateError::Conflict`] when the object
//! moved underneath them.
//!
//! Successful writes are published as [`ChangeEvent`]s on a broadcast
//! channel so a controller can watch the store instead of polling it.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod event;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use event::{ChangeEvent, ChangeOp};
pub use store::{StateStore, epoch_secs};
pub use types::*;
