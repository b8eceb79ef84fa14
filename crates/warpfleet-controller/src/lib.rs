//! warpfleet-controller: drives upgrade groups to convergence.
//!
//! # Architecture
//!
//! ```text
//! store events ──▶ notifier ──▶ work queue ──▶ workers ──▶ reconciler
//!                                   ▲                          │
//!                                   └──── requeue / backoff ───┘
//! ```
//!
//! The reconciler is synchronous and works through two narrow traits,
//! [`ClusterDirectory`] and [`UpgradeGroupStore`], so it can only read
//! objects, patch a cluster's class and write upgrade group status.
//! The [`Controller`] owns the async side: it runs reconciles on the
//! blocking pool, one key at a time per upgrade group.

pub mod cancel;
pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod gate;
pub mod notifier;
pub mod queue;
pub mod reconciler;
pub mod status;

pub use cancel::Cancellation;
pub use config::ControllerConfig;
pub use controller::Controller;
pub use directory::{ClusterDirectory, UpgradeGroupStore};
pub use error::{ControllerError, ControllerResult};
pub use queue::WorkQueue;
pub use reconciler::{Action, Reconciler};
