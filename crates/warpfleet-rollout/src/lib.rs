//! warpfleet-rollout: deciding which clusters move to a new class.
//!
//! Everything in this crate is pure computation over an in-memory snapshot
//! of the object store: no I/O, no clocks, no async.
//!
//! # Components
//!
//! - **`selector`**: label selector parsing and evaluation
//! - **`matcher`**: resolves a target to its member clusters
//! - **`strategy`**: resolves a rollout strategy against a member count
//! - **`planner`**: the rollout engine: budget math and the mutation plan

pub mod error;
pub mod matcher;
pub mod planner;
pub mod selector;
pub mod strategy;

pub use error::{RolloutError, SelectorError};
pub use matcher::{GroupIndex, TargetMatcher};
pub use planner::{
    ClusterMutation, Member, RolloutPlan, RolloutTally, plan_rollout, plan_with_limits,
};
pub use selector::Selector;
pub use strategy::RolloutLimits;
