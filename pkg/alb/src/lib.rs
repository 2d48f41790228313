//! Reconciliation engine for Ingress-driven application load balancers.
//!
//! Every Ingress owns one tree: a load balancer, its target groups (one per backend
//! service) and its listeners, each listener owning the rules derived from the Ingress
//! paths. Each sync cycle the [`Engine`] rebuilds the desired trees, diffs them entity by
//! entity against what it created before, and sweeps trees whose Ingress disappeared.

pub mod desired;
pub mod engine;
pub mod error;
pub mod listener;
pub mod liveness;
pub mod load_balancer;
pub mod metered;
pub mod naming;
pub mod rule;
pub mod target_group;

pub use engine::{Engine, EngineConfig};
pub use error::{CycleReport, EntityFailure, ReconcileError};
