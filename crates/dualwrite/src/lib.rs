//! Duet dual writer: routes each logical storage operation to the legacy and
//! unified backends according to the resource's configured migration mode.
//!
//! The routing table is built once from [`StorageConfig`] and never changes
//! for the life of the process; switching a mode means building new writers.

#![forbid(unsafe_code)]

pub mod config;
pub mod conflict;
pub mod mode;
pub mod reconcile;
pub mod replicate;
pub mod writer;

pub use config::{ConfigError, ResourceConfig, StorageConfig};
pub use conflict::{ConflictDetector, Verdict};
pub use mode::{ConflictPolicy, RoutingPolicy, RoutingTable};
pub use reconcile::{ReconcileItem, ReconcileQueue};
pub use replicate::{replicate, ReplicaAction};
pub use writer::{DualWriter, ShadowStatus, Written};
