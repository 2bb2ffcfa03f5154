//! Ermes Node - the session mobility node
//!
//! [`NodeService`] is the command surface of one node: session lifecycle,
//! offload/onload streaming, topology, resource usage and garbage
//! collection, all backed by an [`ermes_store::SessionStore`]. Background
//! work runs in its own loops:
//!
//! - [`ResourcesAggregator`] propagates usage figures up the tree and
//!   brings the parent's digest back down
//! - [`GarbageCollector`] sweeps expired and orphaned sessions page by page
//! - [`Offloader`] moves released and overflowing sessions to the targets
//!   the selector proposes
//!
//! [`LocalCluster`] wires several nodes together in one process, which is
//! how the scenario tests drive whole offload round trips.

pub mod aggregator;
pub mod cluster;
pub mod gc;
pub mod offloader;
pub mod selector;
pub mod service;
pub mod stream;
pub mod tasks;

pub use aggregator::{ParentLink, ResourcesAggregator};
pub use cluster::{LocalCluster, LocalNotifier, LocalOffloadLink, LocalParentLink};
pub use gc::GarbageCollector;
pub use offloader::{OffloadLink, OffloadRound, Offloader};
pub use selector::{TargetCandidate, rank_sessions, rank_targets};
pub use service::{LastVisitedNodeNotifier, NodeService};
pub use stream::{OffloadStream, OffloadTransfer, SessionHandoff};
pub use tasks::BackgroundTasks;

#[cfg(test)]
mod scenarios;
