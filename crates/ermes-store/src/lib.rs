//! Ermes Store - atomic session store backed by redb
//!
//! Every operation of the session mobility protocol runs as one redb
//! transaction against a single keyspace table, so no caller ever sees a
//! half-applied transition. redb serializes write transactions, which
//! gives the per-session ordering the protocol relies on without any
//! extra locking.
//!
//! The operations are grouped by concern:
//! - [`session`]: create, acquire/release, metadata, session data, scans
//! - [`offload`]: offload start/page/finish and the onload handshake
//! - [`topology`]: node registration and tree traversal
//! - [`lookup`]: the lookup-node directory
//! - [`resources`]: per-session and per-node usage, tree aggregation
//! - [`gc`]: cursor-resumable garbage collection pages

mod keys;
pub mod gc;
pub mod lookup;
pub mod offload;
pub mod resources;
pub mod session;
pub mod store;
pub mod tables;
pub mod topology;
pub mod types;

pub use resources::SubtreeUsage;
pub use store::{SessionStore, StoreError, StoreResult};
pub use types::{
    GcPage, GcReport, NodeUsage, OffloadData, OffloadPage, ReleaseOutcome, ResourcesDigest,
    ResourcesUsageUpdate, ScanPage, ScoredMember, SessionRecord, SessionValue,
};
