//! Option structs for the session command surface
//!
//! All options have a `Default` and builder-style `with_*` setters.

use crate::types::{GeoCoordinates, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Options for `create_session`
#[derive(Clone, Debug, Default)]
pub struct CreateSessionOptions {
    /// Use this id instead of generating one; fails if it already exists
    pub session_id: Option<SessionId>,
    /// Absolute expiry, milliseconds since the epoch
    pub expires_at: Option<u64>,
    pub client_geo_coordinates: Option<GeoCoordinates>,
}

impl CreateSessionOptions {
    #[must_use]
    pub fn with_session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn with_client_geo_coordinates(mut self, geo: GeoCoordinates) -> Self {
        self.client_geo_coordinates = Some(geo);
        self
    }
}

/// How a session is acquired
///
/// * `allow_offloading = false` takes the exclusive hold: only one at a
///   time, and the session cannot start offloading while it is held.
/// * `allow_offloading = true` takes a shared hold that does not block
///   offloading.
/// * `allow_while_offloading` lets the acquisition succeed (read-only)
///   while the session is mid-offload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcquireSessionOptions {
    pub allow_offloading: bool,
    pub allow_while_offloading: bool,
}

impl AcquireSessionOptions {
    #[must_use]
    pub fn with_allow_offloading(mut self, allow: bool) -> Self {
        self.allow_offloading = allow;
        self
    }

    #[must_use]
    pub fn with_allow_while_offloading(mut self, allow: bool) -> Self {
        self.allow_while_offloading = allow;
        self
    }

    /// Whether this acquisition is the exclusive hold
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        !self.allow_offloading
    }
}

/// Options for offload start/confirm
#[derive(Clone, Copy, Debug, Default)]
pub struct OffloadSessionOptions {
    /// Start the offload even if an exclusive hold is live
    pub force: bool,
    /// Entries per streamed page; `None` uses the configured default
    pub page_size: Option<usize>,
}

impl OffloadSessionOptions {
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Options for onload at the destination
#[derive(Clone, Copy, Debug, Default)]
pub struct OnloadSessionOptions {
    /// Onload under a fresh id instead of the origin's id
    pub assign_new_id: bool,
}

impl OnloadSessionOptions {
    #[must_use]
    pub fn with_assign_new_id(mut self, assign: bool) -> Self {
        self.assign_new_id = assign;
        self
    }
}

/// Partial update of a session's metadata; `None` fields are left alone
#[derive(Clone, Debug, Default)]
pub struct SessionMetadataOptions {
    pub client_geo_coordinates: Option<GeoCoordinates>,
    pub expires_at: Option<u64>,
    /// Attributes to set; an empty value removes the attribute
    pub attributes: BTreeMap<String, String>,
}

impl SessionMetadataOptions {
    #[must_use]
    pub fn with_client_geo_coordinates(mut self, geo: GeoCoordinates) -> Self {
        self.client_geo_coordinates = Some(geo);
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Options for one garbage collection page
#[derive(Clone, Copy, Debug)]
pub struct GarbageCollectSessionsOptions {
    /// Session records visited per page
    pub page_size: usize,
    /// An offload or onload handshake older than this is orphaned
    pub orphan_timeout: Duration,
    /// How long an offloaded session keeps its redirect
    pub offloaded_retention: Duration,
    /// Evaluate expiry at this instant (ms since epoch); `None` = now
    pub now: Option<u64>,
}

impl Default for GarbageCollectSessionsOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            orphan_timeout: Duration::from_secs(60),
            offloaded_retention: Duration::from_secs(600),
            now: None,
        }
    }
}

impl GarbageCollectSessionsOptions {
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_now(mut self, now: u64) -> Self {
        self.now = Some(now);
        self
    }

    #[must_use]
    pub fn with_orphan_timeout(mut self, timeout: Duration) -> Self {
        self.orphan_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_offloaded_retention(mut self, retention: Duration) -> Self {
        self.offloaded_retention = retention;
        self
    }
}

/// A ranking criterion for offload targets; each one is a priority slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadCriterion {
    /// Node (subtree) with the lowest load ratio first
    LeastLoaded,
    /// Node closest to the session's client first
    ClosestToClient,
}

/// Options for the offload selector
#[derive(Clone, Debug)]
pub struct BestOffloadTargetsOptions {
    /// Maximum number of candidate sessions
    pub max_sessions: usize,
    /// Targets proposed per session and criterion
    pub max_targets_per_session: usize,
    /// Nodes whose load ratio is at or above this are never targets
    pub load_threshold: f64,
    /// Priority slots, in order
    pub criteria: Vec<OffloadCriterion>,
    /// Dimension used to rank candidate sessions by size
    pub size_dimension: Option<String>,
}

impl Default for BestOffloadTargetsOptions {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            max_targets_per_session: 1,
            load_threshold: 0.9,
            criteria: vec![OffloadCriterion::LeastLoaded, OffloadCriterion::ClosestToClient],
            size_dimension: None,
        }
    }
}

impl BestOffloadTargetsOptions {
    #[must_use]
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    #[must_use]
    pub fn with_criteria(mut self, criteria: Vec<OffloadCriterion>) -> Self {
        self.criteria = criteria;
        self
    }

    #[must_use]
    pub fn with_load_threshold(mut self, threshold: f64) -> Self {
        self.load_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_targets_per_session(mut self, max: usize) -> Self {
        self.max_targets_per_session = max;
        self
    }
}
