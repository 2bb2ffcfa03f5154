//! Core type definitions for Ermes
//!
//! This module defines the fundamental types used throughout the system:
//! session identifiers, session locations, client coordinates and the
//! resource usage maps rolled up through the node tree.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Length of a session id (hyphenated UUID).
pub const SESSION_ID_LEN: usize = 36;

/// Identifier of a node in the infrastructure tree (its area name).
pub type NodeId = String;

/// Unique identifier for a session
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session ID
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a session id (validates the 36 character layout)
    pub fn parse(id: impl Into<String>) -> Result<Self, SessionIdError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the session id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), SessionIdError> {
        if id.len() != SESSION_ID_LEN {
            return Err(SessionIdError::InvalidLength(id.len()));
        }
        if let Some(c) = id.chars().find(|c| !c.is_ascii_graphic() || *c == ':') {
            return Err(SessionIdError::InvalidChar(c));
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when parsing a session id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionIdError {
    #[error("session id must be 36 characters long, got {0}")]
    InvalidLength(usize),
    #[error("session id contains invalid character: {0:?}")]
    InvalidChar(char),
}

/// Where a session currently lives: the host node and the id the session
/// is known by on that host.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionLocation {
    pub host: NodeId,
    pub session_id: String,
}

impl SessionLocation {
    #[must_use]
    pub fn new(host: impl Into<NodeId>, session_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.session_id, self.host)
    }
}

/// Geographic coordinates of a client or a node
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoCoordinates {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometres (haversine).
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Usage figures per caller-defined dimension (cpu, memory, ...).
///
/// Aggregation is a per-dimension sum, so it is associative and
/// commutative and can be folded in any order up the node tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcesUsage(BTreeMap<String, f64>);

impl ResourcesUsage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter for a dimension.
    #[must_use]
    pub fn with(mut self, dimension: impl Into<String>, value: f64) -> Self {
        self.0.insert(dimension.into(), value);
        self
    }

    pub fn set(&mut self, dimension: impl Into<String>, value: f64) {
        self.0.insert(dimension.into(), value);
    }

    #[must_use]
    pub fn get(&self, dimension: &str) -> f64 {
        self.0.get(dimension).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn dimensions(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add every dimension of `other` into `self`.
    pub fn add(&mut self, other: &Self) {
        for (dimension, value) in &other.0 {
            *self.0.entry(dimension.clone()).or_insert(0.0) += value;
        }
    }

    /// Subtract every dimension of `other` from `self`, clamping at zero.
    pub fn subtract(&mut self, other: &Self) {
        for (dimension, value) in &other.0 {
            let entry = self.0.entry(dimension.clone()).or_insert(0.0);
            *entry = (*entry - value).max(0.0);
        }
    }

    /// Sum of any number of usages.
    pub fn sum<'a>(usages: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut total = Self::new();
        for usage in usages {
            total.add(usage);
        }
        total
    }

    /// Highest usage/capacity ratio over the dimensions that have a
    /// capacity. Dimensions without capacity are ignored.
    #[must_use]
    pub fn load_ratio(&self, capacity: &Self) -> f64 {
        capacity
            .dimensions()
            .filter(|(_, cap)| *cap > 0.0)
            .map(|(dimension, cap)| self.get(dimension) / cap)
            .fold(0.0, f64::max)
    }
}

impl FromIterator<(String, f64)> for ResourcesUsage {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Lifecycle state of a session record on a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Held locally and usable
    Active,
    /// Payload is being streamed to another node
    Offloading,
    /// Moved away; only the redirect remains
    Offloaded,
    /// Being received from another node
    Onloading,
}

impl SessionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Offloading => "offloading",
            Self::Offloaded => "offloaded",
            Self::Onloading => "onloading",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side record of a session, updatable independently of acquisitions
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub client_geo_coordinates: Option<GeoCoordinates>,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub attributes: BTreeMap<String, String>,
}

/// What the selector knows about a session when ranking offload candidates
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfoForOffloadDecision {
    pub session_id: SessionId,
    pub client_geo_coordinates: Option<GeoCoordinates>,
    pub resources_usage: ResourcesUsage,
    pub created_at: u64,
    /// Milliseconds since the session was last acquired or released
    pub idle_ms: u64,
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
