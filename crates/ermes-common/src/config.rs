//! Configuration types for Ermes
//!
//! Configuration is layered: built-in defaults, an optional TOML file,
//! then `ERMES__<SECTION>__<KEY>` environment variables.

use crate::error::{Error, Result};
use crate::options::{BestOffloadTargetsOptions, GarbageCollectSessionsOptions, OffloadCriterion};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for an Ermes node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and storage
    pub node: NodeConfig,
    /// Resource usage propagation
    pub aggregator: AggregatorConfig,
    /// Garbage collection sweeper
    pub gc: GcConfig,
    /// Offload streaming
    pub offload: OffloadConfig,
    /// Offload target selection
    pub selector: SelectorConfig,
}

impl Config {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix("ERMES")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Area name of this node in the infrastructure tree
    pub id: String,
    /// Directory of the session database
    pub data_dir: PathBuf,
    /// Infrastructure description (JSON area tree) loaded at startup
    pub infrastructure: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "ermes-node".to_string(),
            data_dir: PathBuf::from("/var/lib/ermes"),
            infrastructure: None,
        }
    }
}

impl NodeConfig {
    /// Path of the redb file inside the data directory
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("sessions.redb")
    }
}

/// Resource usage aggregation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Propagation period (milliseconds)
    pub interval_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { interval_ms: 5000 }
    }
}

impl AggregatorConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Garbage collection configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Sweep period (milliseconds)
    pub interval_ms: u64,
    /// Session records visited per page
    pub page_size: usize,
    /// Handshakes older than this are reclaimed (seconds)
    pub orphan_timeout_secs: u64,
    /// Redirect retention for offloaded sessions (seconds)
    pub offloaded_retention_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            page_size: 100,
            orphan_timeout_secs: 60,
            offloaded_retention_secs: 600,
        }
    }
}

impl GcConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Per-page options derived from this configuration
    #[must_use]
    pub fn options(&self) -> GarbageCollectSessionsOptions {
        GarbageCollectSessionsOptions {
            page_size: self.page_size,
            orphan_timeout: Duration::from_secs(self.orphan_timeout_secs),
            offloaded_retention: Duration::from_secs(self.offloaded_retention_secs),
            now: None,
        }
    }
}

/// Offload streaming configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Session entries per streamed page
    pub page_size: usize,
    /// Pages buffered between the loader and the consumer
    pub channel_capacity: usize,
    /// Offload planning period (milliseconds)
    pub interval_ms: u64,
    /// Local load ratio from which the node starts shedding sessions
    pub shed_load_ratio: f64,
    /// Most sessions moved by one planning round
    pub max_moves_per_tick: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            page_size: 256,
            channel_capacity: 4,
            interval_ms: 10_000,
            shed_load_ratio: 0.8,
            max_moves_per_tick: 4,
        }
    }
}

impl OffloadConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Offload target selection configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub max_sessions: usize,
    pub max_targets_per_session: usize,
    pub load_threshold: f64,
    pub criteria: Vec<OffloadCriterion>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        let defaults = BestOffloadTargetsOptions::default();
        Self {
            max_sessions: defaults.max_sessions,
            max_targets_per_session: defaults.max_targets_per_session,
            load_threshold: defaults.load_threshold,
            criteria: defaults.criteria,
        }
    }
}

impl SelectorConfig {
    #[must_use]
    pub fn options(&self) -> BestOffloadTargetsOptions {
        BestOffloadTargetsOptions {
            max_sessions: self.max_sessions,
            max_targets_per_session: self.max_targets_per_session,
            load_threshold: self.load_threshold,
            criteria: self.criteria.clone(),
            size_dimension: None,
        }
    }
}
