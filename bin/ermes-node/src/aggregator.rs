//! Background resource usage propagation.
//!
//! Every tick a node sends its subtree figures to its parent and stores the
//! digest the parent answers with. Failures are logged and counted; the
//! next tick simply tries again.

use crate::service::NodeService;
use async_trait::async_trait;
use ermes_common::Result;
use ermes_store::{ResourcesDigest, ResourcesUsageUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection from a node to its parent in the tree
#[async_trait]
pub trait ParentLink: Send + Sync {
    /// Deliver one bottom-up update; the parent answers with its digest.
    async fn send_usage_update(&self, update: ResourcesUsageUpdate) -> Result<ResourcesDigest>;
}

/// Periodic bottom-up/top-down usage exchange for one node
pub struct ResourcesAggregator {
    service: Arc<NodeService>,
    parent: Option<Arc<dyn ParentLink>>,
}

impl ResourcesAggregator {
    /// `parent` is `None` on the root, which has nobody to report to.
    pub fn new(service: Arc<NodeService>, parent: Option<Arc<dyn ParentLink>>) -> Self {
        Self { service, parent }
    }

    /// One propagation round. Returns how many digest figures were stored.
    pub async fn tick(&self) -> Result<usize> {
        let stored = match &self.parent {
            Some(parent) => {
                let update = self.service.resources_usage_update_to_parent()?;
                let reported = update.nodes.len();
                let digest = parent.send_usage_update(update).await?;
                let stored = self.service.apply_resources_digest(&digest)?;
                debug!(
                    node_id = %self.service.node_id(),
                    reported,
                    stored,
                    "usage propagated"
                );
                stored
            }
            None => 0,
        };
        self.record_subtree_gauges();
        Ok(stored)
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_subtree_gauges(&self) {
        match self.service.subtree_usage(self.service.node_id()) {
            Ok(subtree) => {
                metrics::gauge!("ermes_subtree_sessions").set(subtree.usage.sessions as f64);
                metrics::gauge!("ermes_subtree_load_ratio").set(subtree.load_ratio());
            }
            Err(e) => debug!("No subtree figures for {}: {e}", self.service.node_id()),
        }
    }

    /// Run [`Self::tick`] every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(node_id = %self.service.node_id(), "Resource aggregator started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                metrics::counter!("ermes_aggregator_failures_total").increment(1);
                warn!("Usage propagation failed, retrying next tick: {e}");
            }
        }
        info!(node_id = %self.service.node_id(), "Resource aggregator stopped");
    }
}
