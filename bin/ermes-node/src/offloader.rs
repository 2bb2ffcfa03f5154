//! Offload planning loop.
//!
//! Each round first moves the sessions whose offload was waiting on a
//! release, then, when the node runs at or above its shedding threshold,
//! the best candidates picked by the selector. Every session goes to the
//! first target the selector proposes for it.

use crate::service::NodeService;
use async_trait::async_trait;
use ermes_common::{
    NodeId, OffloadSessionOptions, Result, SessionId, SessionInfoForOffloadDecision,
    SessionLocation, now_millis,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Way to hand a session over to another node of the tree
#[async_trait]
pub trait OffloadLink: Send + Sync {
    /// Move `id` from `source` to `target`, confirm it and return the new
    /// location.
    async fn move_session(
        &self,
        source: &NodeService,
        id: &SessionId,
        target: &str,
        options: OffloadSessionOptions,
    ) -> Result<SessionLocation>;
}

/// Outcome of one planning round
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OffloadRound {
    /// Sessions a target was found for
    pub planned: usize,
    pub moved: usize,
    pub failed: usize,
}

impl OffloadRound {
    pub fn merge(&mut self, other: &Self) {
        self.planned += other.planned;
        self.moved += other.moved;
        self.failed += other.failed;
    }
}

/// Periodic offload driver for one node
pub struct Offloader {
    service: Arc<NodeService>,
    link: Option<Arc<dyn OffloadLink>>,
}

impl Offloader {
    /// Without a `link` rounds only plan: targets are chosen and logged,
    /// nothing moves.
    pub fn new(service: Arc<NodeService>, link: Option<Arc<dyn OffloadLink>>) -> Self {
        Self { service, link }
    }

    /// Sessions to move this round, released ones first.
    fn candidates(&self) -> Result<Vec<SessionInfoForOffloadDecision>> {
        let now = now_millis();
        let mut queue = Vec::new();
        for id in self.service.take_unblocked_offloads() {
            match self.service.store().session_offload_info(&id, now) {
                Ok(info) => queue.push(info),
                Err(e) if e.is_not_found() => {
                    debug!(session_id = %id, "unblocked session is gone");
                }
                Err(e) => warn!(session_id = %id, error = %e, "dropping unblocked offload"),
            }
        }

        let config = self.service.offload_config();
        let load = self.service.local_load_ratio()?;
        if load >= config.shed_load_ratio {
            let room = config.max_moves_per_tick.saturating_sub(queue.len());
            let ranked = self
                .service
                .best_sessions_to_offload(Some(self.service.selector_options()))?;
            debug!(load, room, ranked = ranked.len(), "shedding load");
            let extra: Vec<_> = ranked
                .into_iter()
                .filter(|info| !queue.iter().any(|q| q.session_id == info.session_id))
                .take(room)
                .collect();
            queue.extend(extra);
        }
        Ok(queue)
    }

    /// One planning round.
    pub async fn tick(&self) -> Result<OffloadRound> {
        let mut round = OffloadRound::default();
        let queue = self.candidates()?;
        if queue.is_empty() {
            return Ok(round);
        }
        let pairs = self
            .service
            .best_offload_target_nodes(&queue, Some(self.service.selector_options()))?;

        for info in &queue {
            let id = &info.session_id;
            let Some(target) = first_target(&pairs, id) else {
                debug!(session_id = %id, "no offload target below the load threshold");
                continue;
            };
            round.planned += 1;
            let Some(link) = &self.link else {
                info!(session_id = %id, target = %target, "offload planned, no link to move it");
                continue;
            };
            match link
                .move_session(&self.service, id, target, OffloadSessionOptions::default())
                .await
            {
                Ok(location) => {
                    round.moved += 1;
                    info!(session_id = %id, location = %location, "session offloaded");
                }
                Err(e) => {
                    round.failed += 1;
                    warn!(session_id = %id, target = %target, error = %e, "offload failed");
                }
            }
        }
        metrics::counter!("ermes_offload_moves_total").increment(round.moved as u64);
        metrics::counter!("ermes_offload_failures_total").increment(round.failed as u64);
        Ok(round)
    }

    /// Run [`Self::tick`] every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            node_id = %self.service.node_id(),
            linked = self.link.is_some(),
            "Offloader started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                warn!("Offload round failed, retrying next tick: {e}");
            }
        }
        info!(node_id = %self.service.node_id(), "Offloader stopped");
    }
}

fn first_target<'a>(pairs: &'a [(SessionId, NodeId)], id: &SessionId) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(session, _)| session == id)
        .map(|(_, node)| node.as_str())
}
