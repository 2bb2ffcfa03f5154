//! In-process cluster
//!
//! Every node of an infrastructure gets its own in-memory store and
//! service; parent links, session moves and offload notifications are
//! plain method calls between them. Useful for tests and for running a whole tree in one
//! process.

use crate::aggregator::{ParentLink, ResourcesAggregator};
use crate::offloader::{OffloadLink, OffloadRound, Offloader};
use crate::service::{LastVisitedNodeNotifier, NodeService};
use async_trait::async_trait;
use ermes_common::{
    Config, Error, NodeId, OffloadSessionOptions, Result, SessionId, SessionLocation,
};
use ermes_store::{ResourcesDigest, ResourcesUsageUpdate};
use ermes_topology::Infrastructure;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

type Nodes = Arc<BTreeMap<NodeId, Arc<NodeService>>>;

fn node_in<'a>(nodes: &'a Nodes, id: &str) -> Result<&'a Arc<NodeService>> {
    nodes.get(id).ok_or_else(|| Error::NodeNotFound(id.to_string()))
}

/// Link from a child to a parent running in the same process
pub struct LocalParentLink {
    parent: Arc<NodeService>,
}

impl LocalParentLink {
    pub fn new(parent: Arc<NodeService>) -> Self {
        Self { parent }
    }
}

#[async_trait]
impl ParentLink for LocalParentLink {
    async fn send_usage_update(&self, update: ResourcesUsageUpdate) -> Result<ResourcesDigest> {
        self.parent.receive_child_update(&update)
    }
}

/// Tells the node a session came from where it went next
pub struct LocalNotifier {
    nodes: Nodes,
}

#[async_trait]
impl LastVisitedNodeNotifier for LocalNotifier {
    async fn notify_last_visited_node(
        &self,
        origin: Option<&SessionLocation>,
        location: &SessionLocation,
    ) -> Result<()> {
        let Some(origin) = origin else {
            return Ok(());
        };
        // Back home: the origin reinstated the session on onload
        if origin.host == location.host {
            return Ok(());
        }
        let id = SessionId::parse(origin.session_id.as_str())?;
        let changed = node_in(&self.nodes, &origin.host)?
            .update_offloaded_session_location(&id, location)?;
        debug!(origin = %origin, location = %location, changed, "origin redirect updated");
        Ok(())
    }
}

/// Moves sessions between nodes running in the same process
pub struct LocalOffloadLink {
    nodes: Nodes,
}

#[async_trait]
impl OffloadLink for LocalOffloadLink {
    async fn move_session(
        &self,
        source: &NodeService,
        id: &SessionId,
        target: &str,
        options: OffloadSessionOptions,
    ) -> Result<SessionLocation> {
        let target = node_in(&self.nodes, target)?;
        let notifier = LocalNotifier {
            nodes: self.nodes.clone(),
        };
        source.move_session_to(target, id, options, Some(&notifier)).await
    }
}

/// Every node of an infrastructure, in one process
pub struct LocalCluster {
    nodes: Nodes,
    /// Node ids in pre-order: parents before children
    order: Vec<NodeId>,
}

impl LocalCluster {
    /// Build one in-memory node per area, each knowing the whole tree.
    pub fn in_memory(infrastructure: &Infrastructure, config: &Config) -> Result<Self> {
        infrastructure
            .validate()
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        let mut nodes = BTreeMap::new();
        let mut order = Vec::new();
        for area in infrastructure.flatten() {
            let service = NodeService::in_memory(area.area_name(), config)?;
            service.load_infrastructure(infrastructure)?;
            order.push(area.area_name().to_string());
            nodes.insert(area.area_name().to_string(), Arc::new(service));
        }
        info!(nodes = order.len(), "local cluster ready");
        Ok(Self {
            nodes: Arc::new(nodes),
            order,
        })
    }

    pub fn node(&self, id: &str) -> Result<&Arc<NodeService>> {
        node_in(&self.nodes, id)
    }

    /// Nodes in pre-order
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeService>> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn notifier(&self) -> LocalNotifier {
        LocalNotifier {
            nodes: self.nodes.clone(),
        }
    }

    /// Aggregator of one node, linked to its parent if it has one.
    pub fn aggregator(&self, id: &str) -> Result<ResourcesAggregator> {
        let service = self.node(id)?;
        let parent: Option<Arc<dyn ParentLink>> = match service.get_parent_node()? {
            Some(parent) => Some(Arc::new(LocalParentLink::new(self.node(&parent.id)?.clone()))),
            None => None,
        };
        Ok(ResourcesAggregator::new(service.clone(), parent))
    }

    /// Offloader of one node, able to reach every other node.
    pub fn offloader(&self, id: &str) -> Result<Offloader> {
        let link: Arc<dyn OffloadLink> = Arc::new(LocalOffloadLink {
            nodes: self.nodes.clone(),
        });
        Ok(Offloader::new(self.node(id)?.clone(), Some(link)))
    }

    /// One offload round on every node, parents first.
    pub async fn offload_round(&self) -> Result<OffloadRound> {
        let mut total = OffloadRound::default();
        for id in &self.order {
            total.merge(&self.offloader(id)?.tick().await?);
        }
        Ok(total)
    }

    /// One aggregation round over the whole tree, children before parents.
    ///
    /// Figures reach the root in a single round; on the way down a digest
    /// travels one level per round.
    pub async fn propagate_usage(&self) -> Result<()> {
        for id in self.order.iter().rev() {
            self.aggregator(id)?.tick().await?;
        }
        Ok(())
    }

    /// Move a session between two nodes of the cluster.
    pub async fn move_session(
        &self,
        from: &str,
        to: &str,
        id: &SessionId,
        options: OffloadSessionOptions,
    ) -> Result<SessionLocation> {
        let source = self.node(from)?;
        let target = self.node(to)?;
        let notifier = self.notifier();
        source.move_session_to(target, id, options, Some(&notifier)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ermes_common::{AcquireSessionOptions, CreateSessionOptions, ResourcesUsage};
    use ermes_topology::{Area, Node};

    fn cluster() -> LocalCluster {
        let infra = Infrastructure::new(vec![
            Area::new(Node::new("cloud", "cloud"))
                .with_area(
                    Area::new(Node::new("region-a", "region-a"))
                        .with_area(Area::new(Node::new("edge-a1", "edge-a1")))
                        .with_area(Area::new(Node::new("edge-a2", "edge-a2"))),
                )
                .with_area(
                    Area::new(Node::new("region-b", "region-b"))
                        .with_area(Area::new(Node::new("edge-b1", "edge-b1"))),
                ),
        ]);
        LocalCluster::in_memory(&infra, &Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_propagation_reaches_root_and_comes_back() {
        let cluster = cluster();
        let edge = cluster.node("edge-a1").unwrap();
        let id = edge.create_session(&CreateSessionOptions::default()).unwrap();
        edge.update_session_resources_usage(&id, &ResourcesUsage::new().with("mem", 64.0))
            .unwrap();

        cluster.propagate_usage().await.unwrap();
        let cloud = cluster.node("cloud").unwrap();
        let seen = cloud.subtree_usage("region-a").unwrap();
        assert_eq!(seen.usage.sessions, 1);
        assert_eq!(seen.usage.usage.get("mem"), 64.0);

        cluster.propagate_usage().await.unwrap();
        let uncle = cluster.node("region-b").unwrap();
        assert_eq!(uncle.get_node_resources_usage("edge-a1").unwrap().sessions, 1);

        cluster.propagate_usage().await.unwrap();
        let cousin = cluster.node("edge-b1").unwrap();
        assert_eq!(cousin.get_node_resources_usage("edge-a1").unwrap().sessions, 1);
        assert_eq!(cousin.subtree_usage("cloud").unwrap().usage.usage.get("mem"), 64.0);
    }

    #[tokio::test]
    async fn test_second_move_updates_origin_redirect() {
        let cluster = cluster();
        let id = cluster
            .node("edge-a1")
            .unwrap()
            .create_session(&CreateSessionOptions::default())
            .unwrap();

        let first = cluster
            .move_session("edge-a1", "edge-a2", &id, OffloadSessionOptions::default())
            .await
            .unwrap();
        assert_eq!(first.host, "edge-a2");
        let second = cluster
            .move_session("edge-a2", "edge-b1", &id, OffloadSessionOptions::default())
            .await
            .unwrap();

        let origin = cluster.node("edge-a1").unwrap();
        assert_eq!(
            origin.acquire_session(&id, AcquireSessionOptions::default()).unwrap(),
            Some(second.clone())
        );
        let lookup = origin.find_lookup_node(std::slice::from_ref(&id)).unwrap().unwrap();
        assert_eq!(lookup.id, "cloud");

        // And home again: the origin takes it back
        let home = cluster
            .move_session("edge-b1", "edge-a1", &id, OffloadSessionOptions::default())
            .await
            .unwrap();
        assert_eq!(home.host, "edge-a1");
        assert_eq!(
            origin.acquire_session(&id, AcquireSessionOptions::default()).unwrap(),
            None
        );
    }

    #[test]
    fn test_unknown_node() {
        let cluster = cluster();
        assert!(cluster.node("nowhere").unwrap_err().is_not_found());
        assert_eq!(cluster.nodes().count(), 6);
    }
}
