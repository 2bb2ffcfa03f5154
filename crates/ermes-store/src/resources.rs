//! Resource usage verbs
//!
//! Each session carries its own usage (`m:<sid>:resources`). The figures of
//! the local node (session count and summed usage) are kept in the same
//! transaction as every session change, so the two never disagree. Figures
//! of other nodes (`n:<nid>:usage`) arrive through the aggregation tree and
//! may be up to one propagation interval old.

use crate::keys::{self, SessionKeys};
use crate::session::{load_record, local_usage, not_found};
use crate::store::{KvRead, KvWrite, SessionStore, StoreResult, current_node_in};
use crate::topology::{descendants, parent_id, require_node};
use crate::types::{NodeUsage, ResourcesDigest, ResourcesUsageUpdate};
use ermes_common::{Error, NodeId, ResourcesUsage, Result, SessionId, SessionState, now_millis};
use ermes_topology::Node;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Rolled-up usage of a node and everything below it
#[derive(Clone, Debug, PartialEq)]
pub struct SubtreeUsage {
    pub node: Node,
    pub usage: NodeUsage,
    /// Sum of the declared capacities of the subtree
    pub capacity: ResourcesUsage,
}

impl SubtreeUsage {
    /// Usage over capacity, 0 when no capacity is declared
    #[must_use]
    pub fn load_ratio(&self) -> f64 {
        self.usage.usage.load_ratio(&self.capacity)
    }
}

fn current_node_opt(t: &impl KvRead) -> StoreResult<Option<NodeId>> {
    Ok(t
        .get_bytes(&keys::current_node())?
        .and_then(|bytes| String::from_utf8(bytes).ok()))
}

/// Latest known figure of one node; the local node reads its live figure.
fn figure_of(t: &impl KvRead, id: &str, current: Option<&str>) -> StoreResult<Option<NodeUsage>> {
    if current == Some(id) {
        return local_usage(t).map(Some);
    }
    t.get_record(&keys::node_usage(id))
}

/// Store a reported figure unless a newer one is already known
fn merge_figure(t: &mut impl KvWrite, id: &str, figure: &NodeUsage) -> StoreResult<bool> {
    let key = keys::node_usage(id);
    if let Some(existing) = t.get_record::<NodeUsage>(&key)? {
        if existing.updated_at > figure.updated_at {
            return Ok(false);
        }
    }
    t.put_record(&key, figure)?;
    Ok(true)
}

impl SessionStore {
    pub fn get_session_resources_usage(&self, id: &SessionId) -> Result<ResourcesUsage> {
        self.read("get_session_resources_usage", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            if record.state == SessionState::Offloaded {
                return Err(not_found(id).into());
            }
            Ok(t.get_record(&keys.resources)?.unwrap_or_default())
        })
    }

    /// Replace a session's usage and adjust the local node figure in the
    /// same transaction.
    pub fn update_session_resources_usage(
        &self,
        id: &SessionId,
        usage: &ResourcesUsage,
    ) -> Result<()> {
        self.write("update_session_resources_usage", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            if record.state == SessionState::Offloaded {
                return Err(not_found(id).into());
            }
            let previous: ResourcesUsage = t.get_record(&keys.resources)?.unwrap_or_default();
            t.put_record(&keys.resources, usage)?;
            if record.is_local() {
                let mut local = local_usage(t)?;
                local.usage.subtract(&previous);
                local.usage.add(usage);
                local.updated_at = now_millis();
                t.put_record(&keys::local_usage(), &local)?;
            }
            Ok(())
        })
    }

    /// Latest known figure of a node.
    ///
    /// The local node answers with its live figure; a registered node that
    /// never reported yields an empty figure.
    pub fn get_node_resources_usage(&self, node_id: &str) -> Result<NodeUsage> {
        self.read("get_node_resources_usage", |t| {
            let current = current_node_opt(t)?;
            if current.as_deref() != Some(node_id) {
                require_node(t, node_id)?;
            }
            Ok(figure_of(t, node_id, current.as_deref())?.unwrap_or_default())
        })
    }

    /// Bottom-up message for the parent: the figure of this node plus the
    /// latest figure of every node of its subtree.
    pub fn resources_usage_update_to_parent(&self) -> Result<ResourcesUsageUpdate> {
        self.read("resources_usage_update_to_parent", |t| {
            let current = current_node_in(t)?;
            let node = require_node(t, &current)?;
            let mut nodes = BTreeMap::new();
            nodes.insert(current.clone(), local_usage(t)?);
            for below in descendants(t, &current)? {
                if let Some(figure) = t.get_record::<NodeUsage>(&keys::node_usage(&below))? {
                    nodes.insert(below, figure);
                }
            }
            Ok(ResourcesUsageUpdate { node, nodes })
        })
    }

    /// Parent side of the bottom-up message. Only figures for the child and
    /// its own subtree are accepted; returns how many were stored.
    pub fn resources_usage_update_from_child(
        &self,
        update: &ResourcesUsageUpdate,
    ) -> Result<usize> {
        let child = update.node.id.clone();
        let stored = self.write("resources_usage_update_from_child", |t| {
            let current = current_node_in(t)?;
            if parent_id(t, &child)?.as_deref() != Some(current.as_str()) {
                return Err(Error::invalid_argument(format!(
                    "{child} is not a child of {current}"
                ))
                .into());
            }
            let mut subtree: HashSet<NodeId> = descendants(t, &child)?.into_iter().collect();
            subtree.insert(child.clone());

            let mut stored = 0;
            for (id, figure) in &update.nodes {
                if !subtree.contains(id) {
                    debug!(child = %child, node_id = %id, "ignoring figure outside the subtree");
                    continue;
                }
                if merge_figure(t, id, figure)? {
                    stored += 1;
                }
            }
            Ok(stored)
        })?;
        debug!(child = %child, stored, "usage update received");
        Ok(stored)
    }

    /// Top-down digest: every node figure known here, the local one included.
    pub fn resources_digest(&self) -> Result<ResourcesDigest> {
        self.read("resources_digest", |t| {
            let mut nodes = BTreeMap::new();
            for (key, bytes) in t.scan("n:", None, usize::MAX, &|k| k.ends_with(":usage"))? {
                if let Some(id) = keys::node_of_usage_key(&key) {
                    nodes.insert(id.to_string(), bincode::deserialize(&bytes)?);
                }
            }
            if let Some(current) = current_node_opt(t)? {
                nodes.insert(current, local_usage(t)?);
            }
            Ok(ResourcesDigest { nodes })
        })
    }

    /// Child side of the digest: keep the figures of nodes outside the
    /// local subtree (siblings, ancestors and their subtrees).
    pub fn apply_resources_digest(&self, digest: &ResourcesDigest) -> Result<usize> {
        self.write("apply_resources_digest", |t| {
            let current = current_node_in(t)?;
            let mut own: HashSet<NodeId> = descendants(t, &current)?.into_iter().collect();
            own.insert(current);

            let mut stored = 0;
            for (id, figure) in &digest.nodes {
                if !own.contains(id) && merge_figure(t, id, figure)? {
                    stored += 1;
                }
            }
            Ok(stored)
        })
    }

    /// Rolled-up usage and capacity of a node's subtree.
    pub fn subtree_usage(&self, node_id: &str) -> Result<SubtreeUsage> {
        self.read("subtree_usage", |t| {
            let current = current_node_opt(t)?;
            let node = require_node(t, node_id)?;
            let mut figures = Vec::new();
            let mut capacity = node.capacity.clone();
            if let Some(figure) = figure_of(t, node_id, current.as_deref())? {
                figures.push(figure);
            }
            for below in descendants(t, node_id)? {
                if let Some(figure) = figure_of(t, &below, current.as_deref())? {
                    figures.push(figure);
                }
                if let Some(child) = crate::topology::load_node(t, &below)? {
                    capacity.add(&child.capacity);
                }
            }
            Ok(SubtreeUsage {
                node,
                usage: NodeUsage::total(&figures),
                capacity,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ermes_common::{CreateSessionOptions, OffloadSessionOptions, SessionLocation};
    use ermes_topology::{Area, Infrastructure};

    fn infrastructure() -> Infrastructure {
        Infrastructure::new(vec![
            Area::new(
                Node::new("region", "region").with_capacity(ResourcesUsage::new().with("cpu", 8.0)),
            )
            .with_area(Area::new(
                Node::new("edge-1", "e1").with_capacity(ResourcesUsage::new().with("cpu", 4.0)),
            ))
            .with_area(Area::new(
                Node::new("edge-2", "e2").with_capacity(ResourcesUsage::new().with("cpu", 4.0)),
            )),
        ])
    }

    fn node(current: &str) -> SessionStore {
        let store = SessionStore::open_in_memory().unwrap();
        store.load_infrastructure(&infrastructure()).unwrap();
        store.set_current_node(current).unwrap();
        store
    }

    #[test]
    fn test_session_usage_rolls_into_node() {
        let store = node("edge-1");
        let a = store.create_session(&CreateSessionOptions::default()).unwrap();
        let b = store.create_session(&CreateSessionOptions::default()).unwrap();
        store
            .update_session_resources_usage(&a, &ResourcesUsage::new().with("cpu", 1.0))
            .unwrap();
        store
            .update_session_resources_usage(&b, &ResourcesUsage::new().with("cpu", 0.5))
            .unwrap();
        store
            .update_session_resources_usage(&a, &ResourcesUsage::new().with("cpu", 2.0))
            .unwrap();

        let figure = store.get_node_resources_usage("edge-1").unwrap();
        assert_eq!(figure.sessions, 2);
        assert_eq!(figure.usage.get("cpu"), 2.5);
        assert_eq!(store.get_session_resources_usage(&a).unwrap().get("cpu"), 2.0);

        store.offload_start(&a, &OffloadSessionOptions::default()).unwrap();
        store
            .offload_finish(&a, &SessionLocation::new("edge-2", a.as_str()))
            .unwrap();
        let figure = store.get_node_resources_usage("edge-1").unwrap();
        assert_eq!(figure.sessions, 1);
        assert_eq!(figure.usage.get("cpu"), 0.5);
        assert!(store.get_session_resources_usage(&a).unwrap_err().is_not_found());
    }

    #[test]
    fn test_unknown_node_usage() {
        let store = node("edge-1");
        assert_eq!(store.get_node_resources_usage("edge-2").unwrap(), NodeUsage::default());
        assert!(store.get_node_resources_usage("nowhere").unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_flows_up_and_digest_flows_down() {
        let edge1 = node("edge-1");
        let edge2 = node("edge-2");
        let region = node("region");

        let id = edge1.create_session(&CreateSessionOptions::default()).unwrap();
        edge1
            .update_session_resources_usage(&id, &ResourcesUsage::new().with("cpu", 3.0))
            .unwrap();
        edge2.create_session(&CreateSessionOptions::default()).unwrap();

        let up1 = edge1.resources_usage_update_to_parent().unwrap();
        assert_eq!(up1.node.id, "edge-1");
        assert_eq!(up1.subtree_total().sessions, 1);
        assert_eq!(region.resources_usage_update_from_child(&up1).unwrap(), 1);
        let up2 = edge2.resources_usage_update_to_parent().unwrap();
        region.resources_usage_update_from_child(&up2).unwrap();

        let total = region.subtree_usage("region").unwrap();
        assert_eq!(total.usage.sessions, 2);
        assert_eq!(total.usage.usage.get("cpu"), 3.0);
        assert_eq!(total.capacity.get("cpu"), 16.0);

        let digest = region.resources_digest().unwrap();
        assert_eq!(digest.nodes.len(), 3);
        // edge-2 learns about its sibling but keeps its own live figure
        assert_eq!(edge2.apply_resources_digest(&digest).unwrap(), 2);
        let sibling = edge2.get_node_resources_usage("edge-1").unwrap();
        assert_eq!(sibling.usage.get("cpu"), 3.0);
        assert_eq!(edge2.get_node_resources_usage("edge-2").unwrap().sessions, 1);
        assert!((edge2.subtree_usage("edge-1").unwrap().load_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_update_from_non_child_rejected() {
        let edge1 = node("edge-1");
        let edge2 = node("edge-2");
        let update = edge1.resources_usage_update_to_parent().unwrap();
        assert!(matches!(
            edge2.resources_usage_update_from_child(&update),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_stale_figure_not_applied() {
        let region = node("region");
        let mut update = ResourcesUsageUpdate {
            node: Node::new("edge-1", "e1"),
            nodes: BTreeMap::from([(
                "edge-1".to_string(),
                NodeUsage {
                    sessions: 5,
                    usage: ResourcesUsage::new(),
                    updated_at: 100,
                },
            )]),
        };
        assert_eq!(region.resources_usage_update_from_child(&update).unwrap(), 1);
        if let Some(figure) = update.nodes.get_mut("edge-1") {
            figure.sessions = 1;
            figure.updated_at = 50;
        }
        assert_eq!(region.resources_usage_update_from_child(&update).unwrap(), 0);
        assert_eq!(region.get_node_resources_usage("edge-1").unwrap().sessions, 5);
    }
}
