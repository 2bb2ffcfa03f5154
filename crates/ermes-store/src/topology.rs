//! Node topology verbs
//!
//! The tree is stored as an arena under the node namespace: the descriptor
//! at `n:<id>`, the parent id at `n:<id>:parent` and the ordered child ids
//! at `n:<id>:children`. Traversal always goes by id through the store.

use crate::keys;
use crate::store::{KvRead, KvWrite, SessionStore, StoreResult};
use ermes_common::{Error, NodeId, Result};
use ermes_topology::{
    Infrastructure, Node, Topology, lowest_common_ancestor, marshal_node, unmarshal_node,
};
use std::collections::HashSet;
use tracing::{debug, info};

pub(crate) fn load_node(t: &impl KvRead, id: &str) -> StoreResult<Option<Node>> {
    match t.get_bytes(&keys::node(id))? {
        Some(bytes) => Ok(Some(unmarshal_node(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn require_node(t: &impl KvRead, id: &str) -> StoreResult<Node> {
    load_node(t, id)?.ok_or_else(|| Error::NodeNotFound(id.to_string()).into())
}

pub(crate) fn parent_id(t: &impl KvRead, id: &str) -> StoreResult<Option<NodeId>> {
    t.get_record(&keys::node_parent(id))
}

pub(crate) fn children_ids(t: &impl KvRead, id: &str) -> StoreResult<Vec<NodeId>> {
    Ok(t.get_record(&keys::node_children(id))?.unwrap_or_default())
}

/// The node followed by its ancestors, root last
pub(crate) fn ancestry(t: &impl KvRead, id: &str) -> StoreResult<Vec<NodeId>> {
    let mut chain = vec![id.to_string()];
    let mut current = id.to_string();
    while let Some(parent) = parent_id(t, &current)? {
        if chain.contains(&parent) {
            break;
        }
        chain.push(parent.clone());
        current = parent;
    }
    Ok(chain)
}

/// Every node below `id`, breadth first, excluding `id` itself
pub(crate) fn descendants(t: &impl KvRead, id: &str) -> StoreResult<Vec<NodeId>> {
    let mut seen = HashSet::from([id.to_string()]);
    let mut out = Vec::new();
    let mut frontier = vec![id.to_string()];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for node in &frontier {
            for child in children_ids(t, node)? {
                if seen.insert(child.clone()) {
                    out.push(child.clone());
                    next.push(child);
                }
            }
        }
        frontier = next;
    }
    Ok(out)
}

/// Lookup node for a session leaving `current` for `new_host`: their
/// lowest common ancestor, or `current` when `new_host` is unknown here.
pub(crate) fn lookup_node_for(
    t: &impl KvRead,
    current: &str,
    new_host: &str,
) -> StoreResult<NodeId> {
    if !t.contains(&keys::node(new_host))? {
        return Ok(current.to_string());
    }
    let chains = [ancestry(t, current)?, ancestry(t, new_host)?];
    Ok(lowest_common_ancestor(&chains).unwrap_or_else(|| current.to_string()))
}

fn check_node_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(':') {
        return Err(Error::invalid_argument(format!("invalid node id {id:?}")));
    }
    Ok(())
}

fn put_node(t: &mut impl KvWrite, node: &Node) -> StoreResult<()> {
    t.put_bytes(&keys::node(&node.id), &marshal_node(node)?)
}

fn put_relation(t: &mut impl KvWrite, parent: &str, child: &str) -> StoreResult<bool> {
    if !t.contains(&keys::node(parent))? {
        return Err(Error::NodeNotFound(parent.to_string()).into());
    }
    let previous = parent_id(t, child)?;
    let mut children = children_ids(t, parent)?;
    if previous.as_deref() == Some(parent) && children.iter().any(|c| c == child) {
        return Ok(false);
    }
    if let Some(old) = previous.filter(|old| old != parent) {
        let mut siblings = children_ids(t, &old)?;
        siblings.retain(|c| c != child);
        t.put_record(&keys::node_children(&old), &siblings)?;
    }
    if !children.iter().any(|c| c == child) {
        children.push(child.to_string());
        t.put_record(&keys::node_children(parent), &children)?;
    }
    t.put_record(&keys::node_parent(child), &parent.to_string())?;
    Ok(true)
}

impl SessionStore {
    /// Register (or overwrite) a node descriptor.
    pub fn register_node(&self, node: &Node) -> Result<()> {
        check_node_id(&node.id)?;
        self.write("register_node", |t| put_node(t, node))?;
        debug!(node_id = %node.id, "node registered");
        Ok(())
    }

    /// Record a parent -> child relation. The parent must be registered.
    ///
    /// Returns `false` when the relation was already present.
    pub fn register_node_relation(&self, parent: &str, child: &str) -> Result<bool> {
        check_node_id(parent)?;
        check_node_id(child)?;
        if parent == child {
            return Err(Error::invalid_argument(format!("node {parent} cannot be its own parent")));
        }
        self.write("register_node_relation", |t| put_relation(t, parent, child))
    }

    /// Register every node of an infrastructure and its relations.
    ///
    /// Areas are visited in pre-order; each area (its node, then the
    /// relations to its sub-areas) is one transaction. Loading the same
    /// description twice changes nothing.
    pub fn load_infrastructure(&self, infrastructure: &Infrastructure) -> Result<usize> {
        infrastructure
            .validate()
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        let areas = infrastructure.flatten();
        for area in &areas {
            check_node_id(area.area_name())?;
            self.write("load_infrastructure", |t| {
                put_node(t, &area.node)?;
                for child in area.child_names() {
                    put_relation(t, area.area_name(), child)?;
                }
                Ok(())
            })?;
        }
        info!(nodes = areas.len(), "infrastructure loaded");
        Ok(areas.len())
    }

    pub fn get_node(&self, id: &str) -> Result<Node> {
        self.read("get_node", |t| require_node(t, id))
    }

    /// Parent of a node; `None` for a root. Unknown node ids are an error.
    pub fn get_parent_node_of(&self, id: &str) -> Result<Option<Node>> {
        self.read("get_parent_node_of", |t| {
            require_node(t, id)?;
            match parent_id(t, id)? {
                Some(parent) => Ok(Some(require_node(t, &parent)?)),
                None => Ok(None),
            }
        })
    }

    /// Children of a node, in registration order. Unknown node ids are an
    /// error; a leaf yields an empty list.
    pub fn get_children_nodes_of(&self, id: &str) -> Result<Vec<Node>> {
        self.read("get_children_nodes_of", |t| {
            require_node(t, id)?;
            let mut out = Vec::new();
            for child in children_ids(t, id)? {
                match load_node(t, &child)? {
                    Some(node) => out.push(node),
                    None => debug!(node_id = %id, child = %child, "child not registered yet"),
                }
            }
            Ok(out)
        })
    }

    /// The node followed by its ancestors, root last.
    pub fn node_ancestry(&self, id: &str) -> Result<Vec<NodeId>> {
        self.read("node_ancestry", |t| {
            require_node(t, id)?;
            ancestry(t, id)
        })
    }

    /// In-memory arena of the tree around `id`: its ancestors, their
    /// children and its whole subtree.
    pub fn topology_around(&self, id: &str) -> Result<Topology> {
        self.read("topology_around", |t| {
            let mut topology = Topology::new();
            let mut ids: Vec<NodeId> = ancestry(t, id)?;
            for ancestor in ids.clone() {
                ids.extend(children_ids(t, &ancestor)?);
            }
            ids.extend(descendants(t, id)?);

            let mut seen = HashSet::new();
            for node_id in ids {
                if !seen.insert(node_id.clone()) {
                    continue;
                }
                let Some(node) = load_node(t, &node_id)? else {
                    continue;
                };
                topology.upsert_node(node);
                if let Some(parent) = parent_id(t, &node_id)? {
                    topology.add_relation(&parent, &node_id);
                }
            }
            Ok(topology)
        })
    }
}
