//! Node tree representation

use ermes_common::{GeoCoordinates, NodeId, ResourcesUsage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Level of a node in the edge-to-cloud hierarchy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTier {
    #[default]
    Edge,
    Regional,
    Cloud,
}

/// Node descriptor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Area name, unique in the tree
    pub id: NodeId,
    /// Address clients and peers use to reach the node
    pub host: String,
    #[serde(default)]
    pub tier: NodeTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_coordinates: Option<GeoCoordinates>,
    /// Capacity per resource dimension; usage is compared against it
    #[serde(default, skip_serializing_if = "ResourcesUsage::is_empty")]
    pub capacity: ResourcesUsage,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Node {
    /// Create a new edge node with no capacity information
    #[must_use]
    pub fn new(id: impl Into<NodeId>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            tier: NodeTier::Edge,
            geo_coordinates: None,
            capacity: ResourcesUsage::new(),
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_tier(mut self, tier: NodeTier) -> Self {
        self.tier = tier;
        self
    }

    #[must_use]
    pub fn with_geo_coordinates(mut self, geo: GeoCoordinates) -> Self {
        self.geo_coordinates = Some(geo);
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: ResourcesUsage) -> Self {
        self.capacity = capacity;
        self
    }
}

/// One area of the infrastructure: a node and the areas below it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub node: Node,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub areas: Vec<Area>,
}

impl Area {
    #[must_use]
    pub fn new(node: Node) -> Self {
        Self {
            node,
            areas: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_area(mut self, area: Area) -> Self {
        self.areas.push(area);
        self
    }

    #[must_use]
    pub fn area_name(&self) -> &str {
        &self.node.id
    }

    /// Ids of the direct sub-areas, in order
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.areas.iter().map(Area::area_name)
    }
}

/// The whole infrastructure: one or more root areas
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Infrastructure {
    pub areas: Vec<Area>,
}

impl Infrastructure {
    #[must_use]
    pub fn new(areas: Vec<Area>) -> Self {
        Self { areas }
    }

    /// Pre-order traversal: every area appears after its parent.
    #[must_use]
    pub fn flatten(&self) -> Vec<&Area> {
        let mut out = Vec::new();
        let mut stack: Vec<&Area> = self.areas.iter().rev().collect();
        while let Some(area) = stack.pop() {
            out.push(area);
            stack.extend(area.areas.iter().rev());
        }
        out
    }

    /// Reject descriptions where an area name appears twice.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut seen = HashSet::new();
        for area in self.flatten() {
            if !seen.insert(area.area_name()) {
                return Err(TopologyError::DuplicateNode(area.area_name().to_string()));
            }
        }
        Ok(())
    }
}

/// Errors raised while building a topology
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("node {0} appears more than once in the infrastructure")]
    DuplicateNode(String),
}

/// Arena view of the tree: node records indexed by id, relations by id.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    nodes: HashMap<NodeId, Node>,
    parents: HashMap<NodeId, NodeId>,
    children: HashMap<NodeId, Vec<NodeId>>,
}

impl Topology {
    /// Create a new empty topology
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the arena from an infrastructure description
    pub fn from_infrastructure(infra: &Infrastructure) -> Result<Self, TopologyError> {
        infra.validate()?;
        let mut topology = Self::new();
        for area in infra.flatten() {
            topology.upsert_node(area.node.clone());
            for child in area.child_names() {
                topology.add_relation(area.area_name(), child);
            }
        }
        Ok(topology)
    }

    /// Add or replace a node descriptor; relations are untouched
    pub fn upsert_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Record a parent -> child relation; no-op when already present
    pub fn add_relation(&mut self, parent: &str, child: &str) {
        let children = self.children.entry(parent.to_string()).or_default();
        if !children.iter().any(|c| c == child) {
            children.push(child.to_string());
        }
        self.parents.insert(child.to_string(), parent.to_string());
    }

    #[must_use]
    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    #[must_use]
    pub fn parent_of(&self, id: &str) -> Option<&Node> {
        self.parents.get(id).and_then(|p| self.nodes.get(p))
    }

    #[must_use]
    pub fn children_of(&self, id: &str) -> Vec<&Node> {
        self.children
            .get(id)
            .map(|ids| ids.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// The node itself followed by its ancestors up to the root
    #[must_use]
    pub fn ancestry(&self, id: &str) -> Vec<NodeId> {
        let mut chain = vec![id.to_string()];
        let mut current = id;
        while let Some(parent) = self.parents.get(current) {
            if chain.contains(parent) {
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
        chain
    }

    /// Lowest common ancestor of two nodes, if they share a root
    #[must_use]
    pub fn lowest_common_ancestor(&self, a: &str, b: &str) -> Option<NodeId> {
        lowest_common_ancestor(&[self.ancestry(a), self.ancestry(b)])
    }
}

/// Lowest common ancestor of any number of ancestry chains (each chain is a
/// node followed by its ancestors, root last).
#[must_use]
pub fn lowest_common_ancestor(chains: &[Vec<NodeId>]) -> Option<NodeId> {
    let (first, rest) = chains.split_first()?;
    first
        .iter()
        .find(|candidate| rest.iter().all(|chain| chain.contains(candidate)))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Infrastructure {
        Infrastructure::new(vec![
            Area::new(Node::new("cloud", "10.0.0.1").with_tier(NodeTier::Cloud))
                .with_area(
                    Area::new(Node::new("region-a", "10.0.1.1").with_tier(NodeTier::Regional))
                        .with_area(Area::new(Node::new("edge-a1", "10.0.1.10")))
                        .with_area(Area::new(Node::new("edge-a2", "10.0.1.11"))),
                )
                .with_area(
                    Area::new(Node::new("region-b", "10.0.2.1").with_tier(NodeTier::Regional))
                        .with_area(Area::new(Node::new("edge-b1", "10.0.2.10"))),
                ),
        ])
    }

    #[test]
    fn test_flatten_is_preorder() {
        let infra = sample();
        let names: Vec<&str> = infra.flatten().iter().map(|a| a.area_name()).collect();
        assert_eq!(
            names,
            vec!["cloud", "region-a", "edge-a1", "edge-a2", "region-b", "edge-b1"]
        );
    }

    #[test]
    fn test_duplicate_area_rejected() {
        let infra = Infrastructure::new(vec![
            Area::new(Node::new("x", "h")).with_area(Area::new(Node::new("x", "h2"))),
        ]);
        assert_eq!(
            infra.validate(),
            Err(TopologyError::DuplicateNode("x".into()))
        );
    }

    #[test]
    fn test_parent_and_children() {
        let topology = Topology::from_infrastructure(&sample()).unwrap();
        assert_eq!(topology.parent_of("edge-a1").unwrap().id, "region-a");
        assert!(topology.parent_of("cloud").is_none());
        let children: Vec<&str> = topology
            .children_of("region-a")
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(children, vec!["edge-a1", "edge-a2"]);
        assert!(topology.children_of("edge-b1").is_empty());
    }

    #[test]
    fn test_relation_is_idempotent() {
        let mut topology = Topology::from_infrastructure(&sample()).unwrap();
        topology.add_relation("region-a", "edge-a1");
        assert_eq!(topology.children_of("region-a").len(), 2);
    }

    #[test]
    fn test_lowest_common_ancestor() {
        let topology = Topology::from_infrastructure(&sample()).unwrap();
        assert_eq!(
            topology.lowest_common_ancestor("edge-a1", "edge-a2").as_deref(),
            Some("region-a")
        );
        assert_eq!(
            topology.lowest_common_ancestor("edge-a1", "edge-b1").as_deref(),
            Some("cloud")
        );
        assert_eq!(
            topology.lowest_common_ancestor("edge-a1", "region-a").as_deref(),
            Some("region-a")
        );
        assert_eq!(topology.lowest_common_ancestor("edge-a1", "elsewhere"), None);
    }
}
