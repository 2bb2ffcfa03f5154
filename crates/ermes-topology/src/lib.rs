//! Ermes Topology - the static tree of compute nodes
//!
//! Nodes are loaded once from an infrastructure description (a tree of
//! areas) and never destroyed while the process runs. Relations are kept
//! by id only: a node names its parent and children, it never points at
//! them, so the same description can be persisted and reloaded.
//!
//! # Example
//! ```ignore
//! use ermes_topology::{Area, Infrastructure, Node};
//!
//! let infra = Infrastructure::new(vec![Area::new(Node::new("cloud", "10.0.0.1"))
//!     .with_area(Area::new(Node::new("edge-1", "10.0.1.1")))]);
//! for area in infra.flatten() {
//!     println!("{} -> {:?}", area.area_name(), area.child_names());
//! }
//! ```

pub mod codec;
pub mod topology;

pub use codec::{CodecError, marshal_node, unmarshal_infrastructure, unmarshal_node};
pub use topology::{
    Area, Infrastructure, Node, NodeTier, Topology, TopologyError, lowest_common_ancestor,
};
