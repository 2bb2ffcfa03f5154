//! Node <-> bytes codec
//!
//! Node descriptors are stored and exchanged as JSON so that other
//! implementations of the store can read them.

use crate::topology::{Infrastructure, Node};

/// Errors from encoding or decoding a node
#[derive(Debug, thiserror::Error)]
#[error("node codec error: {0}")]
pub struct CodecError(#[from] serde_json::Error);

impl From<CodecError> for ermes_common::Error {
    fn from(e: CodecError) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Encode a node descriptor
pub fn marshal_node(node: &Node) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(node)?)
}

/// Decode a node descriptor
pub fn unmarshal_node(bytes: &[u8]) -> Result<Node, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decode an infrastructure description
pub fn unmarshal_infrastructure(bytes: &[u8]) -> Result<Infrastructure, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}
