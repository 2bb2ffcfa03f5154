//! Lookup-node directory
//!
//! When a session is offloaded, the old host records under
//! `c:lookup_nodes:<sid>` the node that keeps answering "where did this
//! session go": the lowest common ancestor of the old and new host. The
//! entry lives as long as the redirect and is dropped with it.

use crate::keys::SessionKeys;
use crate::store::{KvRead, SessionStore};
use crate::topology::{ancestry, require_node};
use ermes_common::{Error, Result, SessionId};
use ermes_topology::{Node, lowest_common_ancestor};
use std::collections::BTreeSet;

impl SessionStore {
    /// Resolve the lookup node responsible for a group of sessions.
    ///
    /// Returns `None` when none of the sessions (or no session at all) has
    /// a lookup entry here.
    /// With several distinct entries, the answer is the node covering all
    /// of them (their lowest common ancestor).
    pub fn find_lookup_node(&self, session_ids: &[SessionId]) -> Result<Option<Node>> {
        if session_ids.is_empty() {
            return Ok(None);
        }
        self.read("find_lookup_node", |t| {
            let mut lookups = BTreeSet::new();
            for id in session_ids {
                if let Some(bytes) = t.get_bytes(&SessionKeys::new(id)?.lookup)? {
                    let node = String::from_utf8(bytes)
                        .map_err(|e| Error::internal(format!("corrupt lookup entry: {e}")))?;
                    lookups.insert(node);
                }
            }

            let chosen = match lookups.len() {
                0 => return Ok(None),
                1 => lookups.into_iter().next(),
                _ => {
                    let mut chains = Vec::with_capacity(lookups.len());
                    for node in &lookups {
                        chains.push(ancestry(t, node)?);
                    }
                    lowest_common_ancestor(&chains)
                }
            };
            match chosen {
                Some(node) => Ok(Some(require_node(t, &node)?)),
                None => Err(Error::internal("lookup entries span disjoint trees").into()),
            }
        })
    }
}
