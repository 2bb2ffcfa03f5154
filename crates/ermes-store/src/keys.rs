//! Concrete keys built from the keyspace partitioner.

use crate::store::StoreResult;
use ermes_common::keyspace::{
    CURRENT_NODE, LOOKUP_NODES, OFFLOADABLE_SESSIONS_SET, OFFLOADED_SESSIONS_SET, SESSIONS_SET,
};
use ermes_common::{KeySpace, KeySpaces, SessionId};
pub(crate) use ermes_common::keyspace::SESSION_METADATA_PREFIX as METADATA_PREFIX;

/// Local node usage (sessions and rolled-up usage of the sessions held here)
const LOCAL_USAGE: &str = "local_usage";

/// Every key belonging to one session.
pub(crate) struct SessionKeys {
    pub info: String,
    pub meta: String,
    pub resources: String,
    /// `m:<sid>:` as a whole
    pub metadata_space: KeySpace,
    /// `s:<sid>:` session data
    pub data: KeySpace,
    pub sessions_index: String,
    pub offloadable_index: String,
    pub offloaded_index: String,
    pub lookup: String,
}

impl SessionKeys {
    pub fn new(id: &SessionId) -> StoreResult<Self> {
        let spaces = KeySpaces::for_session(id);
        let metadata_space = spaces.session_metadata()?.clone();
        Ok(Self {
            info: metadata_space.key("info"),
            meta: metadata_space.key("meta"),
            resources: metadata_space.key("resources"),
            metadata_space,
            data: spaces.session()?.clone(),
            sessions_index: spaces.index_member(SESSIONS_SET, id.as_str()),
            offloadable_index: spaces.index_member(OFFLOADABLE_SESSIONS_SET, id.as_str()),
            offloaded_index: spaces.index_member(OFFLOADED_SESSIONS_SET, id.as_str()),
            lookup: spaces.index_member(LOOKUP_NODES, id.as_str()),
        })
    }
}

/// Extract the session id from an `m:<sid>:info` key
pub(crate) fn session_of_info_key(key: &str) -> Option<&str> {
    key.strip_prefix(METADATA_PREFIX)?.strip_suffix(":info")
}

pub(crate) fn node(id: &str) -> String {
    KeySpaces::global().node().key(id)
}

pub(crate) fn node_parent(id: &str) -> String {
    node(&format!("{id}:parent"))
}

pub(crate) fn node_children(id: &str) -> String {
    node(&format!("{id}:children"))
}

pub(crate) fn node_usage(id: &str) -> String {
    node(&format!("{id}:usage"))
}

/// Node id of an `n:<nid>:usage` key
pub(crate) fn node_of_usage_key(key: &str) -> Option<&str> {
    KeySpaces::global()
        .node()
        .unwrap(key)
        .ok()?
        .strip_suffix(":usage")
}

pub(crate) fn current_node() -> String {
    KeySpaces::global().config().key(CURRENT_NODE)
}

pub(crate) fn local_usage() -> String {
    KeySpaces::global().config().key(LOCAL_USAGE)
}
