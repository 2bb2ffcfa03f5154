//! Types stored in, or returned by, the session store

use ermes_common::{
    AcquireSessionOptions, NodeId, ResourcesUsage, SessionId, SessionLocation, SessionState,
};
use ermes_topology::Node;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle record of one session (`m:<sid>:info`)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub state: SessionState,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    /// When the session entered its current state
    pub state_changed_at: u64,
    /// Last acquire or release
    pub last_activity_at: u64,
    /// The single exclusive (offload-blocking) hold
    pub exclusive_hold: bool,
    /// Holds that do not block offloading
    pub shared_holds: u32,
    /// Read-only holds taken while offloading
    pub offloading_reads: u32,
    /// An offload was refused because of the exclusive hold
    pub offload_requested: bool,
    /// Where the session went, once offloaded
    pub location: Option<SessionLocation>,
    /// Where the session came from, when it was onloaded here
    pub origin: Option<SessionLocation>,
}

impl SessionRecord {
    pub(crate) fn new(
        state: SessionState,
        now: u64,
        created_at: u64,
        expires_at: Option<u64>,
    ) -> Self {
        Self {
            state,
            created_at,
            expires_at,
            state_changed_at: now,
            last_activity_at: now,
            exclusive_hold: false,
            shared_holds: 0,
            offloading_reads: 0,
            offload_requested: false,
            location: None,
            origin: None,
        }
    }

    /// Take a hold on an active session
    pub(crate) fn grant(&mut self, options: AcquireSessionOptions) {
        if options.is_exclusive() {
            self.exclusive_hold = true;
        } else {
            self.shared_holds += 1;
        }
    }

    pub(crate) fn set_state(&mut self, state: SessionState, now: u64) {
        self.state = state;
        self.state_changed_at = now;
    }

    /// Member of the offloadable index
    #[must_use]
    pub fn is_offloadable(&self) -> bool {
        self.state == SessionState::Active && !self.exclusive_hold
    }

    /// Counted in the local node's usage
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Offloading)
    }

    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A member of an ordered set
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    #[must_use]
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// One named session data entry (`s:<sid>:<name>`)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionValue {
    String(String),
    List(Vec<String>),
    Set(BTreeSet<String>),
    /// Ordered by score, then member
    ZSet(Vec<ScoredMember>),
    Hash(BTreeMap<String, String>),
}

impl SessionValue {
    /// Sort ordered-set members the way they are iterated
    pub(crate) fn normalized(self) -> Self {
        match self {
            Self::ZSet(mut members) => {
                members.sort_by(|a, b| {
                    a.score
                        .total_cmp(&b.score)
                        .then_with(|| a.member.cmp(&b.member))
                });
                Self::ZSet(members)
            }
            other => other,
        }
    }
}

/// Session payload grouped by collection shape.
///
/// Entry names are unique across the five maps; the onload side rebuilds
/// each entry with the same shape, empty collections included.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OffloadData {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub string: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub list: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub zset: BTreeMap<String, Vec<ScoredMember>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hash: BTreeMap<String, BTreeMap<String, String>>,
}

impl OffloadData {
    pub fn insert(&mut self, name: impl Into<String>, value: SessionValue) {
        let name = name.into();
        match value {
            SessionValue::String(v) => {
                self.string.insert(name, v);
            }
            SessionValue::List(v) => {
                self.list.insert(name, v);
            }
            SessionValue::Set(v) => {
                self.set.insert(name, v);
            }
            SessionValue::ZSet(v) => {
                self.zset.insert(name, v);
            }
            SessionValue::Hash(v) => {
                self.hash.insert(name, v);
            }
        }
    }

    /// Number of entries across all shapes
    #[must_use]
    pub fn len(&self) -> usize {
        self.string.len() + self.list.len() + self.set.len() + self.zset.len() + self.hash.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold another page into this one
    pub fn merge(&mut self, other: OffloadData) {
        for (name, value) in other.into_entries() {
            self.insert(name, value);
        }
    }

    pub fn into_entries(self) -> impl Iterator<Item = (String, SessionValue)> {
        let strings = self
            .string
            .into_iter()
            .map(|(k, v)| (k, SessionValue::String(v)));
        let lists = self.list.into_iter().map(|(k, v)| (k, SessionValue::List(v)));
        let sets = self.set.into_iter().map(|(k, v)| (k, SessionValue::Set(v)));
        let zsets = self.zset.into_iter().map(|(k, v)| (k, SessionValue::ZSet(v)));
        let hashes = self.hash.into_iter().map(|(k, v)| (k, SessionValue::Hash(v)));
        strings.chain(lists).chain(sets).chain(zsets).chain(hashes)
    }
}

/// One page of an offload stream
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OffloadPage {
    pub data: OffloadData,
    /// Cursor for the next page; empty when the payload is exhausted
    pub cursor: String,
}

impl OffloadPage {
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.cursor.is_empty()
    }
}

/// One page of an index scan
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanPage {
    pub session_ids: Vec<SessionId>,
    /// Cursor for the next page; empty when the scan is complete
    pub cursor: String,
}

/// Result of releasing a hold
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReleaseOutcome {
    /// Redirect, when the session is no longer here
    pub location: Option<SessionLocation>,
    /// An offload refused because of the released hold may now proceed
    pub offload_unblocked: bool,
}

/// Usage figures attributed to one node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUsage {
    pub sessions: u64,
    pub usage: ResourcesUsage,
    /// When this figure was produced (ms since epoch)
    pub updated_at: u64,
}

impl NodeUsage {
    pub(crate) fn add_session(&mut self, usage: &ResourcesUsage) {
        self.sessions += 1;
        self.usage.add(usage);
    }

    pub(crate) fn remove_session(&mut self, usage: &ResourcesUsage) {
        self.sessions = self.sessions.saturating_sub(1);
        self.usage.subtract(usage);
    }

    /// Sum of several node figures
    #[must_use]
    pub fn total<'a>(figures: impl IntoIterator<Item = &'a NodeUsage>) -> NodeUsage {
        let mut out = NodeUsage::default();
        for figure in figures {
            out.sessions += figure.sessions;
            out.usage.add(&figure.usage);
            out.updated_at = out.updated_at.max(figure.updated_at);
        }
        out
    }
}

/// Bottom-up message from a node to its parent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourcesUsageUpdate {
    /// The sending node
    pub node: Node,
    /// Per-node figures for the sender and every node of its subtree
    pub nodes: BTreeMap<NodeId, NodeUsage>,
}

impl ResourcesUsageUpdate {
    /// Rolled-up figure of the whole subtree
    #[must_use]
    pub fn subtree_total(&self) -> NodeUsage {
        NodeUsage::total(self.nodes.values())
    }
}

/// Top-down answer: every node figure the parent knows about
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesDigest {
    pub nodes: BTreeMap<NodeId, NodeUsage>,
}

/// What one GC page did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub visited: usize,
    pub expired: usize,
    pub offloads_rolled_back: usize,
    pub onloads_reclaimed: usize,
    pub offloaded_pruned: usize,
}

impl GcReport {
    /// Sessions deleted by this page
    #[must_use]
    pub fn collected(&self) -> usize {
        self.expired + self.onloads_reclaimed + self.offloaded_pruned
    }

    pub fn merge(&mut self, other: &GcReport) {
        self.visited += other.visited;
        self.expired += other.expired;
        self.offloads_rolled_back += other.offloads_rolled_back;
        self.onloads_reclaimed += other.onloads_reclaimed;
        self.offloaded_pruned += other.offloaded_pruned;
    }
}

/// One GC page: what it did and where to resume
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GcPage {
    pub report: GcReport,
    /// Cursor for the next page; `None` once the sweep is complete
    pub cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offload_data_keeps_shapes_and_empty_collections() {
        let mut data = OffloadData::default();
        data.insert("name", SessionValue::String("ada".into()));
        data.insert("empty-list", SessionValue::List(vec![]));
        data.insert("tags", SessionValue::Set(BTreeSet::from(["a".to_string()])));
        data.insert("board", SessionValue::ZSet(vec![ScoredMember::new("x", 1.5)]));
        data.insert("empty-hash", SessionValue::Hash(BTreeMap::new()));
        assert_eq!(data.len(), 5);

        let mut rebuilt = OffloadData::default();
        rebuilt.merge(data.clone());
        assert_eq!(rebuilt, data);
        assert!(rebuilt.list["empty-list"].is_empty());
        assert!(rebuilt.hash["empty-hash"].is_empty());
    }

    #[test]
    fn test_zset_normalization_orders_by_score() {
        let value = SessionValue::ZSet(vec![
            ScoredMember::new("b", 2.0),
            ScoredMember::new("a", 2.0),
            ScoredMember::new("c", -1.0),
        ])
        .normalized();
        let SessionValue::ZSet(members) = value else {
            panic!("expected zset");
        };
        let order: Vec<&str> = members.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_record_flags() {
        let mut record = SessionRecord::new(SessionState::Active, 10, 10, Some(20));
        assert!(record.is_offloadable());
        record.grant(AcquireSessionOptions::default());
        assert!(!record.is_offloadable());
        assert!(record.is_expired(20));
        assert!(!record.is_expired(19));
    }

    #[test]
    fn test_node_usage_total() {
        let a = NodeUsage {
            sessions: 2,
            usage: ResourcesUsage::new().with("cpu", 1.0),
            updated_at: 5,
        };
        let b = NodeUsage {
            sessions: 1,
            usage: ResourcesUsage::new().with("cpu", 0.5).with("mem", 3.0),
            updated_at: 9,
        };
        let total = NodeUsage::total([&a, &b]);
        assert_eq!(total.sessions, 3);
        assert_eq!(total.usage.get("cpu"), 1.5);
        assert_eq!(total.usage.get("mem"), 3.0);
        assert_eq!(total.updated_at, 9);
    }
}
