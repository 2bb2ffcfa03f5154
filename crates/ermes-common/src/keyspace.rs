//! Keyspace partitioning
//!
//! Every record lives in the single shared key-value table, so logical
//! entities are kept apart by key prefix:
//!
//! | Namespace | Prefix | Visibility |
//! |-----------|--------|------------|
//! | session data | `s:<sessionId>:` | public |
//! | nodes | `n:` | public |
//! | session metadata | `m:<sessionId>:` | internal |
//! | config and indexes | `c:` | internal |
//!
//! The layout is shared with other implementations of the store and must
//! not change.

use crate::types::SessionId;

/// Prefix of the session data namespace
pub const SESSION_DATA_PREFIX: &str = "s:";
/// Prefix of the node namespace
pub const NODE_PREFIX: &str = "n:";
/// Prefix of the session metadata namespace
pub const SESSION_METADATA_PREFIX: &str = "m:";
/// Prefix of the config and index namespace
pub const CONFIG_PREFIX: &str = "c:";

/// Name of the sessions index inside the config namespace
pub const SESSIONS_SET: &str = "sessions_set";
/// Name of the offloadable sessions index inside the config namespace
pub const OFFLOADABLE_SESSIONS_SET: &str = "offloadable_sessions_set";
/// Name of the offloaded sessions index inside the config namespace
pub const OFFLOADED_SESSIONS_SET: &str = "offloaded_sessions_set";
/// Name of the lookup-node directory inside the config namespace
pub const LOOKUP_NODES: &str = "lookup_nodes";
/// Key (inside the config namespace) holding the id of the local node
pub const CURRENT_NODE: &str = "current_node";

/// Errors from keyspace access
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeySpaceError {
    #[error("key {key} is not in the key space {prefix}")]
    NotInKeySpace { key: String, prefix: String },
    #[error("session-scoped key space requested without a session id")]
    SessionScopeUnset,
}

/// A key prefix: maps logical keys in and out of one namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The raw prefix of this key space
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Map a logical key into this key space
    #[must_use]
    pub fn key(&self, key: &str) -> String {
        let mut out = String::with_capacity(self.prefix.len() + key.len());
        out.push_str(&self.prefix);
        out.push_str(key);
        out
    }

    /// Check if a key is in the key space
    #[must_use]
    pub fn is(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }

    /// Strip the prefix from a key produced by [`KeySpace::key`]
    pub fn unwrap<'a>(&self, key: &'a str) -> Result<&'a str, KeySpaceError> {
        key.strip_prefix(&self.prefix)
            .ok_or_else(|| KeySpaceError::NotInKeySpace {
                key: key.to_string(),
                prefix: self.prefix.clone(),
            })
    }
}

/// The public key spaces (session data and nodes).
#[derive(Clone, Debug)]
pub struct PublicKeySpaces {
    session: Option<KeySpace>,
    node: KeySpace,
}

impl PublicKeySpaces {
    #[must_use]
    pub fn for_session(session_id: &SessionId) -> Self {
        Self {
            session: Some(KeySpace::new(format!("{SESSION_DATA_PREFIX}{session_id}:"))),
            node: KeySpace::new(NODE_PREFIX),
        }
    }

    /// Key spaces with no session scope; [`Self::session`] fails.
    #[must_use]
    pub fn global() -> Self {
        Self {
            session: None,
            node: KeySpace::new(NODE_PREFIX),
        }
    }

    pub fn session(&self) -> Result<&KeySpace, KeySpaceError> {
        self.session.as_ref().ok_or(KeySpaceError::SessionScopeUnset)
    }

    #[must_use]
    pub fn node(&self) -> &KeySpace {
        &self.node
    }
}

/// The internal key spaces (session metadata, config and indexes).
#[derive(Clone, Debug)]
pub struct InternalKeySpaces {
    session_metadata: Option<KeySpace>,
    config: KeySpace,
}

impl InternalKeySpaces {
    #[must_use]
    pub fn for_session(session_id: &SessionId) -> Self {
        Self {
            session_metadata: Some(KeySpace::new(format!(
                "{SESSION_METADATA_PREFIX}{session_id}:"
            ))),
            config: KeySpace::new(CONFIG_PREFIX),
        }
    }

    #[must_use]
    pub fn global() -> Self {
        Self {
            session_metadata: None,
            config: KeySpace::new(CONFIG_PREFIX),
        }
    }

    pub fn session_metadata(&self) -> Result<&KeySpace, KeySpaceError> {
        self.session_metadata
            .as_ref()
            .ok_or(KeySpaceError::SessionScopeUnset)
    }

    #[must_use]
    pub fn config(&self) -> &KeySpace {
        &self.config
    }
}

/// All key spaces, optionally scoped to one session.
///
/// Session scoping takes a [`SessionId`], which is validated on
/// construction, so a malformed id is rejected before any key is built.
#[derive(Clone, Debug)]
pub struct KeySpaces {
    pub public: PublicKeySpaces,
    pub internal: InternalKeySpaces,
}

impl KeySpaces {
    #[must_use]
    pub fn for_session(session_id: &SessionId) -> Self {
        Self {
            public: PublicKeySpaces::for_session(session_id),
            internal: InternalKeySpaces::for_session(session_id),
        }
    }

    /// Parse and validate a raw id, then scope to it.
    pub fn for_raw_session(session_id: &str) -> crate::Result<Self> {
        let id = SessionId::parse(session_id)?;
        Ok(Self::for_session(&id))
    }

    #[must_use]
    pub fn global() -> Self {
        Self {
            public: PublicKeySpaces::global(),
            internal: InternalKeySpaces::global(),
        }
    }

    pub fn session(&self) -> Result<&KeySpace, KeySpaceError> {
        self.public.session()
    }

    #[must_use]
    pub fn node(&self) -> &KeySpace {
        self.public.node()
    }

    pub fn session_metadata(&self) -> Result<&KeySpace, KeySpaceError> {
        self.internal.session_metadata()
    }

    #[must_use]
    pub fn config(&self) -> &KeySpace {
        self.internal.config()
    }

    /// Key of an index member: `c:<index>:<member>`
    #[must_use]
    pub fn index_member(&self, index: &str, member: &str) -> String {
        self.config().key(&format!("{index}:{member}"))
    }

    /// Key space holding the members of one index
    #[must_use]
    pub fn index(index: &str) -> KeySpace {
        KeySpace::new(format!("{CONFIG_PREFIX}{index}:"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::parse("123e4567-e89b-12d3-a456-426614174000").unwrap()
    }

    #[test]
    fn test_session_prefixes_are_bit_exact() {
        let spaces = KeySpaces::for_session(&sid());
        assert_eq!(
            spaces.session().unwrap().key("cart"),
            "s:123e4567-e89b-12d3-a456-426614174000:cart"
        );
        assert_eq!(
            spaces.session_metadata().unwrap().key("info"),
            "m:123e4567-e89b-12d3-a456-426614174000:info"
        );
        assert_eq!(spaces.node().key("edge-1"), "n:edge-1");
        assert_eq!(spaces.config().key("sessions_set"), "c:sessions_set");
    }

    #[test]
    fn test_is_and_unwrap_round_trip() {
        let spaces = KeySpaces::for_session(&sid());
        let session = spaces.session().unwrap();
        let key = session.key("a:b");
        assert!(session.is(&key));
        assert_eq!(session.unwrap(&key).unwrap(), "a:b");
        assert!(!spaces.node().is(&key));
    }

    #[test]
    fn test_unwrap_foreign_key_fails() {
        let node = KeySpace::new(NODE_PREFIX);
        assert!(matches!(
            node.unwrap("c:x"),
            Err(KeySpaceError::NotInKeySpace { .. })
        ));
        // shorter than the prefix must not panic
        assert!(!KeySpace::new("s:long:").is("s"));
    }

    #[test]
    fn test_global_spaces_reject_session_scope() {
        let spaces = KeySpaces::global();
        assert_eq!(spaces.session(), Err(KeySpaceError::SessionScopeUnset));
        assert_eq!(
            spaces.session_metadata(),
            Err(KeySpaceError::SessionScopeUnset)
        );
        assert_eq!(spaces.node().prefix(), "n:");
    }

    #[test]
    fn test_raw_session_validation() {
        assert!(KeySpaces::for_raw_session("short").is_err());
        assert!(KeySpaces::for_raw_session(sid().as_str()).is_ok());
    }

    #[test]
    fn test_index_member_layout() {
        let spaces = KeySpaces::global();
        let key = spaces.index_member(SESSIONS_SET, sid().as_str());
        assert_eq!(key, format!("c:sessions_set:{}", sid()));
        assert_eq!(KeySpaces::index(SESSIONS_SET).unwrap(&key).unwrap(), sid().as_str());
    }
}
