//! Offload and onload verbs.
//!
//! Source side: `offload_start` (`Active -> Offloading`), any number of
//! `offload_data` pages, then `offload_finish` (`Offloading -> Offloaded`),
//! the single commit point. Destination side: `onload_start` creates an
//! `Onloading` record, `onload_data` writes pages, `onload_finish` makes
//! the session `Active`.

use crate::keys::SessionKeys;
use crate::session::{
    StoredMetadata, check_entry_name, commit_record, load_record, not_found, purge_session,
};
use crate::store::{KvRead, KvWrite, SessionStore, StoreResult, current_node_in};
use crate::topology::lookup_node_for;
use crate::types::{OffloadData, OffloadPage, SessionRecord, SessionValue};
use ermes_common::{
    Error, OffloadSessionOptions, ResourcesUsage, Result, SessionId, SessionLocation,
    SessionMetadata, SessionState, now_millis,
};
use tracing::{debug, info};

/// Outcome of an offload start attempt, decided inside the transaction
enum StartOutcome {
    Started,
    /// Refused because of the exclusive hold; the request is recorded
    Held,
}

/// A redirect must lead away from the node that keeps it.
fn check_redirect(current: &str, location: &SessionLocation) -> StoreResult<()> {
    if location.host == current {
        return Err(Error::invalid_argument(format!(
            "session {} cannot be redirected to its current node {current}",
            location.session_id
        ))
        .into());
    }
    Ok(())
}

impl SessionStore {
    /// Move an active session to `Offloading`.
    pub fn offload_start(&self, id: &SessionId, options: &OffloadSessionOptions) -> Result<()> {
        let now = now_millis();
        let outcome = self.write("offload_start", |t| {
            let keys = SessionKeys::new(id)?;
            let mut record = load_record(t, &keys, id)?;
            match record.state {
                SessionState::Active => {}
                SessionState::Offloading => {
                    return Err(Error::SessionIsOffloading(id.to_string()).into());
                }
                SessionState::Offloaded | SessionState::Onloading => {
                    return Err(not_found(id).into());
                }
            }
            if record.exclusive_hold && !options.force {
                // Committed so that the release can report the waiting offloader
                record.offload_requested = true;
                t.put_record(&keys.info, &record)?;
                return Ok(StartOutcome::Held);
            }
            record.offload_requested = false;
            record.set_state(SessionState::Offloading, now);
            commit_record(t, &keys, &record, true)?;
            Ok(StartOutcome::Started)
        })?;

        match outcome {
            StartOutcome::Started => {
                info!(session_id = %id, force = options.force, "offload started");
                Ok(())
            }
            StartOutcome::Held => Err(Error::UnableToOffloadAcquiredSession(id.to_string())),
        }
    }

    /// Read one page of the payload of an offloading session.
    ///
    /// `cursor` is empty on the first call; the returned page carries the
    /// cursor of the next one, empty once the payload is exhausted.
    pub fn offload_data(
        &self,
        id: &SessionId,
        cursor: &str,
        page_size: usize,
    ) -> Result<OffloadPage> {
        if page_size == 0 {
            return Err(Error::InvalidCount(page_size));
        }
        self.read("offload_data", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            if record.state != SessionState::Offloading {
                return Err(not_found(id).into());
            }
            let after = (!cursor.is_empty()).then(|| keys.data.key(cursor));
            let mut entries =
                t.scan_prefix(keys.data.prefix(), after.as_deref(), page_size.saturating_add(1))?;
            let more = entries.len() > page_size;
            entries.truncate(page_size);

            let mut page = OffloadPage::default();
            for (key, bytes) in &entries {
                let name = keys.data.unwrap(key)?;
                let value: SessionValue = bincode::deserialize(bytes)?;
                page.data.insert(name, value);
            }
            if more {
                if let Some((last, _)) = entries.last() {
                    page.cursor = keys.data.unwrap(last)?.to_string();
                }
            }
            debug!(
                session_id = %id,
                entries = entries.len(),
                last = page.is_last(),
                "offload page read"
            );
            Ok(page)
        })
    }

    /// Commit an offload: `Offloading -> Offloaded`.
    ///
    /// Stores the new location, writes the lookup entry and drops the local
    /// payload. Repeating it on an already offloaded session returns
    /// `Ok(false)` and changes nothing.
    pub fn offload_finish(&self, id: &SessionId, location: &SessionLocation) -> Result<bool> {
        let now = now_millis();
        let applied = self.write("offload_finish", |t| {
            let keys = SessionKeys::new(id)?;
            let mut record = load_record(t, &keys, id)?;
            match record.state {
                SessionState::Offloading => {}
                SessionState::Offloaded => return Ok(false),
                SessionState::Active | SessionState::Onloading => {
                    return Err(not_found(id).into());
                }
            }
            let current = current_node_in(t)?;
            check_redirect(&current, location)?;
            let lookup = lookup_node_for(t, &current, &location.host)?;

            record.set_state(SessionState::Offloaded, now);
            record.location = Some(location.clone());
            record.exclusive_hold = false;
            record.shared_holds = 0;
            record.offloading_reads = 0;
            // usage leaves the local figures before the payload is dropped
            commit_record(t, &keys, &record, true)?;

            t.delete_prefix(keys.data.prefix())?;
            t.delete(&keys.meta)?;
            t.delete(&keys.resources)?;
            t.put_bytes(&keys.lookup, lookup.as_bytes())?;
            Ok(true)
        })?;

        if applied {
            info!(session_id = %id, location = %location, "offload confirmed");
        } else {
            debug!(session_id = %id, "offload already confirmed");
        }
        Ok(applied)
    }

    /// Point the redirect of an offloaded session at a newer location.
    ///
    /// Returns whether the stored location changed.
    pub fn update_offloaded_session_location(
        &self,
        id: &SessionId,
        location: &SessionLocation,
    ) -> Result<bool> {
        self.write("update_offloaded_session_location", |t| {
            let keys = SessionKeys::new(id)?;
            let mut record = load_record(t, &keys, id)?;
            if record.state != SessionState::Offloaded {
                return Err(Error::SessionIsNotOffloaded(id.to_string()).into());
            }
            if record.location.as_ref() == Some(location) {
                return Ok(false);
            }
            let current = current_node_in(t)?;
            check_redirect(&current, location)?;
            let lookup = lookup_node_for(t, &current, &location.host)?;
            record.location = Some(location.clone());
            t.put_record(&keys.info, &record)?;
            t.put_bytes(&keys.lookup, lookup.as_bytes())?;
            Ok(true)
        })
    }

    // ---- Onload (destination side) ----

    /// Open an onload handshake for `id`.
    ///
    /// Fails with `SessionAlreadyOnloaded` when the id is already live (or
    /// already being onloaded) here. A session this node had offloaded is
    /// reinstated.
    pub fn onload_start(
        &self,
        id: &SessionId,
        metadata: &SessionMetadata,
        origin: Option<&SessionLocation>,
    ) -> Result<()> {
        let now = now_millis();
        self.write("onload_start", |t| {
            let keys = SessionKeys::new(id)?;
            if let Some(existing) = t.get_record::<SessionRecord>(&keys.info)? {
                if existing.state != SessionState::Offloaded {
                    return Err(Error::SessionAlreadyOnloaded(id.to_string()).into());
                }
                // Coming back: the redirect is obsolete
                t.delete(&keys.lookup)?;
            }
            let mut record = SessionRecord::new(
                SessionState::Onloading,
                now,
                metadata.created_at,
                metadata.expires_at,
            );
            record.origin = origin.cloned();
            t.delete_prefix(keys.data.prefix())?;
            t.put_record(&keys.meta, &StoredMetadata::from_metadata(metadata))?;
            t.put_record(&keys.resources, &ResourcesUsage::new())?;
            commit_record(t, &keys, &record, false)
        })?;
        debug!(session_id = %id, "onload started");
        Ok(())
    }

    /// Write one received page into an onloading session.
    pub fn onload_data(&self, id: &SessionId, data: &OffloadData) -> Result<()> {
        self.write("onload_data", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            if record.state != SessionState::Onloading {
                return Err(not_found(id).into());
            }
            for (name, value) in data.clone().into_entries() {
                check_entry_name(&name)?;
                t.put_record(&keys.data.key(&name), &value.normalized())?;
            }
            Ok(())
        })
    }

    /// Close the handshake: `Onloading -> Active`.
    pub fn onload_finish(&self, id: &SessionId) -> Result<()> {
        let now = now_millis();
        self.write("onload_finish", |t| {
            let keys = SessionKeys::new(id)?;
            let mut record = load_record(t, &keys, id)?;
            match record.state {
                SessionState::Onloading => {}
                SessionState::Active | SessionState::Offloading => {
                    return Err(Error::SessionAlreadyOnloaded(id.to_string()).into());
                }
                SessionState::Offloaded => return Err(not_found(id).into()),
            }
            record.set_state(SessionState::Active, now);
            record.last_activity_at = now;
            commit_record(t, &keys, &record, false)
        })?;
        info!(session_id = %id, "session onloaded");
        Ok(())
    }

    /// Drop a handshake that will not complete. Returns whether there was one.
    pub fn onload_abort(&self, id: &SessionId) -> Result<bool> {
        let aborted = self.write("onload_abort", |t| {
            let keys = SessionKeys::new(id)?;
            match t.get_record::<SessionRecord>(&keys.info)? {
                Some(record) if record.state == SessionState::Onloading => {
                    purge_session(t, &keys, &record)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;
        if aborted {
            info!(session_id = %id, "onload aborted");
        }
        Ok(aborted)
    }

    /// Where a session onloaded here came from, if known.
    pub fn session_origin(&self, id: &SessionId) -> Result<Option<SessionLocation>> {
        self.read("session_origin", |t| {
            let keys = SessionKeys::new(id)?;
            Ok(load_record(t, &keys, id)?.origin)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScoredMember;
    use ermes_common::{AcquireSessionOptions, CreateSessionOptions};
    use ermes_topology::{Area, Infrastructure, Node};
    use std::collections::{BTreeMap, BTreeSet};

    fn node_store(current: &str) -> SessionStore {
        let store = SessionStore::open_in_memory().unwrap();
        let infra = Infrastructure::new(vec![
            Area::new(Node::new("cloud", "cloud:6379"))
                .with_area(
                    Area::new(Node::new("region", "region:6379"))
                        .with_area(Area::new(Node::new("edge-a", "a:6379")))
                        .with_area(Area::new(Node::new("edge-b", "b:6379"))),
                )
                .with_area(Area::new(Node::new("edge-c", "c:6379"))),
        ]);
        store.load_infrastructure(&infra).unwrap();
        store.set_current_node(current).unwrap();
        store
    }

    fn sample_payload(store: &SessionStore, id: &SessionId) {
        let values = [
            ("flat", SessionValue::String("v".into())),
            ("list", SessionValue::List(vec!["1".into(), "2".into()])),
            ("empty-set", SessionValue::Set(BTreeSet::new())),
            ("board", SessionValue::ZSet(vec![ScoredMember::new("m", 3.0)])),
            ("map", SessionValue::Hash(BTreeMap::from([("f".into(), "x".into())]))),
        ];
        for (name, value) in values {
            store.set_session_value(id, name, value).unwrap();
        }
    }

    #[test]
    fn test_offload_start_blocked_by_exclusive_hold() {
        let store = node_store("edge-a");
        let id = store.create_session(&CreateSessionOptions::default()).unwrap();
        store.acquire_session(&id, AcquireSessionOptions::default()).unwrap();

        assert!(matches!(
            store.offload_start(&id, &OffloadSessionOptions::default()),
            Err(Error::UnableToOffloadAcquiredSession(_))
        ));
        let outcome = store.release_session(&id, AcquireSessionOptions::default()).unwrap();
        assert!(outcome.offload_unblocked);

        store.offload_start(&id, &OffloadSessionOptions::default()).unwrap();
        let record = store.get_session_record(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Offloading);
        assert!(matches!(
            store.offload_start(&id, &OffloadSessionOptions::default()),
            Err(Error::SessionIsOffloading(_))
        ));
    }

    #[test]
    fn test_forced_offload_ignores_hold() {
        let store = node_store("edge-a");
        let id = store.create_session(&CreateSessionOptions::default()).unwrap();
        store.acquire_session(&id, AcquireSessionOptions::default()).unwrap();
        store
            .offload_start(&id, &OffloadSessionOptions::default().with_force(true))
            .unwrap();
    }

    #[test]
    fn test_acquire_while_offloading() {
        let store = node_store("edge-a");
        let id = store.create_session(&CreateSessionOptions::default()).unwrap();
        store.offload_start(&id, &OffloadSessionOptions::default()).unwrap();

        assert!(matches!(
            store.acquire_session(&id, AcquireSessionOptions::default()),
            Err(Error::SessionIsOffloading(_))
        ));
        let read = AcquireSessionOptions::default().with_allow_while_offloading(true);
        assert_eq!(store.acquire_session(&id, read).unwrap(), None);
        store.release_session(&id, read).unwrap();
        assert!(store.set_session_value(&id, "x", SessionValue::String("y".into())).is_err());
    }

    #[test]
    fn test_offload_pages_cover_payload() {
        let store = node_store("edge-a");
        let id = store.create_session(&CreateSessionOptions::default()).unwrap();
        sample_payload(&store, &id);
        let expected = store.get_session_data(&id).unwrap();
        store.offload_start(&id, &OffloadSessionOptions::default()).unwrap();

        let mut collected = OffloadData::default();
        let mut cursor = String::new();
        let mut pages = 0;
        loop {
            let page = store.offload_data(&id, &cursor, 2).unwrap();
            assert!(page.data.len() <= 2);
            pages += 1;
            collected.merge(page.data);
            if page.cursor.is_empty() {
                break;
            }
            cursor = page.cursor;
        }
        assert_eq!(pages, 3);
        assert_eq!(collected, expected);
    }

    #[test]
    fn test_offload_data_requires_offloading() {
        let store = node_store("edge-a");
        let id = store.create_session(&CreateSessionOptions::default()).unwrap();
        assert!(store.offload_data(&id, "", 10).unwrap_err().is_not_found());
    }

    #[test]
    fn test_finish_redirects_and_is_idempotent() {
        let store = node_store("edge-a");
        let id = store.create_session(&CreateSessionOptions::default()).unwrap();
        sample_payload(&store, &id);
        let location = SessionLocation::new("edge-b", id.as_str());

        assert!(store.offload_finish(&id, &location).unwrap_err().is_not_found());
        store.offload_start(&id, &OffloadSessionOptions::default()).unwrap();
        assert!(store.offload_finish(&id, &location).unwrap());
        assert!(!store.offload_finish(&id, &location).unwrap());

        assert_eq!(
            store.acquire_session(&id, AcquireSessionOptions::default()).unwrap(),
            Some(location.clone())
        );
        assert!(store.scan_sessions("", 10).unwrap().session_ids.is_empty());
        assert_eq!(store.scan_offloaded_sessions("", 10).unwrap().session_ids, vec![id.clone()]);
        assert_eq!(store.find_lookup_node(&[id.clone()]).unwrap().unwrap().id, "region");
        assert!(store.get_session_data(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_finish_rejects_current_node() {
        let store = node_store("edge-a");
        let id = store.create_session(&CreateSessionOptions::default()).unwrap();
        sample_payload(&store, &id);
        store.offload_start(&id, &OffloadSessionOptions::default()).unwrap();

        let here = SessionLocation::new("edge-a", id.as_str());
        assert!(matches!(
            store.offload_finish(&id, &here),
            Err(Error::InvalidArgument(_))
        ));
        let record = store.get_session_record(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Offloading);
        assert_eq!(record.location, None);
        assert_eq!(store.get_session_data(&id).unwrap().len(), 5);
        assert_eq!(store.find_lookup_node(&[id.clone()]).unwrap(), None);
    }

    #[test]
    fn test_update_offloaded_location() {
        let store = node_store("edge-a");
        let id = store.create_session(&CreateSessionOptions::default()).unwrap();
        let first = SessionLocation::new("edge-b", id.as_str());
        let second = SessionLocation::new("edge-c", id.as_str());

        assert!(matches!(
            store.update_offloaded_session_location(&id, &second),
            Err(Error::SessionIsNotOffloaded(_))
        ));
        store.offload_start(&id, &OffloadSessionOptions::default()).unwrap();
        store.offload_finish(&id, &first).unwrap();

        let here = SessionLocation::new("edge-a", id.as_str());
        assert!(matches!(
            store.update_offloaded_session_location(&id, &here),
            Err(Error::InvalidArgument(_))
        ));
        assert!(store.update_offloaded_session_location(&id, &second).unwrap());
        assert!(!store.update_offloaded_session_location(&id, &second).unwrap());
        assert_eq!(store.find_lookup_node(&[id.clone()]).unwrap().unwrap().id, "cloud");
        assert!(store
            .update_offloaded_session_location(&SessionId::generate(), &second)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_onload_handshake() {
        let store = node_store("edge-b");
        let id = SessionId::generate();
        let metadata = SessionMetadata {
            created_at: 7,
            ..SessionMetadata::default()
        };
        let mut data = OffloadData::default();
        data.insert("k", SessionValue::List(vec![]));

        assert!(store.onload_data(&id, &data).unwrap_err().is_not_found());
        store.onload_start(&id, &metadata, None).unwrap();
        assert!(matches!(
            store.onload_start(&id, &metadata, None),
            Err(Error::SessionAlreadyOnloaded(_))
        ));
        // not visible to clients until finished
        assert!(store
            .acquire_session(&id, AcquireSessionOptions::default())
            .unwrap_err()
            .is_not_found());

        store.onload_data(&id, &data).unwrap();
        store.onload_finish(&id).unwrap();
        assert!(matches!(
            store.onload_finish(&id),
            Err(Error::SessionAlreadyOnloaded(_))
        ));
        assert_eq!(store.get_session_data(&id).unwrap(), data);
        assert_eq!(store.get_session_record(&id).unwrap().unwrap().created_at, 7);
        assert_eq!(store.scan_sessions("", 10).unwrap().session_ids, vec![id]);
    }

    #[test]
    fn test_onload_reinstates_offloaded_session() {
        let store = node_store("edge-a");
        let id = store.create_session(&CreateSessionOptions::default()).unwrap();
        let metadata = store.get_session_metadata(&id).unwrap();
        store.offload_start(&id, &OffloadSessionOptions::default()).unwrap();
        store
            .offload_finish(&id, &SessionLocation::new("edge-b", id.as_str()))
            .unwrap();

        let origin = SessionLocation::new("edge-b", id.as_str());
        store.onload_start(&id, &metadata, Some(&origin)).unwrap();
        store.onload_finish(&id).unwrap();
        assert_eq!(store.acquire_session(&id, AcquireSessionOptions::default()).unwrap(), None);
        assert_eq!(store.session_origin(&id).unwrap(), Some(origin));
        assert_eq!(store.find_lookup_node(&[id]).unwrap(), None);
    }

    #[test]
    fn test_onload_abort() {
        let store = node_store("edge-b");
        let id = SessionId::generate();
        store.onload_start(&id, &SessionMetadata::default(), None).unwrap();
        assert!(store.onload_abort(&id).unwrap());
        assert!(!store.onload_abort(&id).unwrap());
        assert_eq!(store.get_session_record(&id).unwrap(), None);
    }
}
