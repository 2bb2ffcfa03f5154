//! Session lifecycle verbs: create, acquire/release, metadata, data
//! entries and index scans.
//!
//! The acquire/release pair behaves as a readers-writer lock per session:
//! the exclusive hold blocks offloading, shared holds do not, and
//! read-under-offload holds are only granted while a move is in flight.

use crate::keys::{self, SessionKeys};
use crate::store::{KvRead, KvWrite, SessionStore, StoreResult};
use crate::types::{NodeUsage, OffloadData, ReleaseOutcome, ScanPage, SessionRecord, SessionValue};
use ermes_common::keyspace::{OFFLOADABLE_SESSIONS_SET, OFFLOADED_SESSIONS_SET, SESSIONS_SET};
use ermes_common::{
    AcquireSessionOptions, CreateSessionOptions, Error, KeySpaces, ResourcesUsage, Result,
    SessionId, SessionInfoForOffloadDecision, SessionLocation, SessionMetadata,
    SessionMetadataOptions, SessionState, now_millis,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// The part of [`SessionMetadata`] stored in `m:<sid>:meta`; timestamps
/// live in the lifecycle record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredMetadata {
    pub client_geo_coordinates: Option<ermes_common::GeoCoordinates>,
    pub attributes: BTreeMap<String, String>,
}

impl StoredMetadata {
    pub fn from_metadata(metadata: &SessionMetadata) -> Self {
        Self {
            client_geo_coordinates: metadata.client_geo_coordinates,
            attributes: metadata.attributes.clone(),
        }
    }

    pub fn into_metadata(self, record: &SessionRecord) -> SessionMetadata {
        SessionMetadata {
            client_geo_coordinates: self.client_geo_coordinates,
            created_at: record.created_at,
            expires_at: record.expires_at,
            attributes: self.attributes,
        }
    }
}

// ---- Helpers shared by the other verb modules ----

pub(crate) fn not_found(id: &SessionId) -> Error {
    Error::SessionNotFound(id.to_string())
}

/// Lifecycle record, or `SessionNotFound`
pub(crate) fn load_record(
    t: &impl KvRead,
    keys: &SessionKeys,
    id: &SessionId,
) -> StoreResult<SessionRecord> {
    t.get_record(&keys.info)?.ok_or_else(|| not_found(id).into())
}

pub(crate) fn local_usage(t: &impl KvRead) -> StoreResult<NodeUsage> {
    Ok(t.get_record(&keys::local_usage())?.unwrap_or_default())
}

/// Write the record, reconcile its index memberships and, when it starts
/// or stops being held locally, the local node usage.
pub(crate) fn commit_record(
    t: &mut impl KvWrite,
    keys: &SessionKeys,
    record: &SessionRecord,
    was_local: bool,
) -> StoreResult<()> {
    t.put_record(&keys.info, record)?;
    reconcile(t, &keys.sessions_index, record.is_local(), record.created_at)?;
    reconcile(t, &keys.offloadable_index, record.is_offloadable(), record.last_activity_at)?;
    reconcile(
        t,
        &keys.offloaded_index,
        record.state == SessionState::Offloaded,
        record.state_changed_at,
    )?;

    if was_local != record.is_local() {
        let usage: ResourcesUsage = t.get_record(&keys.resources)?.unwrap_or_default();
        let mut local = local_usage(t)?;
        if record.is_local() {
            local.add_session(&usage);
        } else {
            local.remove_session(&usage);
        }
        local.updated_at = now_millis();
        t.put_record(&keys::local_usage(), &local)?;
    }
    Ok(())
}

fn reconcile(t: &mut impl KvWrite, key: &str, member: bool, score: u64) -> StoreResult<()> {
    if member {
        t.put_record(key, &score)
    } else {
        t.delete(key).map(|_| ())
    }
}

/// Delete every trace of a session on this node.
pub(crate) fn purge_session(
    t: &mut impl KvWrite,
    keys: &SessionKeys,
    record: &SessionRecord,
) -> StoreResult<()> {
    if record.is_local() {
        let usage: ResourcesUsage = t.get_record(&keys.resources)?.unwrap_or_default();
        let mut local = local_usage(t)?;
        local.remove_session(&usage);
        local.updated_at = now_millis();
        t.put_record(&keys::local_usage(), &local)?;
    }
    t.delete_prefix(keys.data.prefix())?;
    t.delete_prefix(keys.metadata_space.prefix())?;
    for key in [
        &keys.sessions_index,
        &keys.offloadable_index,
        &keys.offloaded_index,
        &keys.lookup,
    ] {
        t.delete(key)?;
    }
    Ok(())
}

/// Parse a scan cursor: empty means "from the start"
pub(crate) fn parse_cursor(cursor: &str) -> Result<Option<SessionId>> {
    if cursor.is_empty() {
        return Ok(None);
    }
    SessionId::parse(cursor)
        .map(Some)
        .map_err(|_| Error::InvalidCursor(cursor.to_string()))
}

/// Data entry names must be non-empty: the empty string is the
/// "first page" cursor.
pub(crate) fn check_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("empty session entry name"));
    }
    Ok(())
}

impl SessionStore {
    // ---- Create ----

    /// Create a session and return its id.
    ///
    /// Without an explicit id a fresh one is generated, retrying on the
    /// (unlikely) collision; an explicit id that already exists fails with
    /// `SessionIdAlreadyExists` and leaves the existing record untouched.
    pub fn create_session(&self, options: &CreateSessionOptions) -> Result<SessionId> {
        self.create(options, None)
    }

    /// Create a session and take its exclusive hold in the same step.
    pub fn create_and_acquire_session(
        &self,
        options: &CreateSessionOptions,
        acquire: AcquireSessionOptions,
    ) -> Result<SessionId> {
        self.create(options, Some(acquire))
    }

    fn create(
        &self,
        options: &CreateSessionOptions,
        acquire: Option<AcquireSessionOptions>,
    ) -> Result<SessionId> {
        loop {
            let id = options.session_id.clone().unwrap_or_else(SessionId::generate);
            let now = now_millis();
            let created = self.write("create_session", |t| {
                let keys = SessionKeys::new(&id)?;
                if t.contains(&keys.info)? {
                    return Ok(false);
                }
                let mut record =
                    SessionRecord::new(SessionState::Active, now, now, options.expires_at);
                if let Some(acquire) = acquire {
                    record.grant(acquire);
                }
                let metadata = StoredMetadata {
                    client_geo_coordinates: options.client_geo_coordinates,
                    attributes: BTreeMap::new(),
                };
                t.put_record(&keys.meta, &metadata)?;
                t.put_record(&keys.resources, &ResourcesUsage::new())?;
                commit_record(t, &keys, &record, false)?;
                Ok(true)
            })?;

            if created {
                info!(session_id = %id, acquired = acquire.is_some(), "session created");
                return Ok(id);
            }
            if options.session_id.is_some() {
                return Err(Error::SessionIdAlreadyExists(id.to_string()));
            }
            debug!(session_id = %id, "generated session id collided, retrying");
        }
    }

    // ---- Acquire / release ----

    /// Acquire a session.
    ///
    /// Returns `None` when access is granted locally, or the location to
    /// redirect to when the session was offloaded.
    pub fn acquire_session(
        &self,
        id: &SessionId,
        options: AcquireSessionOptions,
    ) -> Result<Option<SessionLocation>> {
        let now = now_millis();
        self.write("acquire_session", |t| {
            let keys = SessionKeys::new(id)?;
            let mut record = load_record(t, &keys, id)?;
            match record.state {
                SessionState::Offloaded => return Ok(record.location.clone()),
                SessionState::Onloading => return Err(not_found(id).into()),
                SessionState::Offloading => {
                    if !options.allow_while_offloading {
                        return Err(Error::SessionIsOffloading(id.to_string()).into());
                    }
                    record.offloading_reads += 1;
                }
                SessionState::Active => {
                    if options.is_exclusive() && record.exclusive_hold {
                        return Err(Error::SessionAlreadyAcquired(id.to_string()).into());
                    }
                    record.grant(options);
                }
            }
            record.last_activity_at = now;
            commit_record(t, &keys, &record, record.is_local())?;
            Ok(None)
        })
    }

    /// Release a hold taken by [`Self::acquire_session`] with the same options.
    pub fn release_session(
        &self,
        id: &SessionId,
        options: AcquireSessionOptions,
    ) -> Result<ReleaseOutcome> {
        let now = now_millis();
        let outcome = self.write("release_session", |t| {
            let keys = SessionKeys::new(id)?;
            let mut record = load_record(t, &keys, id)?;
            let mut outcome = ReleaseOutcome::default();
            match record.state {
                SessionState::Offloaded => {
                    outcome.location = record.location.clone();
                    return Ok(outcome);
                }
                SessionState::Onloading => return Err(not_found(id).into()),
                SessionState::Offloading
                    if options.allow_while_offloading && record.offloading_reads > 0 =>
                {
                    record.offloading_reads -= 1;
                }
                _ if options.is_exclusive() => {
                    if !record.exclusive_hold {
                        warn!(session_id = %id, "release of an exclusive hold that is not held");
                    }
                    record.exclusive_hold = false;
                    if record.offload_requested {
                        record.offload_requested = false;
                        outcome.offload_unblocked = true;
                    }
                }
                _ => record.shared_holds = record.shared_holds.saturating_sub(1),
            }
            record.last_activity_at = now;
            commit_record(t, &keys, &record, record.is_local())?;
            Ok(outcome)
        })?;
        if outcome.offload_unblocked {
            info!(session_id = %id, "exclusive hold released, pending offload unblocked");
        }
        Ok(outcome)
    }

    // ---- Records and metadata ----

    /// The lifecycle record of a session, if this node knows it.
    pub fn get_session_record(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        self.read("get_session_record", |t| {
            t.get_record(&SessionKeys::new(id)?.info)
        })
    }

    pub fn get_session_metadata(&self, id: &SessionId) -> Result<SessionMetadata> {
        self.read("get_session_metadata", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            if record.state == SessionState::Offloaded {
                return Err(not_found(id).into());
            }
            let stored: StoredMetadata = t.get_record(&keys.meta)?.unwrap_or_default();
            Ok(stored.into_metadata(&record))
        })
    }

    /// Apply a partial metadata update; returns the resulting metadata.
    pub fn set_session_metadata(
        &self,
        id: &SessionId,
        options: &SessionMetadataOptions,
    ) -> Result<SessionMetadata> {
        self.write("set_session_metadata", |t| {
            let keys = SessionKeys::new(id)?;
            let mut record = load_record(t, &keys, id)?;
            if record.state == SessionState::Offloaded {
                return Err(not_found(id).into());
            }
            let mut stored: StoredMetadata = t.get_record(&keys.meta)?.unwrap_or_default();
            if let Some(geo) = options.client_geo_coordinates {
                stored.client_geo_coordinates = Some(geo);
            }
            for (key, value) in &options.attributes {
                if value.is_empty() {
                    stored.attributes.remove(key);
                } else {
                    stored.attributes.insert(key.clone(), value.clone());
                }
            }
            if let Some(expires_at) = options.expires_at {
                record.expires_at = Some(expires_at);
                t.put_record(&keys.info, &record)?;
            }
            t.put_record(&keys.meta, &stored)?;
            Ok(stored.into_metadata(&record))
        })
    }

    /// Snapshot of what the selector needs to rank a session.
    pub fn session_offload_info(
        &self,
        id: &SessionId,
        now: u64,
    ) -> Result<SessionInfoForOffloadDecision> {
        self.read("session_offload_info", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            if !record.is_local() {
                return Err(not_found(id).into());
            }
            let stored: StoredMetadata = t.get_record(&keys.meta)?.unwrap_or_default();
            Ok(SessionInfoForOffloadDecision {
                session_id: id.clone(),
                client_geo_coordinates: stored.client_geo_coordinates,
                resources_usage: t.get_record(&keys.resources)?.unwrap_or_default(),
                created_at: record.created_at,
                idle_ms: now.saturating_sub(record.last_activity_at),
            })
        })
    }

    // ---- Session data entries ----

    /// Write one data entry of an active session.
    pub fn set_session_value(&self, id: &SessionId, name: &str, value: SessionValue) -> Result<()> {
        check_entry_name(name)?;
        self.write("set_session_value", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            match record.state {
                SessionState::Active => {}
                SessionState::Offloading => {
                    return Err(Error::SessionIsOffloading(id.to_string()).into());
                }
                _ => return Err(not_found(id).into()),
            }
            t.put_record(&keys.data.key(name), &value.normalized())
        })
    }

    /// Read one data entry; readable while the session is offloading.
    pub fn get_session_value(&self, id: &SessionId, name: &str) -> Result<Option<SessionValue>> {
        self.read("get_session_value", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            if !record.is_local() {
                return Err(not_found(id).into());
            }
            t.get_record(&keys.data.key(name))
        })
    }

    /// Remove one data entry; returns whether it existed.
    pub fn remove_session_value(&self, id: &SessionId, name: &str) -> Result<bool> {
        self.write("remove_session_value", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            match record.state {
                SessionState::Active => t.delete(&keys.data.key(name)),
                SessionState::Offloading => Err(Error::SessionIsOffloading(id.to_string()).into()),
                _ => Err(not_found(id).into()),
            }
        })
    }

    /// The whole payload of a locally held session.
    pub fn get_session_data(&self, id: &SessionId) -> Result<OffloadData> {
        self.read("get_session_data", |t| {
            let keys = SessionKeys::new(id)?;
            let record = load_record(t, &keys, id)?;
            if !record.is_local() {
                return Err(not_found(id).into());
            }
            let mut data = OffloadData::default();
            for (key, bytes) in t.scan_prefix(keys.data.prefix(), None, usize::MAX)? {
                let name = keys.data.unwrap(&key)?;
                data.insert(name, bincode::deserialize(&bytes)?);
            }
            Ok(data)
        })
    }

    // ---- Scans ----

    /// Page through the sessions held by this node.
    pub fn scan_sessions(&self, cursor: &str, count: usize) -> Result<ScanPage> {
        self.scan_index(SESSIONS_SET, cursor, count)
    }

    /// Page through the sessions that may be offloaded right now.
    pub fn scan_offloadable_sessions(&self, cursor: &str, count: usize) -> Result<ScanPage> {
        self.scan_index(OFFLOADABLE_SESSIONS_SET, cursor, count)
    }

    /// Page through the sessions that moved away and keep a redirect here.
    pub fn scan_offloaded_sessions(&self, cursor: &str, count: usize) -> Result<ScanPage> {
        self.scan_index(OFFLOADED_SESSIONS_SET, cursor, count)
    }

    fn scan_index(&self, index: &str, cursor: &str, count: usize) -> Result<ScanPage> {
        if count == 0 {
            return Err(Error::InvalidCount(count));
        }
        let space = KeySpaces::index(index);
        let after = parse_cursor(cursor)?.map(|id| space.key(id.as_str()));

        let mut found = self.read("scan_index", |t| {
            t.scan_keys(space.prefix(), after.as_deref(), count.saturating_add(1))
        })?;
        let more = found.len() > count;
        found.truncate(count);

        let mut page = ScanPage::default();
        for key in &found {
            match space.unwrap(key).map(SessionId::parse) {
                Ok(Ok(id)) => page.session_ids.push(id),
                _ => warn!(key = %key, "skipping malformed index member"),
            }
        }
        if more {
            if let Some(last) = found.last() {
                page.cursor = space.unwrap(last)?.to_string();
            }
        }
        Ok(page)
    }
}
