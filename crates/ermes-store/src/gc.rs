//! Garbage collection pages
//!
//! A page visits up to `page_size` session records in key order, starting
//! after the cursor, and applies every decision in one transaction. The
//! returned cursor is the last visited session id, so an interrupted sweep
//! resumes where the last committed page stopped.

use crate::keys::{self, METADATA_PREFIX, SessionKeys};
use crate::session::{commit_record, parse_cursor, purge_session};
use crate::store::{KvRead, SessionStore};
use crate::types::{GcPage, GcReport, SessionRecord};
use ermes_common::{
    Error, GarbageCollectSessionsOptions, Result, SessionId, SessionState, now_millis,
};
use tracing::{debug, info, warn};

/// What GC does with one record
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Keep,
    Expire,
    RollBackOffload,
    ReclaimOnload,
    PruneOffloaded,
}

fn judge(record: &SessionRecord, now: u64, options: &GarbageCollectSessionsOptions) -> Verdict {
    let age = now.saturating_sub(record.state_changed_at);
    let orphan_ms = u64::try_from(options.orphan_timeout.as_millis()).unwrap_or(u64::MAX);
    let retention_ms = u64::try_from(options.offloaded_retention.as_millis()).unwrap_or(u64::MAX);
    match record.state {
        SessionState::Offloading if age >= orphan_ms => Verdict::RollBackOffload,
        SessionState::Onloading if age >= orphan_ms => Verdict::ReclaimOnload,
        // mid-move sessions are never expired directly
        SessionState::Offloading | SessionState::Onloading => Verdict::Keep,
        _ if record.is_expired(now) => Verdict::Expire,
        SessionState::Offloaded if age >= retention_ms => Verdict::PruneOffloaded,
        _ => Verdict::Keep,
    }
}

impl SessionStore {
    /// Run one GC page.
    ///
    /// `cursor` is `None` (or empty) for the first page. A cursor that is
    /// not a session id is rejected with `InvalidCursor`; completion is
    /// reported as a `None` next cursor.
    pub fn garbage_collect_sessions(
        &self,
        options: &GarbageCollectSessionsOptions,
        cursor: Option<&str>,
    ) -> Result<GcPage> {
        if options.page_size == 0 {
            return Err(Error::InvalidCount(options.page_size));
        }
        let after = parse_cursor(cursor.unwrap_or_default())?
            .map(|id| format!("{METADATA_PREFIX}{id};"));
        let now = options.now.unwrap_or_else(now_millis);

        let page = self.write("garbage_collect_sessions", |t| {
            let mut visited = t.scan(
                METADATA_PREFIX,
                after.as_deref(),
                options.page_size.saturating_add(1),
                &|key| keys::session_of_info_key(key).is_some(),
            )?;
            let more = visited.len() > options.page_size;
            visited.truncate(options.page_size);

            let mut report = GcReport::default();
            let mut last = None;
            for (key, bytes) in &visited {
                let Some(raw_id) = keys::session_of_info_key(key) else {
                    continue;
                };
                last = Some(raw_id.to_string());
                let Ok(id) = SessionId::parse(raw_id) else {
                    warn!(key = %key, "skipping record with malformed session id");
                    continue;
                };
                report.visited += 1;
                let mut record: SessionRecord = bincode::deserialize(bytes)?;
                let keys = SessionKeys::new(&id)?;
                match judge(&record, now, options) {
                    Verdict::Keep => {}
                    Verdict::Expire => {
                        purge_session(t, &keys, &record)?;
                        report.expired += 1;
                    }
                    Verdict::ReclaimOnload => {
                        purge_session(t, &keys, &record)?;
                        report.onloads_reclaimed += 1;
                    }
                    Verdict::PruneOffloaded => {
                        purge_session(t, &keys, &record)?;
                        report.offloaded_pruned += 1;
                    }
                    Verdict::RollBackOffload => {
                        record.set_state(SessionState::Active, now);
                        record.offloading_reads = 0;
                        commit_record(t, &keys, &record, true)?;
                        report.offloads_rolled_back += 1;
                    }
                }
            }
            Ok(GcPage {
                report,
                cursor: if more { last } else { None },
            })
        })?;

        if page.report.collected() + page.report.offloads_rolled_back > 0 {
            info!(
                visited = page.report.visited,
                expired = page.report.expired,
                rolled_back = page.report.offloads_rolled_back,
                reclaimed = page.report.onloads_reclaimed,
                pruned = page.report.offloaded_pruned,
                "gc page applied"
            );
        } else {
            debug!(visited = page.report.visited, done = page.cursor.is_none(), "gc page clean");
        }
        Ok(page)
    }
}
