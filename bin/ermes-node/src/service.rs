//! Node service: the command surface of one Ermes node

use crate::selector::{self, TargetCandidate};
use crate::stream::{OffloadStream, OffloadTransfer, SessionHandoff, load_pages};
use async_trait::async_trait;
use ermes_common::{
    AcquireSessionOptions, BestOffloadTargetsOptions, Config, CreateSessionOptions, Error,
    GarbageCollectSessionsOptions, NodeId, OffloadSessionOptions, OnloadSessionOptions,
    ResourcesUsage, Result, SessionId, SessionInfoForOffloadDecision, SessionLocation,
    SessionMetadata, SessionMetadataOptions, SessionState, now_millis,
};
use ermes_common::config::OffloadConfig;
use ermes_store::{
    GcPage, NodeUsage, OffloadData, ReleaseOutcome, ResourcesDigest, ResourcesUsageUpdate,
    ScanPage, SessionStore, SessionValue, SubtreeUsage,
};
use ermes_topology::{Infrastructure, Node};
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tells whoever routes requests for a session that it has a new home.
#[async_trait]
pub trait LastVisitedNodeNotifier: Send + Sync {
    /// `origin` is where the session lived before it was onloaded on the
    /// node that is now giving it away, if it came from elsewhere.
    async fn notify_last_visited_node(
        &self,
        origin: Option<&SessionLocation>,
        location: &SessionLocation,
    ) -> Result<()>;
}

/// One node of the tree
#[derive(Debug)]
pub struct NodeService {
    store: Arc<SessionStore>,
    node_id: NodeId,
    offload: OffloadConfig,
    selector: BestOffloadTargetsOptions,
    /// Sessions whose blocked offload was released, oldest first
    unblocked: Mutex<VecDeque<SessionId>>,
}

impl NodeService {
    /// Bind `store` to `node_id` and wrap it.
    pub fn new(store: SessionStore, node_id: impl Into<NodeId>, config: &Config) -> Result<Self> {
        let node_id = node_id.into();
        store.set_current_node(&node_id)?;
        Ok(Self {
            store: Arc::new(store),
            node_id,
            offload: config.offload.clone(),
            selector: config.selector.options(),
            unblocked: Mutex::new(VecDeque::new()),
        })
    }

    /// Open the on-disk store named by the configuration.
    pub fn open(config: &Config) -> Result<Self> {
        let path = config.node.database_path();
        let store = SessionStore::open(&path).map_err(Error::from)?;
        info!("Session store opened at {}", path.display());
        Self::new(store, config.node.id.clone(), config)
    }

    /// A node whose store lives in memory.
    pub fn in_memory(node_id: impl Into<NodeId>, config: &Config) -> Result<Self> {
        Self::new(SessionStore::open_in_memory().map_err(Error::from)?, node_id, config)
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn offload_config(&self) -> &OffloadConfig {
        &self.offload
    }

    /// Selector options used when a caller passes none
    #[must_use]
    pub fn selector_options(&self) -> &BestOffloadTargetsOptions {
        &self.selector
    }

    /// Location of a session held by this node
    fn here(&self, id: &SessionId) -> SessionLocation {
        SessionLocation::new(self.node_id.clone(), id.as_str())
    }

    // ---- Session lifecycle ----

    pub fn create_session(&self, options: &CreateSessionOptions) -> Result<SessionId> {
        self.store.create_session(options)
    }

    pub fn create_and_acquire_session(
        &self,
        options: &CreateSessionOptions,
        acquire: AcquireSessionOptions,
    ) -> Result<SessionId> {
        self.store.create_and_acquire_session(options, acquire)
    }

    /// `None` when the session is granted here, otherwise where to go.
    pub fn acquire_session(
        &self,
        id: &SessionId,
        options: AcquireSessionOptions,
    ) -> Result<Option<SessionLocation>> {
        self.store.acquire_session(id, options)
    }

    /// Release a hold. A release that unblocks a waiting offload queues the
    /// session, see [`Self::take_unblocked_offloads`].
    pub fn release_session(
        &self,
        id: &SessionId,
        options: AcquireSessionOptions,
    ) -> Result<ReleaseOutcome> {
        let outcome = self.store.release_session(id, options)?;
        if outcome.offload_unblocked {
            debug!(session_id = %id, "offload unblocked by release");
            self.unblocked.lock().push_back(id.clone());
        }
        Ok(outcome)
    }

    /// Sessions whose offload was waiting on a release, oldest first.
    pub fn take_unblocked_offloads(&self) -> Vec<SessionId> {
        self.unblocked.lock().drain(..).collect()
    }

    pub fn get_session_metadata(&self, id: &SessionId) -> Result<SessionMetadata> {
        self.store.get_session_metadata(id)
    }

    pub fn set_session_metadata(
        &self,
        id: &SessionId,
        options: &SessionMetadataOptions,
    ) -> Result<SessionMetadata> {
        self.store.set_session_metadata(id, options)
    }

    pub fn set_session_value(&self, id: &SessionId, name: &str, value: SessionValue) -> Result<()> {
        self.store.set_session_value(id, name, value)
    }

    pub fn get_session_value(&self, id: &SessionId, name: &str) -> Result<Option<SessionValue>> {
        self.store.get_session_value(id, name)
    }

    pub fn get_session_data(&self, id: &SessionId) -> Result<OffloadData> {
        self.store.get_session_data(id)
    }

    pub fn scan_sessions(&self, cursor: &str, count: usize) -> Result<ScanPage> {
        self.store.scan_sessions(cursor, count)
    }

    pub fn scan_offloadable_sessions(&self, cursor: &str, count: usize) -> Result<ScanPage> {
        self.store.scan_offloadable_sessions(cursor, count)
    }

    pub fn scan_offloaded_sessions(&self, cursor: &str, count: usize) -> Result<ScanPage> {
        self.store.scan_offloaded_sessions(cursor, count)
    }

    // ---- Offload / onload ----

    /// Start offloading a session and open its payload stream.
    ///
    /// Dropping the stream or firing `cancel` leaves the session
    /// `Offloading`; [`Self::resume_offload`] reopens the stream later.
    pub fn offload_session(
        &self,
        id: &SessionId,
        options: OffloadSessionOptions,
        cancel: CancellationToken,
    ) -> Result<OffloadTransfer> {
        self.store.offload_start(id, &options)?;
        self.open_transfer(id, options, cancel)
    }

    /// Reopen the payload stream of a session already `Offloading`.
    pub fn resume_offload(
        &self,
        id: &SessionId,
        options: OffloadSessionOptions,
        cancel: CancellationToken,
    ) -> Result<OffloadTransfer> {
        let record = self
            .store
            .get_session_record(id)?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        if record.state != SessionState::Offloading {
            return Err(Error::invalid_argument(format!(
                "session {id} is {}, not offloading",
                record.state
            )));
        }
        self.open_transfer(id, options, cancel)
    }

    fn open_transfer(
        &self,
        id: &SessionId,
        options: OffloadSessionOptions,
        cancel: CancellationToken,
    ) -> Result<OffloadTransfer> {
        let handoff = SessionHandoff {
            session_id: id.clone(),
            origin: self.here(id),
            metadata: self.store.get_session_metadata(id)?,
            resources_usage: self.store.get_session_resources_usage(id)?,
        };
        let page_size = options.page_size.unwrap_or(self.offload.page_size).max(1);
        let first = self.store.offload_data(id, "", page_size)?;
        metrics::counter!("ermes_offload_pages_total").increment(1);

        let (tx, rx) = mpsc::channel(self.offload.channel_capacity.max(1));
        let cursor = first.cursor.clone();
        let last = first.is_last();
        tx.try_send(Ok(first))
            .map_err(|_| Error::internal("offload channel refused the first page"))?;
        let loader = (!last).then(|| {
            load_pages(self.store.clone(), id.clone(), cursor, page_size, tx, cancel.clone())
                .boxed()
        });
        debug!(session_id = %id, page_size, streamed = !last, "offload stream opened");
        Ok(OffloadTransfer {
            handoff,
            stream: OffloadStream::new(rx, cancel),
            loader,
        })
    }

    /// Rebuild a session from a handoff and its payload stream.
    ///
    /// Any stream or store error aborts the handshake, so a failed onload
    /// leaves nothing behind. Returns the id the session lives under here.
    pub async fn onload_session<S>(
        &self,
        handoff: &SessionHandoff,
        mut stream: S,
        options: OnloadSessionOptions,
    ) -> Result<SessionId>
    where
        S: Stream<Item = Result<OffloadData>> + Unpin + Send,
    {
        let id = if options.assign_new_id {
            SessionId::generate()
        } else {
            handoff.session_id.clone()
        };
        self.store
            .onload_start(&id, &handoff.metadata, Some(&handoff.origin))?;

        let mut pages = 0usize;
        while let Some(item) = stream.next().await {
            if let Err(e) = item.and_then(|data| self.store.onload_data(&id, &data)) {
                self.abandon_onload(&id);
                return Err(e);
            }
            pages += 1;
        }
        let finished = self
            .store
            .update_session_resources_usage(&id, &handoff.resources_usage)
            .and_then(|()| self.store.onload_finish(&id));
        if let Err(e) = finished {
            self.abandon_onload(&id);
            return Err(e);
        }
        info!(
            session_id = %id,
            origin = %handoff.origin,
            pages,
            "session received"
        );
        Ok(id)
    }

    fn abandon_onload(&self, id: &SessionId) {
        if let Err(e) = self.store.onload_abort(id) {
            warn!(session_id = %id, error = %e, "failed to abort onload");
        }
    }

    /// Commit an offload and tell the previous router about it.
    ///
    /// Repeating the call on an offload already confirmed changes nothing
    /// locally and returns `false`, but still runs the notifier.
    pub async fn confirm_session_offload(
        &self,
        id: &SessionId,
        location: &SessionLocation,
        notifier: Option<&dyn LastVisitedNodeNotifier>,
    ) -> Result<bool> {
        let applied = self.store.offload_finish(id, location)?;
        if let Some(notifier) = notifier {
            let origin = self.store.session_origin(id)?;
            notifier
                .notify_last_visited_node(origin.as_ref(), location)
                .await?;
        }
        Ok(applied)
    }

    /// Receiving end of the notifier: a session that left this node has
    /// moved on again.
    pub fn update_offloaded_session_location(
        &self,
        id: &SessionId,
        location: &SessionLocation,
    ) -> Result<bool> {
        self.store.update_offloaded_session_location(id, location)
    }

    /// Move a session to `target` in one go: offload, stream, onload,
    /// confirm. Returns the new location.
    pub async fn move_session_to(
        &self,
        target: &NodeService,
        id: &SessionId,
        options: OffloadSessionOptions,
        notifier: Option<&dyn LastVisitedNodeNotifier>,
    ) -> Result<SessionLocation> {
        let cancel = CancellationToken::new();
        let mut transfer = self.offload_session(id, options, cancel.clone())?;
        let loader = transfer.spawn_loader();

        let onloaded = target
            .onload_session(
                &transfer.handoff,
                &mut transfer.stream,
                OnloadSessionOptions::default(),
            )
            .await;
        if let Some(loader) = loader {
            cancel.cancel();
            if let Err(e) = loader.await {
                warn!(session_id = %id, error = %e, "offload loader task failed");
            }
        }
        let new_id = onloaded?;

        let location = target.here(&new_id);
        self.confirm_session_offload(id, &location, notifier).await?;
        Ok(location)
    }

    // ---- Topology ----

    pub fn load_infrastructure(&self, infrastructure: &Infrastructure) -> Result<usize> {
        self.store.load_infrastructure(infrastructure)
    }

    pub fn get_parent_node(&self) -> Result<Option<Node>> {
        self.store.get_parent_node_of(&self.node_id)
    }

    pub fn get_children_nodes(&self) -> Result<Vec<Node>> {
        self.store.get_children_nodes_of(&self.node_id)
    }

    pub fn find_lookup_node(&self, session_ids: &[SessionId]) -> Result<Option<Node>> {
        self.store.find_lookup_node(session_ids)
    }

    // ---- Resource usage ----

    pub fn get_session_resources_usage(&self, id: &SessionId) -> Result<ResourcesUsage> {
        self.store.get_session_resources_usage(id)
    }

    pub fn update_session_resources_usage(
        &self,
        id: &SessionId,
        usage: &ResourcesUsage,
    ) -> Result<()> {
        self.store.update_session_resources_usage(id, usage)
    }

    pub fn get_node_resources_usage(&self, node_id: &str) -> Result<NodeUsage> {
        self.store.get_node_resources_usage(node_id)
    }

    pub fn resources_usage_update_to_parent(&self) -> Result<ResourcesUsageUpdate> {
        self.store.resources_usage_update_to_parent()
    }

    /// Parent side of one aggregation round: merge the child's figures and
    /// answer with everything known here.
    pub fn receive_child_update(&self, update: &ResourcesUsageUpdate) -> Result<ResourcesDigest> {
        self.store.resources_usage_update_from_child(update)?;
        self.store.resources_digest()
    }

    pub fn apply_resources_digest(&self, digest: &ResourcesDigest) -> Result<usize> {
        self.store.apply_resources_digest(digest)
    }

    pub fn subtree_usage(&self, node_id: &str) -> Result<SubtreeUsage> {
        self.store.subtree_usage(node_id)
    }

    // ---- Offload decisions ----

    /// Usage of this node over its own declared capacity, 0 when the node
    /// declares none or is missing from the topology.
    pub fn local_load_ratio(&self) -> Result<f64> {
        let capacity = match self.store.get_node(&self.node_id) {
            Ok(node) => node.capacity,
            Err(e) if e.is_not_found() => return Ok(0.0),
            Err(e) => return Err(e),
        };
        let figure = self.store.get_node_resources_usage(&self.node_id)?;
        Ok(figure.usage.load_ratio(&capacity))
    }

    /// Local sessions worth offloading, best candidate first.
    pub fn best_sessions_to_offload(
        &self,
        options: Option<&BestOffloadTargetsOptions>,
    ) -> Result<Vec<SessionInfoForOffloadDecision>> {
        let options = options.unwrap_or(&self.selector);
        let now = now_millis();
        let mut candidates = Vec::new();
        let mut cursor = String::new();
        loop {
            let page = self.store.scan_offloadable_sessions(&cursor, 128)?;
            for id in &page.session_ids {
                match self.store.session_offload_info(id, now) {
                    Ok(info) => candidates.push(info),
                    // Raced with an offload or GC since the scan
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            if page.cursor.is_empty() {
                break;
            }
            cursor = page.cursor;
        }
        let here = match self.store.get_node(&self.node_id) {
            Ok(node) => node.geo_coordinates,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        Ok(selector::rank_sessions(candidates, here, options))
    }

    /// (session, node) pairs in priority order. Pairs repeat when several
    /// criteria agree.
    pub fn best_offload_target_nodes(
        &self,
        sessions: &[SessionInfoForOffloadDecision],
        options: Option<&BestOffloadTargetsOptions>,
    ) -> Result<Vec<(SessionId, NodeId)>> {
        let options = options.unwrap_or(&self.selector);
        let topology = self.store.topology_around(&self.node_id)?;

        let mut ids: Vec<NodeId> = Vec::new();
        if let Some(parent) = topology.parent_of(&self.node_id) {
            ids.push(parent.id.clone());
            ids.extend(
                topology
                    .children_of(&parent.id)
                    .into_iter()
                    .filter(|sibling| sibling.id != self.node_id)
                    .map(|sibling| sibling.id.clone()),
            );
        }
        ids.extend(
            topology
                .children_of(&self.node_id)
                .into_iter()
                .map(|child| child.id.clone()),
        );

        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            let usage = self.store.subtree_usage(&id)?;
            candidates.push(TargetCandidate {
                load: usage.load_ratio(),
                node: usage.node,
            });
        }
        Ok(selector::rank_targets(sessions, &candidates, options))
    }

    // ---- Garbage collection ----

    pub fn garbage_collect_sessions(
        &self,
        options: &GarbageCollectSessionsOptions,
        cursor: Option<&str>,
    ) -> Result<GcPage> {
        self.store.garbage_collect_sessions(options, cursor)
    }
}
