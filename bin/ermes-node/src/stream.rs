//! Offload payload streaming
//!
//! The source node reads the first page inline and hands the rest of the
//! payload to a background loader that feeds a bounded channel. Loader
//! failures are sent down the same channel, so the consumer has a single
//! place to look for errors. Both ends watch the cancellation token: the
//! loader stops reading, and the stream reports `Cancelled` instead of
//! handing out further pages. Neither touches the session state, which
//! stays `Offloading` until the offload is confirmed.

use ermes_common::{Error, ResourcesUsage, Result, SessionId, SessionLocation, SessionMetadata};
use ermes_store::{OffloadData, OffloadPage, SessionStore};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything the destination needs besides the payload itself
#[derive(Clone, Debug, PartialEq)]
pub struct SessionHandoff {
    pub session_id: SessionId,
    /// The session at the node it is leaving
    pub origin: SessionLocation,
    pub metadata: SessionMetadata,
    pub resources_usage: ResourcesUsage,
}

/// A started offload: the handoff record, the payload stream and, for
/// payloads larger than one page, the loader producing the other pages.
///
/// The loader must be polled (usually spawned) for the stream to get past
/// its first page.
pub struct OffloadTransfer {
    pub handoff: SessionHandoff,
    pub stream: OffloadStream,
    pub loader: Option<BoxFuture<'static, ()>>,
}

impl OffloadTransfer {
    /// Spawn the loader, if any, on the current runtime.
    pub fn spawn_loader(&mut self) -> Option<tokio::task::JoinHandle<()>> {
        self.loader.take().map(tokio::spawn)
    }
}

/// Pages of an offloading session's payload
pub struct OffloadStream {
    rx: mpsc::Receiver<Result<OffloadPage>>,
    cancel: CancellationToken,
    finished: bool,
}

impl OffloadStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<OffloadPage>>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            finished: false,
        }
    }

    /// Drain the stream into one payload.
    pub async fn collect_data(mut self) -> Result<OffloadData> {
        let mut data = OffloadData::default();
        while let Some(page) = self.next().await {
            data.merge(page?);
        }
        Ok(data)
    }
}

impl Stream for OffloadStream {
    type Item = Result<OffloadData>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.cancel.is_cancelled() {
            this.finished = true;
            return Poll::Ready(Some(Err(Error::Cancelled)));
        }
        let item = match ready!(this.rx.poll_recv(cx)) {
            Some(Ok(page)) => {
                this.finished = page.is_last();
                Ok(page.data)
            }
            Some(Err(e)) => {
                this.finished = true;
                Err(e)
            }
            None => {
                this.finished = true;
                if this.cancel.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    Err(Error::internal("offload loader stopped before the last page"))
                }
            }
        };
        Poll::Ready(Some(item))
    }
}

/// Read the pages after `cursor` into `tx` until the payload is exhausted,
/// the consumer goes away or `cancel` fires.
pub(crate) async fn load_pages(
    store: Arc<SessionStore>,
    id: SessionId,
    mut cursor: String,
    page_size: usize,
    tx: mpsc::Sender<Result<OffloadPage>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            let _ = tx.try_send(Err(Error::Cancelled));
            debug!(session_id = %id, "offload loader cancelled");
            return;
        }
        let page = match store.offload_data(&id, &cursor, page_size) {
            Ok(page) => page,
            Err(e) => {
                warn!(session_id = %id, error = %e, "offload page read failed");
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        metrics::counter!("ermes_offload_pages_total").increment(1);
        let last = page.is_last();
        cursor.clone_from(&page.cursor);

        tokio::select! {
            () = cancel.cancelled() => {
                let _ = tx.try_send(Err(Error::Cancelled));
                debug!(session_id = %id, "offload loader cancelled");
                return;
            }
            sent = tx.send(Ok(page)) => {
                if sent.is_err() {
                    debug!(session_id = %id, "offload stream dropped by consumer");
                    return;
                }
            }
        }
        if last {
            return;
        }
    }
}
