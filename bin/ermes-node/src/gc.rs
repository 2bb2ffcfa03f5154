//! Garbage collection sweeper
//!
//! Drives the store's GC pages to completion. The cursor of the last page
//! that committed is kept between sweeps, so a failing page is retried
//! from where the sweep stopped rather than from the start.

use crate::service::NodeService;
use ermes_common::{GarbageCollectSessionsOptions, Result, now_millis};
use ermes_store::GcReport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct GarbageCollector {
    service: Arc<NodeService>,
    options: GarbageCollectSessionsOptions,
    cursor: Mutex<Option<String>>,
}

impl GarbageCollector {
    pub fn new(service: Arc<NodeService>, options: GarbageCollectSessionsOptions) -> Self {
        Self {
            service,
            options,
            cursor: Mutex::new(None),
        }
    }

    /// Resume from a cursor saved by an earlier sweeper.
    #[must_use]
    pub fn with_cursor(self, cursor: Option<String>) -> Self {
        *self.cursor.lock() = cursor;
        self
    }

    /// Cursor a new sweep would resume from; `None` means from the start.
    pub fn cursor(&self) -> Option<String> {
        self.cursor.lock().clone()
    }

    /// Run GC pages until the sweep completes.
    ///
    /// A page error stops the sweep and keeps the cursor of the last good
    /// page. Every page of one sweep judges expiry at the same instant.
    pub fn sweep(&self) -> Result<GcReport> {
        let options = GarbageCollectSessionsOptions {
            now: Some(self.options.now.unwrap_or_else(now_millis)),
            ..self.options
        };
        let mut total = GcReport::default();
        loop {
            let cursor = self.cursor();
            let page = self
                .service
                .garbage_collect_sessions(&options, cursor.as_deref())?;
            total.merge(&page.report);
            let done = page.cursor.is_none();
            *self.cursor.lock() = page.cursor;
            if done {
                break;
            }
        }
        debug!(visited = total.visited, collected = total.collected(), "gc sweep complete");
        Ok(total)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("GC sweeper started (page size {})", self.options.page_size);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.sweep() {
                Ok(report) => {
                    metrics::counter!("ermes_gc_collected_total")
                        .increment(report.collected() as u64);
                    metrics::counter!("ermes_gc_rolled_back_total")
                        .increment(report.offloads_rolled_back as u64);
                }
                Err(e) => {
                    metrics::counter!("ermes_gc_failures_total").increment(1);
                    warn!(
                        "GC sweep interrupted at {:?}, resuming next tick: {e}",
                        self.cursor()
                    );
                }
            }
        }
        info!("GC sweeper stopped");
    }
}
