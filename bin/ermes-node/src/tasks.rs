//! Named background tasks sharing one shutdown token

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct BackgroundTasks {
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Token the spawned loops should stop on
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Fire the token and wait for every task. Returns the names of the
    /// tasks that panicked or were aborted.
    pub async fn shutdown(self) -> Vec<&'static str> {
        self.shutdown.cancel();
        let mut failed = Vec::new();
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => debug!("{name} task stopped"),
                Err(e) => {
                    warn!("{name} task ended abnormally: {e}");
                    failed.push(name);
                }
            }
        }
        failed
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}
