//! Process shutdown coordination.
//!
//! One [`Lifecycle`] per process, created before anything is provisioned so
//! signals are handled from the start. The static mode registers its session
//! teardown here; the signal watcher and `main` both call
//! [`Lifecycle::shutdown`], which runs the registered teardown at most once
//! and then tells the server to stop accepting connections. Per-request
//! teardowns run on the shared tracker and are awaited by
//! [`Lifecycle::drain`].

use std::future::Future;

use tokio::sync::{Mutex, watch};
use tokio_util::task::TaskTracker;

/// Work to run once when the process shuts down.
#[async_trait::async_trait]
pub trait Teardown: Send + Sync {
    async fn teardown(&self);
}

#[async_trait::async_trait]
impl Teardown for crate::pipeline::Session {
    async fn teardown(&self) {
        self.close().await;
    }
}

pub struct Lifecycle {
    teardown: Mutex<Option<Box<dyn Teardown>>>,
    cancel: watch::Sender<bool>,
    teardowns: TaskTracker,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            teardown: Mutex::new(None),
            cancel,
            teardowns: TaskTracker::new(),
        }
    }

    /// Register the teardown run on shutdown. Replaces any earlier one.
    ///
    /// A teardown registered after shutdown has begun runs on the next call
    /// to [`shutdown`](Self::shutdown).
    pub async fn register(&self, teardown: Box<dyn Teardown>) {
        *self.teardown.lock().await = Some(teardown);
    }

    /// Run the registered teardown (each registration at most once), then
    /// cancel.
    ///
    /// Concurrent callers wait for the first one to finish.
    pub async fn shutdown(&self) {
        let mut slot = self.teardown.lock().await;
        match slot.take() {
            Some(teardown) => {
                tracing::info!("Releasing webhook environment");
                teardown.teardown().await;
            }
            None => tracing::debug!("No teardown registered"),
        }
        drop(slot);
        self.cancel.send_replace(true);
    }

    /// Tracker for teardowns that outlive the request that started them.
    pub fn teardowns(&self) -> TaskTracker {
        self.teardowns.clone()
    }

    /// Wait for every tracked teardown to finish.
    pub async fn drain(&self) {
        self.teardowns.close();
        if !self.teardowns.is_empty() {
            tracing::info!(pending = self.teardowns.len(), "Waiting for environment teardowns");
        }
        self.teardowns.wait().await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has completed.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut rx = self.cancel.subscribe();
        async move {
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        }
    }

    /// Wait for SIGINT/SIGTERM. The first signal triggers shutdown; later
    /// ones are logged and otherwise ignored.
    pub async fn watch_signals(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let mut received = 0usize;
        loop {
            #[cfg(unix)]
            let name = tokio::select! {
                result = tokio::signal::ctrl_c() => { result?; "SIGINT" }
                _ = terminate.recv() => "SIGTERM",
            };
            #[cfg(not(unix))]
            let name = {
                tokio::signal::ctrl_c().await?;
                "SIGINT"
            };

            received += 1;
            if received == 1 {
                tracing::info!(signal = name, "Shutdown signal received");
                self.shutdown().await;
            } else {
                tracing::info!(signal = name, "Shutdown already in progress, ignoring signal");
            }
        }
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("cancelled", &self.is_cancelled())
            .field("pending_teardowns", &self.teardowns.len())
            .finish_non_exhaustive()
    }
}
