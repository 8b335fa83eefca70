//! HTTP listener for the relay.
//!
//! Serves one prepared router. Connection info is attached to every request
//! so the relay can fill in `x-forwarded-for`.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::StartupError;

/// The relay's HTTP server.
pub struct RelayServer {
    addr: SocketAddr,
    router: Option<Router>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self {
            addr,
            router: Some(router),
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Bind the listener and spawn the server.
    ///
    /// The server drains and exits when `cancelled` resolves or
    /// [`shutdown`](Self::shutdown) is called, whichever comes first.
    pub async fn start<F>(&mut self, cancelled: F) -> Result<SocketAddr, StartupError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_error = |reason: String| StartupError::Bind {
            addr: self.addr.to_string(),
            reason,
        };

        let router = self
            .router
            .take()
            .ok_or_else(|| bind_error("server already started".to_string()))?;

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| bind_error(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| bind_error(e.to_string()))?;

        tracing::info!(addr = %local_addr, "Relay listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        let handle = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(async {
                    tokio::select! {
                        _ = shutdown_rx => {}
                        _ = cancelled => {}
                    }
                    tracing::info!("Relay server shutting down");
                })
                .await
            {
                tracing::error!(error = %e, "Relay server error");
            }
        });

        self.handle = Some(handle);
        Ok(local_addr)
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Wait for the server task to exit on its own.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.shutdown_tx = None;
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.wait().await;
    }
}
