//! Host reachability for webhook environments.
//!
//! A [`TunnelManager`] turns a running environment's exposed port into an
//! [`Endpoint`] the relay can send requests to. The Docker implementation
//! resolves the host port the engine published, waits for the dispatch binary
//! to answer, and runs a local TCP forwarder in front of it so that closing
//! the tunnel cuts every connection that goes through it.

mod forward;

pub use forward::{DockerTunnelManager, spawn_forwarder};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use url::Url;

use crate::error::TunnelError;
use crate::sandbox::Environment;

/// Externally reachable address of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Plain HTTP endpoint.
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "http".to_string(),
            host: host.into(),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::http(addr.ip().to_string(), addr.port())
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Upstream URL for a request path (with optional query) on this endpoint.
    pub fn join(&self, path_and_query: &str) -> Result<Url, url::ParseError> {
        let path = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{path_and_query}")
        };
        Url::parse(&format!("{self}{path}"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// A live reachability binding over one environment's exposed port.
///
/// Dropping a tunnel stops its forwarder.
pub struct Tunnel {
    environment: String,
    endpoint: Endpoint,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    /// A tunnel with no host-side forwarder of its own.
    pub fn new(environment: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            environment: environment.into(),
            endpoint,
            forwarder: Mutex::new(None),
        }
    }

    pub(crate) fn with_forwarder(
        environment: impl Into<String>,
        endpoint: Endpoint,
        forwarder: JoinHandle<()>,
    ) -> Self {
        let tunnel = Self::new(environment, endpoint);
        if let Ok(mut guard) = tunnel.forwarder.lock() {
            *guard = Some(forwarder);
        }
        tunnel
    }

    /// Name of the environment this tunnel reaches.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop forwarding. Returns `false` if there was nothing left to stop.
    pub fn shutdown(&self) -> bool {
        let handle = match self.forwarder.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("environment", &self.environment)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens and closes host access to environments.
#[async_trait::async_trait]
pub trait TunnelManager: Send + Sync {
    /// Block until `env` is reachable from the host and return the tunnel.
    async fn open(&self, env: &Environment) -> Result<Tunnel, TunnelError>;

    /// Tear the tunnel down. Best effort and idempotent.
    async fn close(&self, tunnel: &Tunnel);
}
