//! Tunnels over Docker-published ports.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bollard::Docker;
use bollard::container::InspectContainerOptions;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::sandbox::Environment;
use crate::tunnel::{Endpoint, Tunnel, TunnelManager};

/// Per-probe request timeout while waiting for readiness.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reaches environments through the host port Docker published for them.
pub struct DockerTunnelManager {
    docker: Docker,
    config: TunnelConfig,
    probe: reqwest::Client,
}

impl DockerTunnelManager {
    pub fn new(docker: Docker, config: TunnelConfig) -> Result<Self, reqwest::Error> {
        let probe = reqwest::Client::builder()
            .no_proxy()
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Self {
            docker,
            config,
            probe,
        })
    }

    /// Host address Docker bound the environment's exposed port to.
    async fn published_address(&self, env: &Environment) -> Result<SocketAddr, TunnelError> {
        let info = self
            .docker
            .inspect_container(&env.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| TunnelError::Inspect {
                environment: env.name.clone(),
                reason: e.to_string(),
            })?;

        let not_published = || TunnelError::PortNotPublished {
            environment: env.name.clone(),
            port: env.port,
        };

        let binding = info
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&crate::sandbox::docker::port_key(env.port)))
            .flatten()
            .and_then(|bindings| bindings.into_iter().next())
            .ok_or_else(not_published)?;

        let port = binding
            .host_port
            .as_deref()
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .ok_or_else(not_published)?;

        Ok(SocketAddr::new(
            reachable_ip(binding.host_ip.as_deref()),
            port,
        ))
    }

    /// Poll until the dispatch binary answers HTTP at `address`.
    async fn wait_until_ready(
        &self,
        env: &Environment,
        address: SocketAddr,
    ) -> Result<(), TunnelError> {
        let url = format!("{}/", Endpoint::from_socket_addr(address));
        let deadline = Instant::now() + self.config.ready_timeout;

        loop {
            match self.probe.get(&url).send().await {
                Ok(response) => {
                    tracing::debug!(
                        container = %env.name,
                        status = %response.status(),
                        "webhook environment is answering"
                    );
                    return Ok(());
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(TunnelError::Unreachable {
                            environment: env.name.clone(),
                            address: address.to_string(),
                            timeout: self.config.ready_timeout,
                        });
                    }
                    tracing::trace!(container = %env.name, error = %e, "environment not ready yet");
                    tokio::time::sleep(self.config.probe_interval).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl TunnelManager for DockerTunnelManager {
    async fn open(&self, env: &Environment) -> Result<Tunnel, TunnelError> {
        let upstream = self.published_address(env).await?;
        self.wait_until_ready(env, upstream).await?;

        let (local, forwarder) =
            spawn_forwarder(SocketAddr::new(self.config.bind_host, 0), upstream).await?;
        let endpoint = Endpoint::from_socket_addr(local);

        tracing::info!(
            container = %env.name,
            endpoint = %endpoint,
            upstream = %upstream,
            "Opened tunnel"
        );

        Ok(Tunnel::with_forwarder(env.name.clone(), endpoint, forwarder))
    }

    async fn close(&self, tunnel: &Tunnel) {
        if tunnel.shutdown() {
            tracing::info!(container = %tunnel.environment(), endpoint = %tunnel.endpoint(), "Closed tunnel");
        } else {
            tracing::debug!(container = %tunnel.environment(), "tunnel already closed");
        }
    }
}

/// Wildcard bindings are reached through loopback.
fn reachable_ip(host_ip: Option<&str>) -> IpAddr {
    match host_ip.and_then(|ip| ip.parse::<IpAddr>().ok()) {
        Some(IpAddr::V4(ip)) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Some(IpAddr::V6(ip)) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        Some(ip) => ip,
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// Listen on `bind` and pipe every accepted connection to `upstream`.
///
/// Returns the bound address and the accept-loop task. Aborting the task
/// closes the listener and every connection it is carrying.
pub async fn spawn_forwarder(
    bind: SocketAddr,
    upstream: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<()>), TunnelError> {
    let listener = TcpListener::bind(bind).await.map_err(TunnelError::Bind)?;
    let local = listener.local_addr().map_err(TunnelError::Bind)?;

    let handle = tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((inbound, peer)) => {
                        connections.spawn(pipe(inbound, peer, upstream));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "tunnel accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    });

    Ok((local, handle))
}

async fn pipe(mut inbound: TcpStream, peer: SocketAddr, upstream: SocketAddr) {
    let mut outbound = match TcpStream::connect(upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(upstream = %upstream, error = %e, "tunnel upstream connect failed");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((sent, received)) => {
            tracing::trace!(peer = %peer, sent, received, "tunnel connection closed");
        }
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
            tracing::trace!(peer = %peer, "tunnel connection reset");
        }
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "tunnel connection error");
        }
    }
}
