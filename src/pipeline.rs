//! Environment + tunnel provisioning shared by both relay modes.
//!
//! [`Pipeline::launch`] is the only place an environment is started and made
//! reachable. The resulting [`Session`] owns both halves and tears them down
//! exactly once: tunnel first, then the environment. Teardowns that start
//! from a drop run on the pipeline's [`TaskTracker`], so the process can wait
//! for them before it exits.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::body::{Body, BodyDataStream, Bytes};
use axum::http::Response;
use chrono::Utc;
use futures::Stream;
use tokio_util::task::TaskTracker;

use crate::error::{ProvisionError, RequestError};
use crate::sandbox::{Environment, EnvironmentTemplate, InstanceSpec, Payload, Provisioner, Template};
use crate::tunnel::{Endpoint, Tunnel, TunnelManager};

/// Builds sessions from one prebuilt template.
#[derive(Clone)]
pub struct Pipeline {
    provisioner: Arc<dyn Provisioner>,
    tunnels: Arc<dyn TunnelManager>,
    template: Arc<Template>,
    teardowns: TaskTracker,
}

impl Pipeline {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        tunnels: Arc<dyn TunnelManager>,
        template: Template,
    ) -> Self {
        Self {
            provisioner,
            tunnels,
            template: Arc::new(template),
            teardowns: TaskTracker::new(),
        }
    }

    /// Track deferred teardowns on `teardowns` instead of a private tracker.
    pub fn with_teardowns(mut self, teardowns: TaskTracker) -> Self {
        self.teardowns = teardowns;
        self
    }

    /// Tracker that owns every teardown spawned by a dropped session.
    pub fn teardowns(&self) -> &TaskTracker {
        &self.teardowns
    }

    /// Build the template for `recipe`, then wrap it in a pipeline.
    pub async fn build(
        provisioner: Arc<dyn Provisioner>,
        tunnels: Arc<dyn TunnelManager>,
        recipe: &EnvironmentTemplate,
    ) -> Result<Self, ProvisionError> {
        let template = provisioner.build_template(recipe).await?;
        tracing::info!(image = %template.image(), "Webhook environment template ready");
        Ok(Self::new(provisioner, tunnels, template))
    }

    /// Instance parameters for this template's dispatch port.
    pub fn instance(&self, payload: Payload, workdir: impl Into<String>) -> InstanceSpec {
        InstanceSpec {
            payload: Some(payload),
            workdir: Some(workdir.into()),
            port: self.template.recipe().exposed_port,
        }
    }

    /// Start an environment and open a tunnel to it.
    ///
    /// If the tunnel cannot be opened the environment is stopped before the
    /// error is returned.
    pub async fn launch(&self, spec: InstanceSpec) -> Result<Session, RequestError> {
        let environment = self.provisioner.instantiate(&self.template, spec).await?;

        let tunnel = match self.tunnels.open(&environment).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                tracing::warn!(container = %environment.name, error = %e, "Tunnel failed, stopping environment");
                self.provisioner.stop(&environment).await;
                return Err(e.into());
            }
        };

        Ok(Session {
            endpoint: tunnel.endpoint().clone(),
            provisioner: Arc::clone(&self.provisioner),
            tunnels: Arc::clone(&self.tunnels),
            teardowns: self.teardowns.clone(),
            active: Mutex::new(Some(Active {
                environment,
                tunnel,
            })),
        })
    }
}

struct Active {
    environment: Environment,
    tunnel: Tunnel,
}

/// A running environment and the tunnel in front of it.
///
/// Call [`Session::close`] to tear down in place. A session dropped while
/// still open spawns its teardown on the pipeline's tracker.
pub struct Session {
    endpoint: Endpoint,
    provisioner: Arc<dyn Provisioner>,
    tunnels: Arc<dyn TunnelManager>,
    teardowns: TaskTracker,
    active: Mutex<Option<Active>>,
}

impl Session {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Name of the environment, while the session is open.
    pub fn environment_name(&self) -> Option<String> {
        self.lock().as_ref().map(|a| a.environment.name.clone())
    }

    /// Close the tunnel, then stop the environment. Later calls do nothing.
    pub async fn close(&self) {
        let active = self.lock().take();
        if let Some(active) = active {
            teardown(Arc::clone(&self.provisioner), Arc::clone(&self.tunnels), active).await;
        }
    }

    /// Keep the session open until `response`'s body has been fully sent or
    /// dropped.
    pub fn attach(self, response: Response<Body>) -> Response<Body> {
        let (parts, body) = response.into_parts();
        let body = Body::from_stream(SessionBody {
            inner: body.into_data_stream(),
            session: Some(self),
        });
        Response::from_parts(parts, body)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Active>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(active) = self.lock().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.teardowns.spawn_on(
                    teardown(
                        Arc::clone(&self.provisioner),
                        Arc::clone(&self.tunnels),
                        active,
                    ),
                    &runtime,
                );
            }
            Err(_) => {
                tracing::warn!(
                    container = %active.environment.name,
                    "Session dropped outside a runtime; environment left running"
                );
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("environment", &self.environment_name())
            .finish_non_exhaustive()
    }
}

async fn teardown(
    provisioner: Arc<dyn Provisioner>,
    tunnels: Arc<dyn TunnelManager>,
    active: Active,
) {
    let Active {
        environment,
        tunnel,
    } = active;
    tunnels.close(&tunnel).await;
    drop(tunnel);
    provisioner.stop(&environment).await;
    let uptime = Utc::now() - environment.created_at;
    tracing::info!(
        container = %environment.name,
        uptime_ms = uptime.num_milliseconds(),
        "Environment torn down"
    );
}

/// Response body that releases its session when the stream ends.
struct SessionBody {
    inner: BodyDataStream,
    session: Option<Session>,
}

impl Stream for SessionBody {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.session.take();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
