//! Relay modes and their request handlers.
//!
//! The mode is fixed at startup:
//!
//! - **Static**: a hooks file is injected into one long-lived environment
//!   before the listener starts. Every request is relayed to its tunnel.
//! - **Clone-and-proxy**: every request is a push notification. The pushed
//!   commit gets its own environment, which lives only as long as the relayed
//!   response.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::error::{RequestError, StartupError};
use crate::lifecycle::Lifecycle;
use crate::pipeline::Pipeline;
use crate::relay::Relay;
use crate::sandbox::{EnvironmentTemplate, Payload, Provisioner};
use crate::source::SourceResolver;
use crate::tunnel::{Endpoint, TunnelManager};
use crate::webhook::{BufferedRequest, PushNotification};

/// Where the hooks file lands in a static environment.
pub const STATIC_HOOKS_PATH: &str = "/hooks/hooks.json";
/// Working directory of a static environment.
pub const STATIC_WORKDIR: &str = "/hooks";

/// Operating mode, chosen once per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Static { hooks_path: PathBuf, contents: Vec<u8> },
    CloneAndProxy,
}

impl Mode {
    /// Static mode if a hooks path is given, clone-and-proxy otherwise.
    ///
    /// The hooks file must be readable and non-empty.
    pub fn from_hooks_path(hooks_path: Option<&Path>) -> Result<Self, StartupError> {
        let Some(path) = hooks_path else {
            return Ok(Self::CloneAndProxy);
        };

        let contents = std::fs::read(path).map_err(|e| StartupError::HooksUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if contents.is_empty() {
            return Err(StartupError::HooksEmpty {
                path: path.to_path_buf(),
            });
        }

        Ok(Self::Static {
            hooks_path: path.to_path_buf(),
            contents,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Static { .. } => "static",
            Self::CloneAndProxy => "clone-and-proxy",
        }
    }
}

/// Backends a mode runs on.
#[derive(Clone)]
pub struct Components {
    pub provisioner: Arc<dyn Provisioner>,
    pub tunnels: Arc<dyn TunnelManager>,
    pub resolver: Arc<dyn SourceResolver>,
    pub relay: Relay,
}

/// A mode ready to serve.
pub struct Prepared {
    pub router: Router,
    pub lifecycle: Arc<Lifecycle>,
}

/// Build the template and, in static mode, the long-lived environment.
///
/// `lifecycle` is the process lifecycle. If it is shut down while the static
/// environment is starting, the environment is released and
/// [`StartupError::Interrupted`] is returned.
pub async fn prepare(
    mode: Mode,
    components: Components,
    config: &RelayConfig,
    lifecycle: Arc<Lifecycle>,
) -> Result<Prepared, StartupError> {
    let recipe = EnvironmentTemplate::webhook(&config.template);
    let pipeline = Pipeline::build(
        Arc::clone(&components.provisioner),
        Arc::clone(&components.tunnels),
        &recipe,
    )
    .await
    .map_err(StartupError::Template)?
    .with_teardowns(lifecycle.teardowns());

    if lifecycle.is_cancelled() {
        return Err(StartupError::Interrupted);
    }

    let router = match mode {
        Mode::Static {
            hooks_path,
            contents,
        } => {
            let spec = pipeline.instance(
                Payload::File {
                    path: STATIC_HOOKS_PATH.to_string(),
                    contents,
                },
                STATIC_WORKDIR,
            );
            let session = pipeline
                .launch(spec)
                .await
                .map_err(StartupError::StaticEnvironment)?;
            let endpoint = session.endpoint().clone();

            tracing::info!(
                hooks = %hooks_path.display(),
                endpoint = %endpoint,
                "Static webhook environment running"
            );
            lifecycle.register(Box::new(session)).await;
            if lifecycle.is_cancelled() {
                lifecycle.shutdown().await;
                return Err(StartupError::Interrupted);
            }

            Router::new().fallback(handle_static).with_state(StaticState {
                relay: components.relay,
                endpoint: Arc::new(endpoint),
            })
        }
        Mode::CloneAndProxy => {
            tracing::info!("Relaying push notifications to per-commit environments");
            Router::new().fallback(handle_push).with_state(CloneState {
                pipeline,
                resolver: components.resolver,
                relay: components.relay,
                max_body_bytes: config.max_body_bytes,
            })
        }
    };

    Ok(Prepared {
        router: router.layer(TraceLayer::new_for_http()),
        lifecycle,
    })
}

#[derive(Clone)]
struct StaticState {
    relay: Relay,
    endpoint: Arc<Endpoint>,
}

async fn handle_static(State(state): State<StaticState>, request: Request<Body>) -> Response<Body> {
    match state.relay.forward(request, &state.endpoint).await {
        Ok(response) => response,
        Err(e) => failure(RequestError::from(e)),
    }
}

#[derive(Clone)]
struct CloneState {
    pipeline: Pipeline,
    resolver: Arc<dyn SourceResolver>,
    relay: Relay,
    max_body_bytes: usize,
}

async fn handle_push(State(state): State<CloneState>, request: Request<Body>) -> Response<Body> {
    match relay_push(&state, request).await {
        Ok(response) => response,
        Err(e) => failure(e),
    }
}

async fn relay_push(
    state: &CloneState,
    request: Request<Body>,
) -> Result<Response<Body>, RequestError> {
    let buffered = BufferedRequest::from_request(request, state.max_body_bytes).await?;
    let push = PushNotification::parse(buffered.body())?;
    tracing::info!(repository = push.full_name(), commit = push.commit(), "Received push");

    let tree = state.resolver.resolve(push.full_name(), push.commit()).await?;

    let mount = format!("/{}", push.repo_name());
    let spec = state.pipeline.instance(
        Payload::Directory {
            mount: mount.clone(),
            source: tree.path().to_path_buf(),
        },
        mount,
    );
    let session = state.pipeline.launch(spec).await?;
    drop(tree);

    match state
        .relay
        .forward(buffered.into_request(), session.endpoint())
        .await
    {
        Ok(response) => Ok(session.attach(response)),
        Err(e) => {
            session.close().await;
            Err(e.into())
        }
    }
}

fn failure(err: RequestError) -> Response<Body> {
    tracing::error!(stage = err.stage(), error = %err, "Request failed");
    err.into_response()
}
