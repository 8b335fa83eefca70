//! Error types for hookrelay.

use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors that abort the process before the listener accepts connections.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to read hooks file {}: {reason}", path.display())]
    HooksUnreadable { path: PathBuf, reason: String },

    #[error("Hooks file {} is empty", path.display())]
    HooksEmpty { path: PathBuf },

    #[error("Failed to build webhook environment: {0}")]
    Template(#[source] ProvisionError),

    #[error("Failed to start static webhook environment: {0}")]
    StaticEnvironment(#[source] RequestError),

    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Failed to create HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("Shutdown requested during startup")]
    Interrupted,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// The inbound body is not a usable push notification.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("failed to decode JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("repository name {0:?} has no final path segment")]
    InvalidRepository(String),
}

/// Source tree resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Failed to run git {command}: {reason}")]
    GitUnavailable { command: String, reason: String },

    #[error("git {command} failed for {repository}: {stderr}")]
    Git {
        repository: String,
        command: String,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Environment provisioning errors.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    #[error("Image pull failed for {image}: {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Template build failed: {reason}")]
    TemplateBuild { reason: String },

    #[error("Container creation failed: {reason}")]
    ContainerCreationFailed { reason: String },

    #[error("Payload upload failed: {reason}")]
    PayloadUpload { reason: String },

    #[error("Container start failed: {reason}")]
    ContainerStartFailed { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host reachability errors.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Port {port} of environment {environment} is not published")]
    PortNotPublished { environment: String, port: u16 },

    #[error("Environment {environment} not reachable at {address} after {timeout:?}")]
    Unreachable {
        environment: String,
        address: String,
        timeout: Duration,
    },

    #[error("Failed to inspect environment {environment}: {reason}")]
    Inspect { environment: String, reason: String },

    #[error("Failed to bind tunnel listener: {0}")]
    Bind(#[source] std::io::Error),
}

/// Upstream transport failures while forwarding.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid upstream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Upstream request to {endpoint} failed: {source}")]
    Upstream {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Per-request failure, tagged by the stage that produced it.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl RequestError {
    /// Name of the pipeline stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Resolve(_) => "resolve",
            Self::Provision(_) => "provision",
            Self::Tunnel(_) => "tunnel",
            Self::Relay(_) => "relay",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Relay(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
