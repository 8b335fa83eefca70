//! Sandboxed execution environments for the webhook dispatch binary.
//!
//! An environment is a Docker container started from a prebuilt template
//! image. The template installs `adnanh/webhook` once at startup; each
//! environment then gets its own payload (a hooks file or a repository tree),
//! one published port, and the dispatch binary as its long-running process.
//!
//! ```text
//!  EnvironmentTemplate ──build_template──▶ Template (tagged image)
//!                                             │
//!                       InstanceSpec ──instantiate──▶ Environment ──stop──▶ (removed)
//!                   (payload, workdir, port)
//! ```
//!
//! Provisioning goes through the [`Provisioner`] trait so the relay pipeline
//! can run against Docker in production and against in-memory fakes in tests.

pub mod docker;
pub mod template;

use std::path::PathBuf;

use chrono::{DateTime, Utc};

pub use docker::DockerProvisioner;
pub use template::{EnvironmentTemplate, SetupStep, dispatch_args};

use crate::error::ProvisionError;

/// A built, reusable environment template.
#[derive(Debug, Clone)]
pub struct Template {
    recipe: EnvironmentTemplate,
    image: String,
}

impl Template {
    pub fn new(recipe: EnvironmentTemplate, image: impl Into<String>) -> Self {
        Self {
            recipe,
            image: image.into(),
        }
    }

    pub fn recipe(&self) -> &EnvironmentTemplate {
        &self.recipe
    }

    /// Image reference environments are created from.
    pub fn image(&self) -> &str {
        &self.image
    }
}

/// Content injected into an environment before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A single file written at an absolute path.
    File { path: String, contents: Vec<u8> },
    /// A host directory copied to an absolute mount path.
    Directory { mount: String, source: PathBuf },
}

impl Payload {
    /// Container path the payload lands at.
    pub fn target(&self) -> &str {
        match self {
            Self::File { path, .. } => path,
            Self::Directory { mount, .. } => mount,
        }
    }
}

/// Parameters for one environment instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub payload: Option<Payload>,
    pub workdir: Option<String>,
    /// Port the dispatch binary listens on and the container exposes.
    pub port: u16,
}

/// A running environment.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Engine-assigned identifier (the container ID for Docker).
    pub id: String,
    /// Human-readable name, used in logs.
    pub name: String,
    /// Exposed port inside the environment.
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

/// Creates and destroys webhook environments.
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    /// Build (or reuse) the template image described by `recipe`.
    async fn build_template(&self, recipe: &EnvironmentTemplate)
    -> Result<Template, ProvisionError>;

    /// Create and start an environment from `template`.
    ///
    /// Returns once the environment is running; the dispatch binary may not
    /// be accepting connections yet.
    async fn instantiate(
        &self,
        template: &Template,
        spec: InstanceSpec,
    ) -> Result<Environment, ProvisionError>;

    /// Stop and remove an environment. Best effort: failures are logged,
    /// and stopping an already stopped environment is not an error.
    async fn stop(&self, env: &Environment);
}
