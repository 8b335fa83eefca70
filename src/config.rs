//! Configuration for hookrelay.
//!
//! Values come from `HOOKRELAY_*` environment variables (a `.env` file is
//! loaded first by `main`). CLI flags override the listen address and the
//! hooks path after loading.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Port the dispatch binary listens on inside the environment.
pub const DEFAULT_DISPATCH_PORT: u16 = 9000;

/// GitHub caps webhook payloads at 25 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,
    /// Hooks file for static mode. `None` selects clone-and-proxy mode.
    pub hooks_path: Option<PathBuf>,
    pub template: TemplateConfig,
    pub sandbox: SandboxConfig,
    pub tunnel: TunnelConfig,
    pub source: SourceConfig,
    /// Largest webhook body accepted in clone-and-proxy mode.
    pub max_body_bytes: usize,
    /// Emit JSON log lines instead of the compact format.
    pub json_logs: bool,
}

/// How the webhook environment image is put together.
#[derive(Debug, Clone)]
pub struct TemplateConfig {
    pub base_image: String,
    /// Release of `adnanh/webhook` to install.
    pub webhook_version: String,
    pub dispatch_port: u16,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            base_image: "ubuntu:24.04".to_string(),
            webhook_version: "2.8.1".to_string(),
            dispatch_port: DEFAULT_DISPATCH_PORT,
        }
    }
}

/// Docker container settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Host address the container port is published on.
    pub publish_host: IpAddr,
    /// Grace period before Docker kills the dispatch process.
    pub stop_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            publish_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Host-side tunnel settings.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Address the forwarder listens on.
    pub bind_host: IpAddr,
    /// How long to wait for the dispatch binary to answer.
    pub ready_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ready_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_millis(250),
        }
    }
}

/// Where repositories are cloned from.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub clone_base_url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            clone_base_url: "https://github.com/".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            hooks_path: None,
            template: TemplateConfig::default(),
            sandbox: SandboxConfig::default(),
            tunnel: TunnelConfig::default(),
            source: SourceConfig::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            json_logs: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let defaults = Self::default();

        let template = TemplateConfig {
            base_image: vars
                .optional("HOOKRELAY_BASE_IMAGE")
                .unwrap_or(defaults.template.base_image),
            webhook_version: vars
                .optional("HOOKRELAY_WEBHOOK_VERSION")
                .unwrap_or(defaults.template.webhook_version),
            dispatch_port: vars.parse("HOOKRELAY_DISPATCH_PORT", DEFAULT_DISPATCH_PORT)?,
        };
        if template.dispatch_port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HOOKRELAY_DISPATCH_PORT".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }

        let sandbox = SandboxConfig {
            publish_host: vars.parse("HOOKRELAY_PUBLISH_HOST", defaults.sandbox.publish_host)?,
            stop_timeout: Duration::from_secs(vars.parse("HOOKRELAY_STOP_TIMEOUT_SECS", 10u64)?),
        };

        let tunnel = TunnelConfig {
            bind_host: vars.parse("HOOKRELAY_TUNNEL_HOST", defaults.tunnel.bind_host)?,
            ready_timeout: Duration::from_secs(
                vars.parse("HOOKRELAY_TUNNEL_READY_TIMEOUT_SECS", 60u64)?,
            ),
            probe_interval: Duration::from_millis(
                vars.parse("HOOKRELAY_TUNNEL_PROBE_INTERVAL_MS", 250u64)?,
            ),
        };

        let mut clone_base_url = vars
            .optional("HOOKRELAY_CLONE_BASE_URL")
            .unwrap_or(defaults.source.clone_base_url);
        if !clone_base_url.ends_with('/') {
            clone_base_url.push('/');
        }

        let json_logs = match vars.optional("HOOKRELAY_LOG_FORMAT").as_deref() {
            None | Some("text") | Some("compact") => false,
            Some("json") => true,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "HOOKRELAY_LOG_FORMAT".to_string(),
                    message: format!("expected \"text\" or \"json\", got {other:?}"),
                });
            }
        };

        Ok(Self {
            listen_addr: vars.parse("HOOKRELAY_LISTEN", defaults.listen_addr)?,
            hooks_path: vars.optional("HOOKRELAY_HOOKS").map(PathBuf::from),
            template,
            sandbox,
            tunnel,
            source: SourceConfig { clone_base_url },
            max_body_bytes: vars.parse("HOOKRELAY_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
            json_logs,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Empty values count as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|val| !val.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(key)
            .map(|s| {
                s.parse().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{e}"),
                })
            })
            .transpose()
            .map(|opt| opt.unwrap_or(default))
    }
}
