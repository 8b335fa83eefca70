//! Environment template recipe.
//!
//! A recipe is the immutable description of the webhook environment image:
//! a base image, the setup commands that install the dispatch binary, and the
//! entrypoint it is launched with. Its fingerprint doubles as the image tag, so
//! an identical recipe always maps to the same (reusable) image.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::config::TemplateConfig;

/// Image repository built templates are committed under.
pub const TEMPLATE_REPOSITORY: &str = "hookrelay-webhook";

/// Where the dispatch binary is installed.
pub const DISPATCH_BINARY: &str = "/usr/local/bin/webhook";

/// One setup operation applied on top of the base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStep {
    /// Run a command (argv form) in the image.
    Run(Vec<String>),
    /// Change the working directory for subsequent steps and the final image.
    Workdir(String),
}

/// Immutable description of the dispatch environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentTemplate {
    pub base_image: String,
    pub steps: Vec<SetupStep>,
    pub entrypoint: Vec<String>,
    pub exposed_port: u16,
}

impl EnvironmentTemplate {
    /// Recipe installing `adnanh/webhook` from its release archive.
    pub fn webhook(config: &TemplateConfig) -> Self {
        let archive = "webhook-linux-amd64.tar.gz";
        let url = format!(
            "https://github.com/adnanh/webhook/releases/download/{}/{}",
            config.webhook_version, archive
        );

        let argv = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();

        Self {
            base_image: config.base_image.clone(),
            steps: vec![
                SetupStep::Workdir("/tmp".to_string()),
                SetupStep::Run(argv(&[
                    "sh",
                    "-c",
                    "apt-get update && apt-get install -y --no-install-recommends wget ca-certificates",
                ])),
                SetupStep::Run(argv(&["wget", "-q", &url])),
                SetupStep::Run(argv(&[
                    "tar",
                    "-C",
                    "/usr/local/bin",
                    "--strip-components",
                    "1",
                    "-xf",
                    archive,
                    "webhook-linux-amd64/webhook",
                ])),
                SetupStep::Run(argv(&["rm", "-f", archive])),
                SetupStep::Workdir("/".to_string()),
            ],
            entrypoint: vec![DISPATCH_BINARY.to_string()],
            exposed_port: config.dispatch_port,
        }
    }

    /// Canonical text form. Two recipes are the same template iff this matches.
    fn canonical(&self) -> String {
        let mut out = format!("FROM {}\n", self.base_image);
        for step in &self.steps {
            match step {
                SetupStep::Run(args) => {
                    let _ = writeln!(out, "RUN {args:?}");
                }
                SetupStep::Workdir(dir) => {
                    let _ = writeln!(out, "WORKDIR {dir}");
                }
            }
        }
        let _ = writeln!(out, "ENTRYPOINT {:?}", self.entrypoint);
        let _ = writeln!(out, "EXPOSE {}/tcp", self.exposed_port);
        out
    }

    /// Short content hash of the recipe.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        hex::encode(&digest[..8])
    }

    /// Image reference the built template is stored under.
    pub fn image_tag(&self) -> String {
        format!("{}:{}", TEMPLATE_REPOSITORY, self.fingerprint())
    }

    /// Working directory in effect after the last step.
    pub fn final_workdir(&self) -> Option<&str> {
        self.steps.iter().rev().find_map(|step| match step {
            SetupStep::Workdir(dir) => Some(dir.as_str()),
            SetupStep::Run(_) => None,
        })
    }

    /// Render the setup steps as a single POSIX shell script.
    ///
    /// Every step must succeed; the script stops at the first failure so a
    /// broken download surfaces as a non-zero exit.
    pub fn setup_script(&self) -> String {
        let mut lines = vec!["set -eu".to_string()];
        for step in &self.steps {
            match step {
                SetupStep::Run(args) => {
                    lines.push(args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "))
                }
                SetupStep::Workdir(dir) => {
                    lines.push(format!("mkdir -p {0} && cd {0}", shell_quote(dir)))
                }
            }
        }
        lines.join("\n")
    }
}

/// Arguments the dispatch binary is launched with.
pub fn dispatch_args(port: u16) -> Vec<String> {
    vec![
        "-verbose".to_string(),
        "-port".to_string(),
        port.to_string(),
        "-hooks".to_string(),
        "hooks.json".to_string(),
    ]
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
