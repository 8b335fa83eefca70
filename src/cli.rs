//! Command-line interface.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::RelayConfig;

#[derive(Parser, Debug)]
#[command(name = "hookrelay")]
#[command(about = "Relay webhooks into disposable adnanh/webhook environments")]
#[command(version)]
pub struct Cli {
    /// Hooks file for static mode. Without it every request is treated as a
    /// GitHub push and served from a fresh checkout of the pushed commit.
    #[arg(long, env = "HOOKRELAY_HOOKS")]
    pub hooks: Option<PathBuf>,

    /// Address to listen on (default 0.0.0.0:8080)
    #[arg(long, env = "HOOKRELAY_LISTEN")]
    pub listen: Option<SocketAddr>,
}

impl Cli {
    /// Apply flag values on top of the environment-derived config.
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(hooks) = &self.hooks {
            config.hooks_path = Some(hooks.clone());
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "hookrelay",
            "--hooks",
            "/srv/hooks.json",
            "--listen",
            "127.0.0.1:9090",
        ])
        .unwrap();

        let mut config = RelayConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.hooks_path, Some(PathBuf::from("/srv/hooks.json")));
        assert_eq!(config.listen_addr, "127.0.0.1:9090".parse().unwrap());
    }

    #[test]
    fn test_rejects_bad_listen_address() {
        assert!(Cli::try_parse_from(["hookrelay", "--listen", "nowhere"]).is_err());
    }
}
