//! Command-line argument parsing for Stratum peers.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, PeerRole};

/// Stratum peer command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "stratum-peer", about = "Stratum command sync peer")]
pub struct CliArgs {
    /// Run as the session host (relay authority).
    #[arg(long)]
    pub host: bool,

    /// Host address to bind (host) or connect to (client).
    #[arg(long)]
    pub address: Option<String>,

    /// Host port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Display name announced to the host.
    #[arg(long)]
    pub name: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if args.host {
            self.network.role = PeerRole::Host;
        }
        if let Some(ref addr) = args.address {
            self.network.host_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(ref name) = args.name {
            self.network.peer_name = name.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> CliArgs {
        CliArgs {
            host: false,
            address: None,
            port: None,
            name: None,
            log_level: None,
            config: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            host: true,
            address: Some("192.168.1.1".to_string()),
            ..empty_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.role, PeerRole::Host);
        assert_eq!(config.network.host_address, "192.168.1.1");
        // Non-overridden fields retain defaults
        assert_eq!(config.network.port, 7777);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&empty_args());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "stratum-peer",
            "--host",
            "--port",
            "9100",
            "--log-level",
            "debug",
        ]);
        assert!(args.host);
        assert_eq!(args.port, Some(9100));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.address.is_none());
    }
}
