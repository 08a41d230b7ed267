//! Configuration system for Stratum peers.
//!
//! Session, pipeline and hard-sync settings persisted as `config.ron`.
//! Unknown fields are ignored and missing ones take their defaults, so
//! files written by older or newer peers still load. CLI flags override the
//! file.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE, Config, DebugConfig, HardSyncConfig, NetworkConfig, PeerRole, SyncConfig,
    TransportMode, default_config_dir,
};
pub use error::ConfigError;
