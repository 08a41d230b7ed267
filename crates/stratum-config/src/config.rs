//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level peer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Network/session settings.
    pub network: NetworkConfig,
    /// Command pipeline settings.
    pub sync: SyncConfig,
    /// Full-state resync triggers.
    pub hard_sync: HardSyncConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Role a peer plays for the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerRole {
    /// Relay authority: receives from every client and fans commands out.
    Host,
    /// Regular participant: talks to the host only.
    #[default]
    Client,
}

/// Which transport backend carries the session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportMode {
    /// TCP star with the host as hub.
    #[default]
    Relay,
    /// In-process hub, used by tests and single-process demos.
    Loopback,
}

/// Network/session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host or client.
    pub role: PeerRole,
    /// Backend selection.
    pub mode: TransportMode,
    /// Address the host binds to, or the address a client connects to.
    pub host_address: String,
    /// Host port.
    pub port: u16,
    /// Maximum number of connected clients (host only).
    pub max_peers: u32,
    /// Largest link frame accepted from the wire, in bytes.
    pub max_frame_bytes: u32,
    /// Display name announced to the host.
    pub peer_name: String,
}

/// Command pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of executed commands retained in the execution history.
    pub history_capacity: usize,
    /// Simulation ticks per second driven by the peer loop.
    pub tick_rate_hz: u32,
    /// Simulation ticks that make up one in-game day.
    pub ticks_per_cycle: u32,
    /// Largest command payload the codec will accept, in bytes.
    pub max_payload_bytes: u32,
}

/// Which events make the host distribute a full-state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HardSyncConfig {
    /// Resync at the start of every in-game day.
    pub on_new_day: bool,
    /// Resync whenever the host saves manually.
    pub on_manual_save: bool,
    /// Resync when a new peer joins the session.
    pub on_peer_join: bool,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Directory for JSON log files in debug builds. Empty disables file logs.
    pub log_dir: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            role: PeerRole::Client,
            mode: TransportMode::Relay,
            host_address: "127.0.0.1".to_string(),
            port: 7777,
            max_peers: 8,
            max_frame_bytes: 64 * 1024 * 1024,
            peer_name: "Duplicant".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            tick_rate_hz: 10,
            ticks_per_cycle: 6000,
            max_payload_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for HardSyncConfig {
    fn default() -> Self {
        Self {
            on_new_day: true,
            on_manual_save: true,
            on_peer_join: true,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

impl NetworkConfig {
    /// `host_address:port` as a single string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host_address, self.port)
    }
}

/// Default per-user configuration directory (`<config dir>/stratum`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("stratum"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

/// File name inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Read `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default peer config to {}", path.display());
            return Ok(config);
        }
        let config = read_config(&path)?;
        log::info!("Peer config loaded from {}", path.display());
        Ok(config)
    }

    /// Write this config to `config_dir/config.ron`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let write_err = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty)?;

        std::fs::create_dir_all(config_dir).map_err(write_err)?;
        std::fs::write(&path, text).map_err(write_err)
    }

    /// Re-read the file. `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_config(&config_dir.join(CONFIG_FILE))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Peer config changed on disk");
        Ok(Some(fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(!ron_str.is_empty());
        assert!(ron_str.contains("history_capacity: 1000"));
        assert!(ron_str.contains("port: 7777"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.network.role = PeerRole::Host;
        config.network.mode = TransportMode::Loopback;
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (), sync: (), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.hard_sync, HardSyncConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let ron_str = "(network: (role: Host, port: 9000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.role, PeerRole::Host);
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.host_address, "127.0.0.1");
        assert_eq!(config.sync.history_capacity, 1000);
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true)";
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_endpoint_formatting() {
        let network = NetworkConfig {
            host_address: "10.0.0.5".to_string(),
            port: 4242,
            ..NetworkConfig::default()
        };
        assert_eq!(network.endpoint(), "10.0.0.5:4242");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.role = PeerRole::Host;
        config.sync.history_capacity = 250;
        config.hard_sync.on_new_day = false;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.sync.tick_rate_hz = 30;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_some());
        assert_eq!(result.unwrap().sync.tick_rate_hz, 30);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
