//! Node configuration.
//!
//! Settings come from three layers, applied in order: built-in defaults,
//! an optional TOML file, then CLI flags and `CINDER_*` environment
//! variables (see `main.rs`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cinder_cluster::DEFAULT_SLOT_COUNT;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading or validating the node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything a node needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CinderConfig {
    /// Address the admin listener binds to.
    pub bind: String,
    /// Admin (client) port. Also the port advertised to peers.
    pub port: u16,
    /// Gossip runs over UDP on `port + gossip_port_offset`.
    pub gossip_port_offset: u16,
    /// Directory holding the cluster config file.
    pub data_dir: PathBuf,
    /// Cluster config file name inside `data_dir`.
    pub config_file: String,
    /// Number of hash slots. Every node in a cluster must agree.
    pub slot_count: u16,
    /// Hostname announced to peers. May be empty.
    pub hostname: String,
    /// Gossip endpoints contacted before any peer is known.
    pub seeds: Vec<SocketAddr>,
    pub gossip_interval_ms: u64,
    /// Default ban applied by CLUSTER FORGET.
    pub forget_ban_secs: u64,
    pub max_connections: usize,
}

impl Default for CinderConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7000,
            gossip_port_offset: 10000,
            data_dir: PathBuf::from("."),
            config_file: "nodes.conf".into(),
            slot_count: DEFAULT_SLOT_COUNT,
            hostname: String::new(),
            seeds: Vec::new(),
            gossip_interval_ms: 1000,
            forget_ban_secs: 60,
            max_connections: 1024,
        }
    }
}

impl CinderConfig {
    /// Loads a config from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks settings that can't be expressed in the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_count == 0 {
            return Err(ConfigError::Invalid("slot_count must be at least 1".into()));
        }
        if self.port.checked_add(self.gossip_port_offset).is_none() {
            return Err(ConfigError::Invalid(format!(
                "port {} + gossip_port_offset {} overflows",
                self.port, self.gossip_port_offset
            )));
        }
        if self.gossip_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "gossip_interval_ms must be positive".into(),
            ));
        }
        if self.config_file.is_empty() {
            return Err(ConfigError::Invalid("config_file can't be empty".into()));
        }
        Ok(())
    }

    /// Full path of the cluster config file.
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(&self.config_file)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn forget_ban(&self) -> Duration {
        Duration::from_secs(self.forget_ban_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CinderConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.config_path(), PathBuf::from("./nodes.conf"));
        assert_eq!(cfg.forget_ban(), Duration::from_secs(60));
    }

    #[test]
    fn template_round_trips() {
        let cfg = CinderConfig::default();
        let text = cfg.to_toml().unwrap();
        assert!(text.contains("gossip_port_offset = 10000"));
        let parsed: CinderConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.toml");
        std::fs::write(
            &path,
            "port = 7100\nseeds = [\"10.0.0.1:17000\"]\nhostname = \"node-b\"\n",
        )
        .unwrap();

        let cfg = CinderConfig::from_file(&path).unwrap();
        assert_eq!(cfg.port, 7100);
        assert_eq!(cfg.hostname, "node-b");
        assert_eq!(cfg.seeds, vec!["10.0.0.1:17000".parse().unwrap()]);
        assert_eq!(cfg.slot_count, DEFAULT_SLOT_COUNT);
    }

    #[test]
    fn bad_files_report_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = CinderConfig::from_file(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "port = \"seven\"").unwrap();
        let err = CinderConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn validation_catches_overflow_and_zero_slots() {
        let cfg = CinderConfig {
            port: 60000,
            ..CinderConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = CinderConfig {
            slot_count: 0,
            ..CinderConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
