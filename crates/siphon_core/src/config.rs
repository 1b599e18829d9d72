//! Controller configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default controller port used by datapath nodes.
pub const DEFAULT_PORT: u16 = 6699;

/// What happens to a node's hostname mappings once its connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep `NodeID2Hostname` / `Hostname2NodeID` entries forever.
    #[default]
    Retain,
    /// Remove both entries when the owning connection closes.
    Cleanup,
}

/// Logging settings consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Directory for daily-rolling log files. Console only when `None`.
    pub dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info,siphon_network=debug".to_string(),
            dir: None,
        }
    }
}

/// Top-level configuration of a controller process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Address the node listener binds to.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// How long a freshly accepted socket has to deliver its hostname.
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Largest hostname length prefix accepted during the handshake.
    pub max_hostname_len: usize,

    /// Largest single NUL-delimited frame accepted from a node.
    pub max_frame_len: usize,

    /// Fate of hostname mappings on disconnect.
    pub identity_retention: RetentionPolicy,

    /// Shared store URL (`redis://host:port/db`). The store is in-process,
    /// and so private to this process, when unset.
    pub store_url: Option<String>,

    /// Static session file loaded into the shared store at startup.
    pub session_config_path: Option<PathBuf>,

    /// Run the session-ID allocator in this process.
    pub session_allocator: bool,

    /// Capacity of the connection lifecycle channel.
    pub event_channel_capacity: usize,

    pub log: LogSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            handshake_timeout: Duration::from_secs(10),
            max_hostname_len: 1024,
            max_frame_len: 1024 * 1024,
            identity_retention: RetentionPolicy::Retain,
            store_url: None,
            session_config_path: None,
            session_allocator: false,
            event_channel_capacity: 256,
            log: LogSettings::default(),
        }
    }
}

impl ControllerConfig {
    /// Base directory for controller state: `~/.siphon`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".siphon"))
    }

    /// Default config file path: `~/.siphon/controller.json`
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("controller.json"))
    }

    /// Default log directory: `~/.siphon/logs`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Load the config strictly; a missing or corrupt file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Corrupt config file {}", path.display()))
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("{e:#}, using defaults"),
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.identity_retention, RetentionPolicy::Retain);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert!(!config.session_allocator);
        assert!(config.session_config_path.is_none());
        assert!(config.store_url.is_none());
        assert!(config.log.dir.is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"listen_addr": "127.0.0.1:7000", "identity_retention": "cleanup", "store_url": "redis://db:6379/0"}"#;
        let config: ControllerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.listen_addr.port(), 7000);
        assert_eq!(config.store_url.as_deref(), Some("redis://db:6379/0"));
        assert_eq!(config.identity_retention, RetentionPolicy::Cleanup);
        assert_eq!(config.max_frame_len, 1024 * 1024);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("controller.json");

        let mut original = ControllerConfig::default();
        original.handshake_timeout = Duration::from_secs(3);
        original.session_allocator = true;
        original.session_config_path = Some(PathBuf::from("/etc/siphon/sessions.json"));
        original.save_to_file(&path).unwrap();

        let loaded = ControllerConfig::load(&path).unwrap();
        assert_eq!(loaded.handshake_timeout, Duration::from_secs(3));
        assert!(loaded.session_allocator);
        assert_eq!(loaded.session_config_path, original.session_config_path);
    }

    #[test]
    fn test_load_corrupt_is_error_but_load_or_default_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(ControllerConfig::load(&path).is_err());
        let config = ControllerConfig::load_or_default(&path);
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig::load_or_default(&dir.path().join("absent.json"));
        assert_eq!(config.max_hostname_len, 1024);
    }
}
