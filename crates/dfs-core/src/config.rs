//! Configuration system for the node.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DFS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/dfs/config.toml
//!   3. ~/.config/dfs/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DfsConfig {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// Which decoder the transport runs on every connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// One bounded read per message, no framing. Small payloads only.
    Raw,
    /// Length-prefixed self-describing frames.
    #[default]
    Framed,
}

/// Which handshake the transport runs on every new connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeKind {
    #[default]
    Nop,
    /// Exchange magic and protocol version, reject mismatches.
    Hello,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// host:port the transport binds.
    pub listen_addr: String,
    pub decoder: DecoderKind,
    pub handshake: HandshakeKind,
    /// Messages buffered between connection handlers and the consumer.
    pub channel_capacity: usize,
    pub handshake_timeout_secs: u64,
    /// Drop a connection after this long without bytes. 0 = never.
    pub idle_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    /// Largest structured frame body accepted.
    pub max_frame_bytes: usize,
    /// Read cap of the raw decoder.
    pub raw_read_bytes: usize,
    /// First delay after a failed accept; doubles per consecutive failure.
    pub accept_backoff_ms: u64,
    pub accept_backoff_max_ms: u64,
    /// Consecutive accept failures before the listener gives up. 0 = never.
    pub max_accept_failures: u32,
    /// Peers dialed at startup (host:port).
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the content-addressed store.
    pub root: PathBuf,
    /// Number of nested shard directories.
    pub shard_depth: usize,
    /// Hex characters per shard directory name.
    pub shard_width: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            decoder: DecoderKind::default(),
            handshake: HandshakeKind::default(),
            channel_capacity: 64,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 0,
            dial_timeout_secs: 10,
            max_frame_bytes: crate::wire::DEFAULT_MAX_FRAME,
            raw_read_bytes: 1024,
            accept_backoff_ms: 5,
            accept_backoff_max_ms: 1000,
            max_accept_failures: 0,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("store"),
            shard_depth: 3,
            shard_width: 3,
        }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("dfs")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("dfs")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DfsConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            DfsConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file, without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DFS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DfsConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply DFS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("DFS_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = var("DFS_NETWORK__DECODER") {
            match v.as_str() {
                "raw" => self.network.decoder = DecoderKind::Raw,
                "framed" => self.network.decoder = DecoderKind::Framed,
                _ => {}
            }
        }
        if let Some(v) = var("DFS_NETWORK__HANDSHAKE") {
            match v.as_str() {
                "nop" => self.network.handshake = HandshakeKind::Nop,
                "hello" => self.network.handshake = HandshakeKind::Hello,
                _ => {}
            }
        }
        if let Some(v) = var("DFS_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
    }
}
