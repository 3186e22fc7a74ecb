//! Configuration management for bingo-sync
//!
//! TOML file, `BINGO_*` environment overrides, then validation. Every field
//! has a default so an empty file (or no file) is a working configuration.

use crate::errors::{BingoResult, ConfigurationError};
use crate::game::GameId;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BingoConfig {
    pub sync: SyncConfig,
    pub player: PlayerConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

/// Transport selection and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// WebSocket URL of the real-time tree relay; unset means local only
    pub remote_url: Option<String>,
    /// Directory for file-backed local storage; unset means in-process memory
    pub storage_dir: Option<String>,
    pub poll_interval_ms: u64,
    pub staleness_window_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            storage_dir: None,
            poll_interval_ms: 1000,
            staleness_window_ms: 10_000,
            heartbeat_interval_ms: 3000,
            request_timeout_ms: 5000,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Marked cells (free space included) required before calling bingo
    pub min_marks_for_call: usize,
    /// Where `player.html` is served from
    pub base_url: String,
    /// Game joined when the entry URL carries no usable id
    pub fallback_game_id: String,
    pub history_len: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            min_marks_for_call: 5,
            base_url: "http://localhost:8080/".to_string(),
            fallback_game_id: "DEMO".to_string(),
            history_len: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

impl RelayConfig {
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "bingo_sync=info".to_string(),
        }
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl BingoConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let sync = &self.sync;
        for (field, value) in [
            ("sync.poll_interval_ms", sync.poll_interval_ms),
            ("sync.staleness_window_ms", sync.staleness_window_ms),
            ("sync.heartbeat_interval_ms", sync.heartbeat_interval_ms),
            ("sync.request_timeout_ms", sync.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, value, "Interval cannot be zero"));
            }
        }

        if sync.staleness_window_ms <= sync.poll_interval_ms
            || sync.staleness_window_ms <= sync.heartbeat_interval_ms
        {
            return Err(invalid(
                "sync.staleness_window_ms",
                sync.staleness_window_ms,
                "Must be longer than both the poll and heartbeat intervals",
            ));
        }

        if let Some(remote) = &sync.remote_url {
            let url = url::Url::parse(remote)?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(invalid("sync.remote_url", remote, "Expected a ws:// or wss:// URL"));
            }
        }

        if let Some(dir) = &sync.storage_dir {
            if dir.is_empty() {
                return Err(ConfigurationError::MissingRequired("sync.storage_dir".to_string()));
            }
        }

        let player = &self.player;
        if !(1..=25).contains(&player.min_marks_for_call) {
            return Err(invalid(
                "player.min_marks_for_call",
                player.min_marks_for_call,
                "Must be between 1 and 25",
            ));
        }
        url::Url::parse(&player.base_url)?;
        if GameId::new(player.fallback_game_id.as_str()).is_none() {
            return Err(invalid(
                "player.fallback_game_id",
                &player.fallback_game_id,
                "Only letters, digits, '-' and '_' are allowed",
            ));
        }
        if player.history_len == 0 {
            return Err(invalid("player.history_len", 0, "History length cannot be zero"));
        }

        if self.relay.port == 0 {
            return Err(invalid("relay.port", 0, "Port cannot be zero"));
        }

        Ok(())
    }
}

fn parse_millis(var: &str, value: &str) -> Result<u64, ConfigurationError> {
    value
        .parse()
        .map_err(|_| invalid(var, value, "Invalid millisecond value"))
}

/// Configuration loader with environment variable support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> BingoResult<BingoConfig> {
        let mut config = match &self.config_path {
            Some(path) => self.load_from_file(path)?,
            None => BingoConfig::default(),
        };

        self.apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> Result<BingoConfig, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e))
        })?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_env_overrides(&self, config: &mut BingoConfig) -> Result<(), ConfigurationError> {
        if let Ok(url) = env::var("BINGO_REMOTE_URL") {
            config.sync.remote_url = (!url.is_empty()).then_some(url);
        }
        if let Ok(dir) = env::var("BINGO_STORAGE_DIR") {
            config.sync.storage_dir = (!dir.is_empty()).then_some(dir);
        }
        if let Ok(value) = env::var("BINGO_POLL_INTERVAL_MS") {
            config.sync.poll_interval_ms = parse_millis("BINGO_POLL_INTERVAL_MS", &value)?;
        }
        if let Ok(value) = env::var("BINGO_STALENESS_WINDOW_MS") {
            config.sync.staleness_window_ms = parse_millis("BINGO_STALENESS_WINDOW_MS", &value)?;
        }
        if let Ok(port) = env::var("BINGO_RELAY_PORT") {
            config.relay.port = port
                .parse()
                .map_err(|_| invalid("BINGO_RELAY_PORT", &port, "Invalid port number"))?;
        }
        Ok(())
    }

    pub fn save(&self, config: &BingoConfig, path: &str) -> BingoResult<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, toml_string).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into()
        })
    }
}

/// Write the default configuration to `path`
pub fn generate_sample_config(path: &str) -> BingoResult<()> {
    ConfigLoader::new().save(&BingoConfig::default(), path)
}
