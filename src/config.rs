//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::game::mob::MAX_PLAYERS;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name displayed to players
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// World ID (1-255)
    #[serde(default = "default_world_id")]
    pub world_id: u8,

    /// Address the game listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Game port (TCP)
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Path to data files (saved players, definitions)
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Maximum number of players
    #[serde(default = "default_max_players")]
    pub max_players: u16,

    /// Maximum simultaneous connections from one address
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Game tick rate in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Decoded messages buffered per session before new arrivals are dropped
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,

    /// Flushed batches that may be in flight to one connection's writer
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Autosave interval in seconds (0 to disable)
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,

    /// Update broadcast tuning
    #[serde(default)]
    pub update: UpdateConfig,

    /// RSA private key configuration
    #[serde(default)]
    pub rsa: RsaConfig,

    /// Development mode flag (plaintext login block)
    #[serde(default)]
    pub dev_mode: bool,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Update broadcast configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// New local mobs an observer may gain in a single tick
    #[serde(default = "default_additions_per_tick")]
    pub additions_per_tick: usize,

    /// Upper bound on an observer's local mob list
    #[serde(default = "default_max_local_mobs")]
    pub max_local_mobs: usize,
}

/// RSA key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RsaConfig {
    /// RSA modulus (N) as hex string
    #[serde(default)]
    pub modulus: Option<String>,

    /// RSA private exponent (D) as hex string
    #[serde(default)]
    pub private_exponent: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

// Default value functions
fn default_server_name() -> String {
    "Realm".to_string()
}

fn default_world_id() -> u8 {
    1
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_game_port() -> u16 {
    43594
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_players() -> u16 {
    2000
}

fn default_max_connections_per_ip() -> usize {
    10
}

fn default_tick_rate() -> u64 {
    600
}

fn default_inbound_queue_capacity() -> usize {
    15
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_autosave_interval() -> u64 {
    300 // 5 minutes
}

fn default_additions_per_tick() -> usize {
    15
}

fn default_max_local_mobs() -> usize {
    255
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            additions_per_tick: default_additions_per_tick(),
            max_local_mobs: default_max_local_mobs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            server_name: default_server_name(),
            world_id: default_world_id(),
            bind_address: default_bind_address(),
            game_port: default_game_port(),
            data_path: default_data_path(),
            max_players: default_max_players(),
            max_connections_per_ip: default_max_connections_per_ip(),
            tick_rate_ms: default_tick_rate(),
            inbound_queue_capacity: default_inbound_queue_capacity(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            autosave_interval_secs: default_autosave_interval(),
            update: UpdateConfig::default(),
            rsa: RsaConfig::default(),
            dev_mode: false,
            log_format: LogFormat::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("REALM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REALM_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("REALM_WORLD_ID") {
            if let Ok(id) = val.parse() {
                self.world_id = id;
            }
        }
        if let Ok(val) = env::var("REALM_BIND_ADDRESS") {
            self.bind_address = val;
        }
        if let Ok(val) = env::var("REALM_GAME_PORT") {
            if let Ok(port) = val.parse() {
                self.game_port = port;
            }
        }
        if let Ok(val) = env::var("REALM_DATA_PATH") {
            self.data_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("REALM_MAX_PLAYERS") {
            if let Ok(max) = val.parse() {
                self.max_players = max;
            }
        }
        if let Ok(val) = env::var("REALM_TICK_RATE_MS") {
            if let Ok(rate) = val.parse() {
                self.tick_rate_ms = rate;
            }
        }
        if let Ok(val) = env::var("REALM_DEV_MODE") {
            self.dev_mode = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("REALM_LOG_FORMAT") {
            if val.eq_ignore_ascii_case("json") {
                self.log_format = LogFormat::Json;
            }
        }

        // RSA overrides (from secure environment)
        if let Ok(val) = env::var("REALM_RSA_MODULUS") {
            self.rsa.modulus = Some(val);
        }
        if let Ok(val) = env::var("REALM_RSA_PRIVATE_EXPONENT") {
            self.rsa.private_exponent = Some(val);
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.world_id == 0 {
            anyhow::bail!("World ID must be between 1 and 255");
        }

        // Player indices are 11 bits on the wire
        if self.max_players == 0 || self.max_players > MAX_PLAYERS {
            anyhow::bail!("Max players must be between 1 and {}", MAX_PLAYERS);
        }

        if self.tick_rate_ms < 100 || self.tick_rate_ms > 5000 {
            anyhow::bail!("Tick rate must be between 100ms and 5000ms");
        }

        if self.inbound_queue_capacity == 0 {
            anyhow::bail!("Inbound queue capacity must be at least 1");
        }

        if self.outbound_queue_capacity == 0 {
            anyhow::bail!("Outbound queue capacity must be at least 1");
        }

        if self.update.additions_per_tick == 0
            || self.update.additions_per_tick > self.update.max_local_mobs
        {
            anyhow::bail!("Additions per tick must be between 1 and max_local_mobs");
        }

        // Local list counts are written as a single byte
        if self.update.max_local_mobs > 255 {
            anyhow::bail!("Max local mobs must not exceed 255");
        }

        if !self.dev_mode && (self.rsa.modulus.is_none() || self.rsa.private_exponent.is_none())
        {
            tracing::warn!("RSA keys not configured; login blocks will be read as plaintext");
        }

        Ok(())
    }

    /// Number of ticks between autosaves, if enabled
    pub fn autosave_interval_ticks(&self) -> Option<u64> {
        if self.autosave_interval_secs == 0 {
            return None;
        }
        Some(((self.autosave_interval_secs * 1000) / self.tick_rate_ms).max(1))
    }

    /// Directory holding one JSON document per saved player
    pub fn saved_players_path(&self) -> PathBuf {
        self.data_path.join("saved_players")
    }

    /// Directory holding content definition files
    pub fn definitions_path(&self) -> PathBuf {
        self.data_path.join("defs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server_name, "Realm");
        assert_eq!(config.world_id, 1);
        assert_eq!(config.game_port, 43594);
        assert_eq!(config.tick_rate_ms, 600);
        assert_eq!(config.inbound_queue_capacity, 15);
        assert_eq!(config.update.additions_per_tick, 15);
        assert_eq!(config.update.max_local_mobs, 255);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_autosave_ticks() {
        let mut config = ServerConfig::default();
        assert_eq!(config.autosave_interval_ticks(), Some(500));

        config.autosave_interval_secs = 0;
        assert_eq!(config.autosave_interval_ticks(), None);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            server_name = "Test"
            tick_rate_ms = 300
            log_format = "json"

            [update]
            additions_per_tick = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.server_name, "Test");
        assert_eq!(config.tick_rate_ms, 300);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.update.additions_per_tick, 5);
        assert_eq!(config.update.max_local_mobs, 255);
        assert_eq!(config.game_port, 43594);
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        config.dev_mode = true;
        assert!(config.validate().is_ok());

        config.world_id = 0;
        assert!(config.validate().is_err());
        config.world_id = 1;

        config.max_players = 2047;
        assert!(config.validate().is_err());
        config.max_players = 2000;

        config.update.additions_per_tick = 300;
        assert!(config.validate().is_err());
        config.update.additions_per_tick = 15;

        config.inbound_queue_capacity = 0;
        assert!(config.validate().is_err());
    }
}
