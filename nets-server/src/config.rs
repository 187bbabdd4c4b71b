//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via NETS_CONFIG)
//! 3. Environment variables

use crate::server::{ServerConfig, DEFAULT_ADDR, DEFAULT_BACKLOG};
use nets_core::{ProtoAddr, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_IDLE};
use nets_protocol::MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Buffer pool configuration.
    pub buffers: BufferConfig,
    /// Periodic tick configuration.
    pub tick: TickConfig,
    /// Packet framing configuration.
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("NETS_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.buffers.apply_env_overrides();
        self.tick.apply_env_overrides();
        self.protocol.apply_env_overrides();
    }

    /// Checks values that would otherwise only fail once the server starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ProtoAddr::parse(&self.network.addr)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if self.buffers.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "buffers.capacity must be greater than zero".to_string(),
            ));
        }
        if self.tick.enabled && self.tick.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "tick.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.protocol.max_payload == 0 {
            return Err(ConfigError::ValidationError(
                "protocol.max_payload must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Builds the runtime server configuration.
    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.network.addr.clone())
            .with_nodelay(self.network.nodelay)
            .with_backlog(self.network.backlog)
            .with_tick(self.tick.enabled)
            .with_buffer_capacity(self.buffers.capacity)
            .with_max_idle_buffers(self.buffers.max_idle);
        if let Some(keepalive) = self.network.keepalive() {
            config = config.with_keepalive(keepalive);
        }
        config
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on.
    pub addr: String,
    /// TCP keepalive idle time in seconds (0 = OS default).
    pub keepalive_secs: u64,
    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,
    /// Listen backlog.
    pub backlog: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            keepalive_secs: 0,
            nodelay: false,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("NETS_ADDR") {
            if !addr.is_empty() {
                self.addr = addr;
            }
        }

        if let Ok(keepalive) = std::env::var("NETS_KEEPALIVE_SECS") {
            if let Ok(secs) = keepalive.parse() {
                self.keepalive_secs = secs;
            }
        }

        if let Ok(nodelay) = std::env::var("NETS_NODELAY") {
            self.nodelay = parse_flag(&nodelay);
        }
    }

    /// Returns the keepalive time, if one is configured.
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }
}

/// Buffer pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Size of each read buffer in bytes.
    pub capacity: usize,
    /// Idle buffers retained per pool list.
    pub max_idle: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

impl BufferConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("NETS_BUFFER_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.capacity = n;
            }
        }

        if let Ok(max_idle) = std::env::var("NETS_MAX_IDLE_BUFFERS") {
            if let Ok(n) = max_idle.parse() {
                self.max_idle = n;
            }
        }
    }
}

/// Periodic tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Whether the tick callback runs.
    pub enabled: bool,
    /// Delay between ticks in milliseconds.
    pub interval_ms: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 1000,
        }
    }
}

impl TickConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(tick) = std::env::var("NETS_TICK") {
            self.enabled = parse_flag(&tick);
        }

        if let Ok(interval) = std::env::var("NETS_TICK_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.interval_ms = ms;
            }
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Packet framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Whether connections carry framed packets rather than raw bytes.
    pub framed: bool,
    /// Largest payload accepted when decoding packets.
    pub max_payload: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            framed: false,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(framed) = std::env::var("NETS_FRAMED") {
            self.framed = parse_flag(&framed);
        }

        if let Ok(max) = std::env::var("NETS_MAX_PAYLOAD") {
            if let Ok(n) = max.parse() {
                self.max_payload = n;
            }
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.addr, DEFAULT_ADDR);
        assert_eq!(config.network.keepalive(), None);
        assert_eq!(config.buffers.capacity, DEFAULT_BUFFER_CAPACITY);
        assert!(!config.tick.enabled);
        assert_eq!(config.tick.interval(), Duration::from_secs(1));
        assert!(!config.protocol.framed);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.network.addr = "tcp://0.0.0.0:9100".to_string();
        config.tick.enabled = true;
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.addr, config.network.addr);
        assert!(parsed.tick.enabled);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: Config = serde_yaml::from_str("network:\n  nodelay: true\n").unwrap();
        assert!(parsed.network.nodelay);
        assert_eq!(parsed.network.addr, DEFAULT_ADDR);
        assert_eq!(parsed.buffers.max_idle, DEFAULT_MAX_IDLE);
    }

    #[test]
    fn test_from_file_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nets.yaml");
        std::fs::write(
            &path,
            "network:\n  addr: tcp://127.0.0.1:0\n  keepalive_secs: 30\nbuffers:\n  capacity: 512\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.network.addr, "tcp://127.0.0.1:0");
        assert_eq!(config.network.keepalive(), Some(Duration::from_secs(30)));
        assert_eq!(config.buffers.capacity, 512);

        let copy = dir.path().join("copy.yaml");
        config.save(&copy).unwrap();
        let reloaded = Config::from_file(&copy).unwrap();
        assert_eq!(reloaded.buffers.capacity, 512);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::IoError(..))
        ));

        let broken = dir.path().join("broken.yaml");
        std::fs::write(&broken, "network: [not, a, map").unwrap();
        let err = Config::from_file(&broken).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.network.addr = "tcp://localhost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.buffers.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tick.enabled = true;
        config.tick.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_conversion() {
        let mut config = Config::default();
        config.network.keepalive_secs = 15;
        config.network.nodelay = true;
        config.tick.enabled = true;
        config.buffers.capacity = 1024;

        let server = config.server_config();
        assert_eq!(server.addr, DEFAULT_ADDR);
        assert_eq!(server.keepalive, Some(Duration::from_secs(15)));
        assert!(server.nodelay);
        assert!(server.tick);
        assert_eq!(server.buffer_capacity, 1024);
    }

    // The only test that touches the process environment.
    #[test]
    fn test_env_overrides() {
        let vars = [
            ("NETS_ADDR", "tcp://0.0.0.0:7000"),
            ("NETS_KEEPALIVE_SECS", "45"),
            ("NETS_NODELAY", "true"),
            ("NETS_TICK", "1"),
            ("NETS_TICK_INTERVAL_MS", "250"),
            ("NETS_BUFFER_CAPACITY", "2048"),
            ("NETS_MAX_IDLE_BUFFERS", "16"),
            ("NETS_FRAMED", "TRUE"),
            ("NETS_MAX_PAYLOAD", "4096"),
        ];
        for (key, value) in vars {
            std::env::set_var(key, value);
        }

        let config = Config::from_env();

        for (key, _) in vars {
            std::env::remove_var(key);
        }

        assert_eq!(config.network.addr, "tcp://0.0.0.0:7000");
        assert_eq!(config.network.keepalive_secs, 45);
        assert!(config.network.nodelay);
        assert!(config.tick.enabled);
        assert_eq!(config.tick.interval(), Duration::from_millis(250));
        assert_eq!(config.buffers.capacity, 2048);
        assert_eq!(config.buffers.max_idle, 16);
        assert!(config.protocol.framed);
        assert_eq!(config.protocol.max_payload, 4096);
    }
}
