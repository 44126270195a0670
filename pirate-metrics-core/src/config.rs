//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/pirate-metrics/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/pirate-metrics/` (~/.config/pirate-metrics/)
//! - State/Logs: `$XDG_STATE_HOME/pirate-metrics/` (~/.local/state/pirate-metrics/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Queue capacity before new asynchronous submissions are dropped
pub const MAX_BUFFER: usize = 5000;

/// Fixed pause after a failed delivery before reconnecting
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(15);

/// How long `cleanup` waits for the worker to drain
pub const EXIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_HOST: &str = "https://piratemetrics.com";
const DEFAULT_PORT: u16 = 443;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Agent / collector configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agent configuration
///
/// Mirrors the construction options of the agent: where the collector
/// lives, whether the agent is enabled, its default delivery mode, and
/// the queue/backoff policy.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Account credential sent with every submission
    #[serde(default)]
    pub api_key: String,

    /// Combined "host:port"; overrides `host` and `port` when set
    pub collector: Option<String>,

    /// Collector host, with or without scheme
    #[serde(default = "default_host")]
    pub host: String,

    /// Collector port
    #[serde(default = "default_port")]
    pub port: u16,

    /// When false every agent operation is a no-op
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Default delivery mode for the plain (non `_sync`) helpers
    #[serde(default)]
    pub synchronous: bool,

    /// Queue capacity
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,

    /// Pause after a failed delivery, in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Graceful drain budget for `cleanup`, in milliseconds
    #[serde(default = "default_exit_flush_timeout_ms")]
    pub exit_flush_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            collector: None,
            host: default_host(),
            port: default_port(),
            enabled: default_enabled(),
            synchronous: false,
            max_buffer: default_max_buffer(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            exit_flush_timeout_ms: default_exit_flush_timeout_ms(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_enabled() -> bool {
    true
}

fn default_max_buffer() -> usize {
    MAX_BUFFER
}

fn default_reconnect_delay_ms() -> u64 {
    MAX_RECONNECT_DELAY.as_millis() as u64
}

fn default_exit_flush_timeout_ms() -> u64 {
    EXIT_FLUSH_TIMEOUT.as_millis() as u64
}

impl AgentConfig {
    /// Config for the given api key with every other option at its default
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn exit_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_flush_timeout_ms)
    }

    /// Resolve the collector base URL (scheme, host and port, no trailing slash)
    ///
    /// `collector` wins over `host`/`port`. Hosts given without a scheme are
    /// reached over plain http.
    pub fn base_url(&self) -> Result<String> {
        let (host, port) = match &self.collector {
            Some(collector) => split_host_port(collector)?,
            None => (self.host.trim_end_matches('/').to_string(), self.port),
        };

        if host.is_empty() {
            return Err(Error::Config("collector host is empty".to_string()));
        }

        let host = if host.contains("://") {
            host
        } else {
            format!("http://{}", host)
        };
        Ok(format!("{}:{}", host, port))
    }

    /// Check if the agent is enabled and has what it needs to deliver
    pub fn is_ready(&self) -> bool {
        self.enabled && !self.api_key.is_empty() && self.base_url().is_ok()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.api_key.is_empty() {
            return Err(Error::Config(
                "agent.api_key is required when the agent is enabled".to_string(),
            ));
        }
        if self.max_buffer == 0 {
            return Err(Error::Config(
                "agent.max_buffer must be at least 1".to_string(),
            ));
        }
        self.base_url()?;
        Ok(())
    }
}

/// Split "host:port", keeping any scheme on the host side
fn split_host_port(collector: &str) -> Result<(String, u16)> {
    let collector = collector.trim().trim_end_matches('/');
    let (host, port) = collector.rsplit_once(':').ok_or_else(|| {
        Error::Config(format!(
            "agent.collector must be host:port, got '{}'",
            collector
        ))
    })?;
    let port = port.parse::<u16>().map_err(|e| {
        Error::Config(format!("invalid port in agent.collector '{}': {}", collector, e))
    })?;
    Ok((host.to_string(), port))
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write to a daily-rolled file in the state directory instead of stderr
    #[serde(default)]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/pirate-metrics/config.toml` (~/.config/pirate-metrics/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("pirate-metrics").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/pirate-metrics/` (~/.local/state/pirate-metrics/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("pirate-metrics")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("pirate-metrics.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.agent.enabled);
        assert!(!config.agent.synchronous);
        assert_eq!(config.agent.max_buffer, 5000);
        assert_eq!(config.agent.reconnect_delay(), Duration::from_secs(15));
        assert_eq!(config.agent.exit_flush_timeout(), Duration::from_secs(5));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[agent]
api_key = "test_token"
collector = "localhost:10001"
synchronous = true
max_buffer = 3

[logging]
level = "debug"
"#;
        let config = Config::from_toml_str(toml).unwrap();

        assert_eq!(config.agent.api_key, "test_token");
        assert!(config.agent.synchronous);
        assert_eq!(config.agent.max_buffer, 3);
        assert_eq!(config.agent.reconnect_delay_ms, 15_000);
        assert_eq!(config.logging.level, "debug");
        assert!(config.agent.is_ready());
    }

    #[test]
    fn test_base_url_defaults() {
        let config = AgentConfig::new("key");
        assert_eq!(config.base_url().unwrap(), "https://piratemetrics.com:443");
    }

    #[test]
    fn test_collector_overrides_host_and_port() {
        let config = AgentConfig {
            collector: Some("collector.internal:8080".to_string()),
            host: "https://ignored.example.com".to_string(),
            port: 9999,
            ..AgentConfig::new("key")
        };
        assert_eq!(config.base_url().unwrap(), "http://collector.internal:8080");

        let config = AgentConfig {
            collector: Some("https://collector.example.com:8443/".to_string()),
            ..AgentConfig::new("key")
        };
        assert_eq!(
            config.base_url().unwrap(),
            "https://collector.example.com:8443"
        );
    }

    #[test]
    fn test_host_without_scheme_uses_http() {
        let config = AgentConfig {
            host: "localhost".to_string(),
            port: 10001,
            ..AgentConfig::new("key")
        };
        assert_eq!(config.base_url().unwrap(), "http://localhost:10001");
    }

    #[test]
    fn test_agent_config_validation() {
        // Disabled config is always valid
        let config = AgentConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(!config.is_ready());

        // Enabled without an api key should fail
        assert!(AgentConfig::default().validate().is_err());

        let config = AgentConfig {
            max_buffer: 0,
            ..AgentConfig::new("key")
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            collector: Some("no-port".to_string()),
            ..AgentConfig::new("key")
        };
        assert!(config.validate().is_err());

        assert!(AgentConfig::new("key").validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\napi_key = \"abc\"\nenabled = false\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.agent.api_key, "abc");
        assert!(!config.agent.enabled);

        assert!(Config::load_from(&dir.path().join("missing.toml")).is_err());
    }
}
