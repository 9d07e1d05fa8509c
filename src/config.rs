//! Configuration loading and validation.
//!
//! Courier reads `courier.toml` (or `$COURIER_CONFIG`). Every section has
//! defaults, so a missing file yields a working local setup.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "COURIER_CONFIG";

/// Default config file name in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "courier.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite location.
    pub database: DatabaseConfig,
    /// Protocol bridge sidecar.
    pub bridge: BridgeConfig,
    /// Reconnect backoff policy.
    pub reconnect: ReconnectConfig,
    /// Interactive connection settings.
    pub connection: ConnectionConfig,
    /// Campaign dispatcher settings.
    pub dispatcher: DispatcherConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// SQLite location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("courier.db"),
        }
    }
}

/// Protocol bridge sidecar.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the sidecar HTTP API.
    pub base_url: String,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP request timeout in seconds (bounds every send).
    pub request_timeout_secs: u64,
    /// Long-poll timeout for the event stream in seconds.
    pub poll_timeout_secs: u64,
    /// Ceiling for the event-poll retry backoff in milliseconds.
    pub poll_max_backoff_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3001".to_owned(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            poll_timeout_secs: 60,
            poll_max_backoff_ms: 30_000,
        }
    }
}

/// Reconnect backoff policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay_ms: u64,
    /// Ceiling for the delay.
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// Interactive connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long a pairing-code request waits for the session to come up.
    pub pairing_wait_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pairing_wait_secs: 30,
        }
    }
}

impl ConnectionConfig {
    /// Pairing wait as a [`Duration`].
    pub fn pairing_wait(&self) -> Duration {
        Duration::from_secs(self.pairing_wait_secs)
    }
}

/// Campaign dispatcher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds between campaign supervisor ticks.
    pub supervisor_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            supervisor_interval_secs: 60,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs.
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: data_dir().join("logs"),
        }
    }
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the resulting configuration is invalid.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path_with(|key| std::env::var(key).ok());
        let mut config = load_config(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("COURIER_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = env("COURIER_BRIDGE_URL") {
            self.bridge.base_url = v;
        }
        if let Some(v) = env("COURIER_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("COURIER_LOGS_DIR") {
            self.logging.dir = PathBuf::from(v);
        }
        if let Some(v) = env("COURIER_SUPERVISOR_INTERVAL_SECS") {
            match v.parse() {
                Ok(n) => self.dispatcher.supervisor_interval_secs = n,
                Err(_) => tracing::warn!(
                    var = "COURIER_SUPERVISOR_INTERVAL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Reject settings that would make the runtime misbehave.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconnect.initial_delay_ms == 0 {
            anyhow::bail!("reconnect.initial_delay_ms must be greater than 0");
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            anyhow::bail!(
                "reconnect.initial_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.initial_delay_ms,
                self.reconnect.max_delay_ms
            );
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            anyhow::bail!(
                "reconnect.multiplier must be a finite number >= 1, got {}",
                self.reconnect.multiplier
            );
        }
        if self.dispatcher.supervisor_interval_secs == 0 {
            anyhow::bail!("dispatcher.supervisor_interval_secs must be greater than 0");
        }
        if self.bridge.base_url.trim().is_empty() {
            anyhow::bail!("bridge.base_url must not be empty");
        }
        Ok(())
    }
}

/// Load a config file; a missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::info!(path = %path.display(), "loading config from file");
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "failed to read config at {}: {e}",
            path.display()
        )),
    }
}

/// Resolve the config file path using a custom env resolver.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    env(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Default data directory (`~/.courier/`), falling back to `./.courier`.
pub fn data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|home| home.home_dir().join(".courier"))
        .unwrap_or_else(|| PathBuf::from(".courier"))
}
