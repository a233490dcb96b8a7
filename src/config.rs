//! Configuration management for PinWallet

use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

/// Default config file looked up by [`load_config`].
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pin: PinConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reverse proxies whose `X-Forwarded-For` is believed. Empty means the
    /// peer address is always the caller.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Argon2id cost parameters for PIN credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct PinConfig {
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

/// Attempts allowed per caller per window, by bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_pin_verify_limit")]
    pub pin_verify: u32,
    #[serde(default = "default_transfer_limit")]
    pub transfer: u32,
    #[serde(default = "default_general_limit")]
    pub general: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            pin_verify: default_pin_verify_limit(),
            transfer: default_transfer_limit(),
            general: default_general_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Load `config.toml` from the working directory, falling back to defaults
/// when it is absent.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = Path::new(DEFAULT_CONFIG_PATH);
    if !path.exists() {
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }
    load_config_from(path)
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config = parse_config(&config_str)?;

    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

pub fn parse_config(config_str: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Validate critical values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.is_empty() {
            return Err(ConfigError::Invalid("database.path must be set".to_string()));
        }

        argon2::Params::new(
            self.pin.memory_kib,
            self.pin.iterations,
            self.pin.parallelism,
            None,
        )
        .map_err(|e| ConfigError::Invalid(format!("pin: {}", e)))?;

        let limits = &self.rate_limit;
        if limits.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("pin_verify", limits.pin_verify),
            ("transfer", limits.transfer),
            ("general", limits.general),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limit.{} must be greater than zero",
                    name
                )));
            }
        }

        if self.engine.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "engine.lock_timeout_ms must be greater than zero".to_string(),
            ));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                other
            ))),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "./data/wallets.db".to_string()
}

// OWASP baseline for Argon2id.
fn default_memory_kib() -> u32 {
    19_456
}

fn default_iterations() -> u32 {
    2
}

fn default_parallelism() -> u32 {
    1
}

fn default_window_secs() -> u64 {
    60
}

fn default_pin_verify_limit() -> u32 {
    5
}

fn default_transfer_limit() -> u32 {
    10
}

fn default_general_limit() -> u32 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_lock_timeout_ms() -> u64 {
    2_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
