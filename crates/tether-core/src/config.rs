//! Connection and session configuration.
//!
//! A process describes every store it talks to as a named [`StoreConfig`]
//! and the session defaults as [`SessionSettings`]. Both load from TOML, and
//! session settings can be overridden from the environment.
//!
//! ```toml
//! [session]
//! ttl-secs = 30
//!
//! [clients.default]
//! endpoints = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
//! dial-timeout = 5
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_CLIENT_NAME;

/// Default values for configuration
mod defaults {
    use crate::constants;

    pub fn session_ttl_secs() -> u32 {
        constants::DEFAULT_SESSION_TTL_SECS
    }
    pub fn request_timeout_ms() -> u64 {
        constants::DEFAULT_REQUEST_TIMEOUT_MS
    }
    pub fn keepalive_retry_ms() -> u64 {
        constants::DEFAULT_KEEPALIVE_RETRY_MS
    }
    pub fn dial_timeout_secs() -> u64 {
        constants::DEFAULT_DIAL_TIMEOUT_SECS
    }
}

/// Environment variable overriding [`SessionSettings::ttl_secs`].
pub const ENV_SESSION_TTL_SECS: &str = "TETHER_SESSION_TTL_SECS";
/// Environment variable overriding [`SessionSettings::request_timeout_ms`].
pub const ENV_REQUEST_TIMEOUT_MS: &str = "TETHER_REQUEST_TIMEOUT_MS";

/// Connection settings for one store cluster.
///
/// Durations are whole seconds, matching the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StoreConfig {
    /// Client URLs of the cluster members.
    pub endpoints: Vec<String>,
    /// Interval for refreshing the endpoint list from cluster membership.
    /// 0 disables auto-sync.
    pub auto_sync_interval: u64,
    /// Timeout for establishing a connection.
    pub dial_timeout: u64,
    /// Time after which the client pings the server to see if the transport is alive.
    pub dial_keep_alive_time: u64,
    /// Time the client waits for a keep-alive probe response before closing the connection.
    pub dial_keep_alive_timeout: u64,
    /// Username for authentication.
    pub username: String,
    /// Password for authentication.
    pub password: String,
    /// Refuse to create a client against an outdated cluster.
    pub reject_old_cluster: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            auto_sync_interval: 0,
            dial_timeout: defaults::dial_timeout_secs(),
            dial_keep_alive_time: 0,
            dial_keep_alive_timeout: 0,
            username: String::new(),
            password: String::new(),
            reject_old_cluster: false,
        }
    }
}

impl StoreConfig {
    /// `None` when auto-sync is disabled.
    pub fn auto_sync_interval(&self) -> Option<Duration> {
        (self.auto_sync_interval > 0).then(|| Duration::from_secs(self.auto_sync_interval))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn dial_keep_alive_time(&self) -> Duration {
        Duration::from_secs(self.dial_keep_alive_time)
    }

    pub fn dial_keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_keep_alive_timeout)
    }

    /// Credentials, present only when a username is configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        (!self.username.is_empty()).then_some((self.username.as_str(), self.password.as_str()))
    }

    /// Check this entry, using `name` to point at the offending client.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: format!("clients.{name}.endpoints"),
                hint: "at least one endpoint URL is required".to_string(),
            });
        }
        if let Some(empty) = self.endpoints.iter().position(|e| e.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: format!("clients.{name}.endpoints[{empty}]"),
                value: String::new(),
                reason: "endpoint must not be blank".to_string(),
            });
        }
        if !self.password.is_empty() && self.username.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: format!("clients.{name}.password"),
                value: "<redacted>".to_string(),
                reason: "password is set without a username".to_string(),
            });
        }
        Ok(())
    }
}

/// Defaults applied to every session opened through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionSettings {
    /// Lease TTL in seconds.
    #[serde(default = "defaults::session_ttl_secs")]
    pub ttl_secs: u32,
    /// Upper bound on a single lease request.
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Delay between keepalive retries after a failed send.
    #[serde(default = "defaults::keepalive_retry_ms")]
    pub keepalive_retry_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::session_ttl_secs(),
            request_timeout_ms: defaults::request_timeout_ms(),
            keepalive_retry_ms: defaults::keepalive_retry_ms(),
        }
    }
}

impl SessionSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive_retry(&self) -> Duration {
        Duration::from_millis(self.keepalive_retry_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs < crate::constants::MIN_SESSION_TTL_SECS {
            return Err(ConfigError::InvalidValue {
                key: "session.ttl-secs".to_string(),
                value: self.ttl_secs.to_string(),
                reason: format!("must be at least {}", crate::constants::MIN_SESSION_TTL_SECS),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "session.request-timeout-ms".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration: session defaults plus named store clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub clients: BTreeMap<String, StoreConfig>,
}

impl CoordinationConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::InvalidValue {
            key: "config".to_string(),
            value: String::new(),
            reason: format!("Failed to parse TOML: {}", e),
        })
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::InvalidValue {
            key: "config_file".to_string(),
            value: path.as_ref().display().to_string(),
            reason: format!("Failed to read file: {}", e),
        })?;

        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::InvalidValue { reason, .. } => ConfigError::InvalidValue {
                key: "config_file".to_string(),
                value: path.as_ref().display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Load from `path`, apply environment overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        tracing::info!("Loading coordination configuration from file: {}", path.as_ref().display());
        let mut config = Self::from_toml_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override session settings from variables returned by `lookup`.
    ///
    /// Taking the lookup as a closure keeps tests independent of the process
    /// environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(ENV_SESSION_TTL_SECS) {
            self.session.ttl_secs = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: ENV_SESSION_TTL_SECS.to_string(),
                value: raw.clone(),
                reason: format!("must be a whole number of seconds: {}", e),
            })?;
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            self.session.request_timeout_ms = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: ENV_REQUEST_TIMEOUT_MS.to_string(),
                value: raw.clone(),
                reason: format!("must be a whole number of milliseconds: {}", e),
            })?;
        }
        Ok(())
    }

    /// Validate session settings and every client entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        for (name, client) in &self.clients {
            client.validate(name)?;
        }
        Ok(())
    }

    /// Config for `name`, or for the default client when `name` is `None`.
    pub fn client(&self, name: Option<&str>) -> Option<&StoreConfig> {
        self.clients.get(name.unwrap_or(DEFAULT_CLIENT_NAME))
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value is invalid
    InvalidValue { key: String, value: String, reason: String },
    /// A required configuration value is missing
    MissingRequired { key: String, hint: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "Invalid configuration for {}: '{}' ({})", key, value, reason)
            }
            ConfigError::MissingRequired { key, hint } => {
                write!(f, "Missing required configuration: {} ({})", key, hint)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
