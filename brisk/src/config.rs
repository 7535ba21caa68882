//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: BRISK_, sections separated by `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/brisk/{service_name}/config.toml
//! 4. System directory: /etc/brisk/{service_name}/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener and protocol configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Broadcast feed configuration
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Work dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Redis pub/sub bridge (optional)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// NATS pub/sub bridge (optional)
    #[serde(default)]
    pub nats: Option<NatsConfig>,
}

/// Listener and protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name, used in logs
    #[serde(default = "default_name")]
    pub name: String,

    /// Address the listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Whether clients must authenticate with their first message
    #[serde(default)]
    pub auth: AuthMode,

    /// Wire encoding of application messages
    #[serde(default)]
    pub encoding: Encoding,

    /// Reply with an `ack` for every accepted message
    #[serde(default)]
    pub send_acknowledgement: bool,

    /// Upper bound on a single authentication callback
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Group joined when the client does not ask for one
    #[serde(default = "default_group")]
    pub default_group: String,
}

impl ServerConfig {
    /// Get the authentication timeout as a Duration
    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Parse the bind address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_address.parse().map_err(|e| {
            Error::InvalidConfig(format!("bind_address '{}': {}", self.bind_address, e))
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind_address: default_bind_address(),
            auth: AuthMode::default(),
            encoding: Encoding::default(),
            send_acknowledgement: false,
            auth_timeout_secs: default_auth_timeout(),
            default_group: default_group(),
        }
    }
}

/// Authentication mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Every connection is treated as authenticated
    #[default]
    None,
    /// The first message of a connection goes through the authenticator
    Enabled,
}

/// Message encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// JSON text frames
    #[default]
    Json,
    /// MessagePack (reserved)
    MsgPack,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::MsgPack => write!(f, "msg_pack"),
        }
    }
}

/// What a full group feed does to the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastMode {
    /// Wait for capacity
    #[default]
    Block,
    /// Fail with `GroupError::FeedFull`
    Reject,
}

/// Broadcast feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Capacity of each group's broadcast feed
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,

    /// Capacity of each client's outbound feed
    #[serde(default = "default_client_feed_capacity")]
    pub client_feed_capacity: usize,

    /// Behaviour when a group feed is full
    #[serde(default)]
    pub mode: BroadcastMode,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            feed_capacity: default_feed_capacity(),
            client_feed_capacity: default_client_feed_capacity(),
            mode: BroadcastMode::default(),
        }
    }
}

/// Work dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of work items executing at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of work items waiting for a worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long shutdown waits for workers to finish
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl DispatchConfig {
    /// Get the shutdown timeout as a Duration
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `brisk=debug,info`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Include source file and line in every event
    #[serde(default)]
    pub report_caller: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            report_caller: false,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Connection attempts after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts, doubled on every retry
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// Client name reported to the server
    #[serde(default)]
    pub name: Option<String>,

    /// Connection attempts after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts, doubled on every retry
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

// Default value functions

fn default_name() -> String {
    "brisk".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

const fn default_auth_timeout() -> u64 {
    10
}

fn default_group() -> String {
    "default".to_string()
}

const fn default_feed_capacity() -> usize {
    1000
}

const fn default_client_feed_capacity() -> usize {
    64
}

const fn default_concurrency() -> usize {
    256
}

const fn default_queue_capacity() -> usize {
    10_000
}

const fn default_shutdown_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_retry_delay() -> u64 {
    2
}

impl Config {
    /// Load configuration from all sources
    ///
    /// The service name is inferred from the binary name.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "brisk".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first so later files override earlier ones
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("BRISK_").split("__"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// Bypasses the search path. Environment variables still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BRISK_").split("__"))
            .extract()?;

        Ok(config)
    }

    /// Paths searched for a config file, highest priority first
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("brisk");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/brisk").join(service_name).join("config.toml"));

        paths
    }

    /// Where the config file for a service should live
    ///
    /// Returns: ~/.config/brisk/{service_name}/config.toml
    pub fn recommended_path(service_name: &str) -> PathBuf {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("brisk");
        let config_file_path = Path::new(service_name).join("config.toml");

        xdg_dirs
            .place_config_file(&config_file_path)
            .unwrap_or_else(|_| {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| String::from("~")))
                    .join(".config/brisk")
                    .join(service_name)
                    .join("config.toml")
            })
    }

    /// Reject values the server cannot run with
    ///
    /// Codec and authenticator checks need the builder's collaborators and
    /// happen in `ServerBuilder::build`.
    pub fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;

        if self.server.default_group.is_empty() {
            return Err(Error::InvalidConfig("default_group must not be empty".into()));
        }
        if self.broadcast.feed_capacity == 0 {
            return Err(Error::InvalidConfig("broadcast.feed_capacity must be positive".into()));
        }
        if self.broadcast.client_feed_capacity == 0 {
            return Err(Error::InvalidConfig(
                "broadcast.client_feed_capacity must be positive".into(),
            ));
        }
        if self.dispatch.concurrency == 0 {
            return Err(Error::InvalidConfig("dispatch.concurrency must be positive".into()));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(Error::InvalidConfig("dispatch.queue_capacity must be positive".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.server.auth, AuthMode::None);
        assert_eq!(config.server.encoding, Encoding::Json);
        assert!(!config.server.send_acknowledgement);
        assert_eq!(config.server.default_group, "default");
        assert_eq!(config.broadcast.feed_capacity, 1000);
        assert_eq!(config.broadcast.mode, BroadcastMode::Block);
        assert_eq!(config.logging.level, "info");
        assert!(config.redis.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind_address = "127.0.0.1:9001"
auth = "enabled"
send_acknowledgement = true

[broadcast]
feed_capacity = 16
mode = "reject"

[dispatch]
concurrency = 4
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:9001");
        assert_eq!(config.server.auth, AuthMode::Enabled);
        assert!(config.server.send_acknowledgement);
        assert_eq!(config.broadcast.feed_capacity, 16);
        assert_eq!(config.broadcast.mode, BroadcastMode::Reject);
        assert_eq!(config.dispatch.concurrency, 4);
        // untouched sections keep their defaults
        assert_eq!(config.dispatch.queue_capacity, 10_000);
        assert_eq!(config.server.default_group, "default");
    }

    #[test]
    fn test_msg_pack_encoding_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nencoding = \"msg_pack\"").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.server.encoding, Encoding::MsgPack);
    }

    #[test]
    fn test_validate_rejects_zero_capacities() {
        let mut config = Config::default();
        config.dispatch.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.broadcast.feed_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_bind_address() {
        let mut config = Config::default();
        config.server.bind_address = "not-an-address".into();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
