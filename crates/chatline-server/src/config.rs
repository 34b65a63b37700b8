//! Server configuration loading from file and environment variables.

use chatline_db::{DbRuntimeSettings, Synchronous};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bearer token verification settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Real-time connection settings.
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Cross-origin settings for browser clients.
    #[serde(default)]
    pub cors: CorsConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long a request waits for a pooled connection, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite `synchronous` level: "off", "normal" or "full".
    #[serde(default = "default_synchronous")]
    pub synchronous: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "chatline_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Access token verification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret shared with the token issuer.
    #[serde(default)]
    pub access_token_secret: String,
}

/// Per-connection settings for the real-time socket.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Capacity of each connection's outbound queue.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// CORS configuration. An empty list allows any origin without credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "chatline.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

fn default_synchronous() -> String {
    Synchronous::default().to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_outbound_buffer() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            synchronous: default_synchronous(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A setting has a value the server cannot run with.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl DatabaseConfig {
    /// Pool settings for `chatline_db::create_pool`.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` for an unknown `synchronous` level or a zero
    /// pool size.
    pub fn runtime_settings(&self) -> Result<DbRuntimeSettings, ConfigError> {
        if self.pool_max_size == 0 {
            return Err(ConfigError::Invalid(
                "database.pool_max_size must be greater than zero".to_string(),
            ));
        }
        let synchronous = self
            .synchronous
            .parse::<Synchronous>()
            .map_err(|e| ConfigError::Invalid(format!("database.synchronous: {e}")))?;
        Ok(DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
            connection_timeout_ms: self.connection_timeout_ms,
            synchronous,
        })
    }
}

impl Config {
    /// Checks settings that have no usable default.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when the access token secret is empty,
    /// the outbound buffer is zero or the database settings are unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.access_token_secret.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "auth.access_token_secret must be set".to_string(),
            ));
        }
        if self.realtime.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "realtime.outbound_buffer must be greater than zero".to_string(),
            ));
        }
        self.database.runtime_settings().map(|_| ())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CHATLINE_HOST` overrides `server.host`
/// - `CHATLINE_PORT` overrides `server.port`
/// - `CHATLINE_DB_PATH` overrides `database.path`
/// - `CHATLINE_DB_SYNCHRONOUS` overrides `database.synchronous`
/// - `CHATLINE_LOG_LEVEL` overrides `logging.level`
/// - `CHATLINE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `CHATLINE_ACCESS_TOKEN_SECRET` overrides `auth.access_token_secret`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("CHATLINE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("CHATLINE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("CHATLINE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("CHATLINE_DB_SYNCHRONOUS") {
        config.database.synchronous = level;
    }
    if let Some(level) = var("CHATLINE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("CHATLINE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(secret) = var("CHATLINE_ACCESS_TOKEN_SECRET") {
        config.auth.access_token_secret = secret;
    }
}
