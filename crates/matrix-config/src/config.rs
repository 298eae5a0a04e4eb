use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub static_config: StaticConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            gateway: GatewayConfig::default(),
            static_config: StaticConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// The `host:port` pair the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Listener address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

/// Certificate and private key, both PEM encoded. Read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("server.crt"),
            key_path: PathBuf::from("server.key"),
        }
    }
}

/// Upgrade path and liveness settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// Request path that triggers the WebSocket upgrade
    #[serde(default = "default_upgrade_path")]
    pub upgrade_path: String,
    /// Liveness probe period in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Re-admit a peer as soon as its probe is dispatched
    #[serde(default)]
    pub optimistic_admission: bool,
    /// Treat any inbound frame, not only a pong, as proof of liveness
    #[serde(default)]
    pub any_frame_counts: bool,
}

fn default_upgrade_path() -> String {
    "/ws".to_string()
}

fn default_probe_interval_ms() -> u64 {
    1000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upgrade_path: default_upgrade_path(),
            probe_interval_ms: default_probe_interval_ms(),
            optimistic_admission: false,
            any_frame_counts: false,
        }
    }
}

/// Read-only JSON document exposed over plain HTTP
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticConfig {
    /// File to serve; `None` disables the endpoint
    pub path: Option<PathBuf>,
    #[serde(default = "default_static_route")]
    pub route: String,
}

fn default_static_route() -> String {
    "/api/config".to_string()
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("matrix.config.json")),
            route: default_static_route(),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub json_format: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
