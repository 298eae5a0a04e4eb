pub mod config;
pub mod manager;

pub use config::{
    Config, ConfigError, ConfigResult, GatewayConfig, LogLevel, LoggingConfig, ServerConfig,
    StaticConfig, TlsConfig,
};
pub use manager::{ConfigManager, HEALTH_ROUTE};

use std::path::PathBuf;

/// Matrix configuration directory (`~/.matrix`)
pub fn matrix_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".matrix"))
}

/// Default config file path
pub fn default_config_path() -> Option<PathBuf> {
    matrix_dir().map(|dir| dir.join("config.json"))
}

/// Expand a leading `~/` to the user's home directory
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(path)),
    }
}
