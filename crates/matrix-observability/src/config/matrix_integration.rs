//! Conversion from the gateway's file configuration

use super::{Config, LoggingConfig};

impl From<&matrix_config::LoggingConfig> for LoggingConfig {
    fn from(config: &matrix_config::LoggingConfig) -> Self {
        Self {
            level: config.level.as_str().to_string(),
            json_format: config.json_format,
            // no escape codes inside JSON lines
            ansi_colors: !config.json_format,
            ..Self::default()
        }
    }
}

impl From<&matrix_config::Config> for Config {
    fn from(config: &matrix_config::Config) -> Self {
        Self {
            logging: LoggingConfig::from(&config.logging),
            ..Self::default()
        }
    }
}
