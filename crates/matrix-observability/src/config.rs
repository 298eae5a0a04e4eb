//! Logging configuration

pub mod matrix_integration;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application name, attached to the startup event
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Set the base filter level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    /// Switch between JSON and human-readable output
    pub fn with_json_format(mut self, json: bool) -> Self {
        self.logging.json_format = json;
        self
    }

    /// Add a per-module level directive
    pub fn with_module_level(mut self, module: impl Into<String>, level: impl Into<String>) -> Self {
        self.logging.module_levels.insert(module.into(), level.into());
        self
    }
}

/// Subscriber settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level or `EnvFilter` expression (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of plain text
    #[serde(default)]
    pub json_format: bool,

    /// Per-module level overrides
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// ANSI colours in plain-text output
    #[serde(default = "default_true")]
    pub ansi_colors: bool,

    /// Include the event target
    #[serde(default = "default_true")]
    pub include_target: bool,

    /// Include source line numbers
    #[serde(default)]
    pub include_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            module_levels: HashMap::new(),
            ansi_colors: true,
            include_target: true,
            include_line_number: false,
        }
    }
}

fn default_app_name() -> String {
    "matrix".to_string()
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_true() -> bool {
    true
}
