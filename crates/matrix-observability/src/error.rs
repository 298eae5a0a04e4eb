//! Observability error type

/// Errors raised while configuring logging
#[derive(Debug, thiserror::Error, Clone)]
pub enum ObservabilityError {
    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Config {
        /// What was wrong
        message: String,
    },
}

impl ObservabilityError {
    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Short category label
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
        }
    }
}

/// Result alias
pub type Result<T> = std::result::Result<T, ObservabilityError>;
