//! Structured logging
//!
//! Installs a `tracing` subscriber built from [`LoggingConfig`].

use std::net::SocketAddr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::error::{ObservabilityError, Result};

/// Owns the process-wide subscriber setup
#[derive(Debug)]
pub struct LogManager {
    config: LoggingConfig,
    /// `false` when another subscriber was already installed
    installed: bool,
}

impl LogManager {
    /// Build the filter and install the global subscriber.
    ///
    /// An invalid level or directive is an error. A subscriber that is
    /// already installed (tests, embedding) is not: the existing one is kept.
    pub fn init(config: &Config) -> Result<Self> {
        let logging = config.logging.clone();
        let filter = build_filter(&logging)?;
        let registry = tracing_subscriber::registry().with(filter);

        let installed = if logging.json_format {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(logging.include_target)
                .with_line_number(logging.include_line_number)
                .with_ansi(false);
            registry.with(layer).try_init().is_ok()
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(logging.include_target)
                .with_line_number(logging.include_line_number)
                .with_ansi(logging.ansi_colors);
            registry.with(layer).try_init().is_ok()
        };

        if installed {
            tracing::info!(
                target: "matrix_observability",
                app = %config.app_name,
                "Log manager initialized with level: {}",
                logging.level
            );
        }

        Ok(Self {
            config: logging,
            installed,
        })
    }

    /// Whether this manager's subscriber is the active global one
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Active settings
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| ObservabilityError::config(format!("Invalid log level: {}", e)))?;

    for (module, level) in &config.module_levels {
        filter = filter.add_directive(
            format!("{}={}", module, level)
                .parse()
                .map_err(|e| ObservabilityError::config(format!("Invalid directive: {}", e)))?,
        );
    }

    Ok(filter)
}

/// Span for one accepted transport connection
pub fn connection_span(remote: SocketAddr) -> tracing::Span {
    tracing::info_span!("connection", remote = %remote)
}

/// Span for one upgraded peer
pub fn peer_span(peer_id: &dyn std::fmt::Display, remote: Option<SocketAddr>) -> tracing::Span {
    match remote {
        Some(addr) => tracing::info_span!("peer", peer_id = %peer_id, remote = %addr),
        None => tracing::info_span!("peer", peer_id = %peer_id),
    }
}
