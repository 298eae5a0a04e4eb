use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use matrix_config::{ConfigManager, LogLevel};
use matrix_gateway::{static_json, Gateway, GatewayConfig, ShutdownHandle};
use matrix_observability::LogManager;
use tracing::{info, warn};

mod static_config;

#[derive(Parser, Debug, Clone)]
#[command(name = "matrix-server")]
#[command(about = "Matrix TLS WebSocket gateway")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, env = "MATRIX_CONFIG", default_value = "~/.matrix/config.json")]
    config: String,

    /// Bind host (overrides config)
    #[arg(long, env = "MATRIX_HOST")]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long, env = "MATRIX_PORT")]
    port: Option<u16>,

    /// PEM certificate chain (overrides config)
    #[arg(long, env = "MATRIX_TLS_CERT")]
    cert: Option<PathBuf>,

    /// PEM private key (overrides config)
    #[arg(long, env = "MATRIX_TLS_KEY")]
    key: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(long, env = "MATRIX_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Emit JSON log lines
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        matrix_config::expand_tilde(&self.config).unwrap_or_else(|| PathBuf::from(&self.config))
    }

    /// Apply command-line overrides on top of the file configuration.
    fn apply_overrides(&self, manager: &mut ConfigManager) -> Result<()> {
        manager
            .update(|config| {
                if let Some(host) = &self.host {
                    config.server.host = host.clone();
                }
                if let Some(port) = self.port {
                    config.server.port = port;
                }
                if let Some(cert) = &self.cert {
                    config.tls.cert_path = cert.clone();
                }
                if let Some(key) = &self.key {
                    config.tls.key_path = key.clone();
                }
                if let Some(level) = self.log_level {
                    config.logging.level = level;
                }
                if self.json_logs {
                    config.logging.json_format = true;
                }
            })
            .context("Invalid command-line override")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config_path();
    let mut config_manager = ConfigManager::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    cli.apply_overrides(&mut config_manager)?;
    let loaded_from = config_manager.path().to_path_buf();
    let config = config_manager.into_config();

    let _log_manager = LogManager::init(&matrix_observability::Config::from(&config))
        .context("Failed to initialize logging")?;

    info!("Starting Matrix gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("  Config: {:?}", loaded_from);
    info!("  Upgrade path: {}", config.gateway.upgrade_path);
    info!("  Probe interval: {}ms", config.gateway.probe_interval_ms);

    let mut gateway = Gateway::new(GatewayConfig::from(&config));
    if let Some(path) = &config.static_config.path {
        if let Some(document) = static_config::load(path).await? {
            gateway = gateway.with_routes(static_json(&config.static_config.route, document));
        }
    }

    let gateway = gateway.bind().await.context("Failed to start gateway")?;
    tokio::spawn(shutdown_on_signal(gateway.shutdown_handle()));

    gateway.run().await.context("Gateway stopped with an error")?;
    info!("Matrix gateway exited");
    Ok(())
}

/// Trigger shutdown on Ctrl+C or SIGTERM
async fn shutdown_on_signal(handle: ShutdownHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    handle.shutdown();
}
