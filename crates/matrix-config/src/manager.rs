use crate::config::{Config, ConfigError, ConfigResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::info;

/// Path served by the gateway's built-in health handler
pub const HEALTH_ROUTE: &str = "/health";

/// Loads, validates and holds the startup configuration.
///
/// Settings are fixed for the lifetime of the process; there is no reload.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Load a config file, writing the defaults out first if it does not exist.
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = tokio::fs::read_to_string(path).await?;
            let content = Self::expand_env_vars(&content)?;
            serde_json::from_str(&content)?
        } else {
            info!("Config file not found, creating default config at {:?}", path);
            let default_config = Config::default();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_string_pretty(&default_config)?;
            tokio::fs::write(path, &content).await?;
            default_config
        };

        Self::validate(&config)?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    /// Wrap an in-memory config (tests, embedding)
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self { path, config }
    }

    pub fn get(&self) -> &Config {
        &self.config
    }

    /// Apply command-line overrides, then re-validate.
    pub fn update<F>(&mut self, f: F) -> ConfigResult<()>
    where
        F: FnOnce(&mut Config),
    {
        let mut candidate = self.config.clone();
        f(&mut candidate);
        Self::validate(&candidate)?;
        self.config = candidate;
        Ok(())
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    pub fn validate(config: &Config) -> ConfigResult<()> {
        if config.server.port == 0 {
            return Err(ConfigError::Validation(
                "Server port cannot be 0".to_string(),
            ));
        }

        if config.gateway.probe_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "Gateway probe_interval_ms must be greater than 0".to_string(),
            ));
        }

        if !config.gateway.upgrade_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "Gateway upgrade_path must start with '/': {}",
                config.gateway.upgrade_path
            )));
        }

        if !config.static_config.route.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "Static config route must start with '/': {}",
                config.static_config.route
            )));
        }

        if config.static_config.route == config.gateway.upgrade_path {
            return Err(ConfigError::Validation(
                "Static config route and upgrade path must differ".to_string(),
            ));
        }

        if config.gateway.upgrade_path == HEALTH_ROUTE || config.static_config.route == HEALTH_ROUTE {
            return Err(ConfigError::Validation(format!(
                "{} is reserved for the health endpoint",
                HEALTH_ROUTE
            )));
        }

        if config.tls.cert_path.as_os_str().is_empty() || config.tls.key_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "TLS cert_path and key_path are required".to_string(),
            ));
        }

        Ok(())
    }

    /// Expand `${VAR}` and `${VAR:-default}`
    fn expand_env_vars(content: &str) -> ConfigResult<String> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::Validation(format!("Invalid expansion pattern: {}", e)))?;
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let (Some(full_match), Some(var_expr)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            let var_expr = var_expr.as_str();

            let (var_name, default_value) = match var_expr.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_expr, None),
            };

            let replacement = match std::env::var(var_name) {
                Ok(val) => val,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    None => return Err(ConfigError::EnvVarNotFound(var_name.to_string())),
                },
            };

            result = result.replace(full_match.as_str(), &replacement);
        }

        Ok(result)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let manager = ConfigManager::load(&config_path).await.unwrap();

        assert!(config_path.exists());
        assert_eq!(manager.path(), config_path.as_path());
        assert_eq!(manager.get().server.port, 4000);
        assert_eq!(manager.get().server.host, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_load_existing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"server": {"host": "127.0.0.1", "port": 8443}, "gateway": {"upgrade_path": "/socket", "probe_interval_ms": 250}}"#,
        )
        .unwrap();

        let manager = ConfigManager::load(&config_path).await.unwrap();
        let config = manager.get();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.gateway.upgrade_path, "/socket");
        assert_eq!(config.gateway.probe_interval_ms, 250);
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"gateway": {"probe_interval_ms": 0}}"#).unwrap();

        let err = ConfigManager::load(&config_path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("MATRIX_TEST_CERT", "/etc/matrix/cert.pem");

        let content = r#"{"cert": "${MATRIX_TEST_CERT}", "key": "${MATRIX_TEST_UNSET_KEY:-key.pem}"}"#;
        let expanded = ConfigManager::expand_env_vars(content).unwrap();

        assert!(expanded.contains("/etc/matrix/cert.pem"));
        assert!(expanded.contains("key.pem"));
    }

    #[test]
    fn test_env_var_missing() {
        let content = r#"{"cert": "${MATRIX_TEST_DEFINITELY_UNSET}"}"#;
        let err = ConfigManager::expand_env_vars(content).unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarNotFound(name) if name == "MATRIX_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(ConfigManager::validate(&config).is_err());

        config.server.port = 4000;
        assert!(ConfigManager::validate(&config).is_ok());

        config.gateway.upgrade_path = "ws".to_string();
        assert!(ConfigManager::validate(&config).is_err());

        config.gateway.upgrade_path = HEALTH_ROUTE.to_string();
        assert!(ConfigManager::validate(&config).is_err());
    }

    #[test]
    fn test_update_rejects_invalid_override() {
        let mut manager = ConfigManager::new(Config::default(), PathBuf::from("config.json"));
        assert!(manager.update(|c| c.server.port = 0).is_err());
        assert_eq!(manager.get().server.port, 4000);

        manager.update(|c| c.server.port = 9000).unwrap();
        assert_eq!(manager.get().server.port, 9000);
    }
}
