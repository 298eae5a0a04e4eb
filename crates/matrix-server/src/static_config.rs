//! Static JSON document served next to the gateway

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

/// Read the document at `path`.
///
/// A missing file disables the endpoint (`Ok(None)`); a file that exists but
/// is not valid JSON is an error.
pub async fn load(path: &Path) -> Result<Option<Value>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Static config {:?} not found, endpoint disabled", path);
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read static config {:?}", path))
        }
    };

    let value = serde_json::from_str(&content)
        .with_context(|| format!("Static config {:?} is not valid JSON", path))?;
    info!("Loaded static config from {:?}", path);
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("matrix.config.json");
        std::fs::write(&path, r#"{"servers": ["a", "b"], "debug": false}"#).unwrap();

        let value = load(&path).await.unwrap();
        assert_eq!(value, Some(json!({ "servers": ["a", "b"], "debug": false })));
    }

    #[tokio::test]
    async fn test_missing_file_disables_endpoint() {
        let dir = TempDir::new().unwrap();
        let value = load(&dir.path().join("absent.json")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(load(&path).await.is_err());
    }
}
