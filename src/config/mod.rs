// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a file (YAML or JSON)
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: Config = if path.extension().and_then(|s| s.to_str()) == Some("yaml")
        || path.extension().and_then(|s| s.to_str()) == Some("yml") {
        serde_yaml::from_str(&contents).context("Failed to parse YAML config")?
    } else {
        serde_json::from_str(&contents).context("Failed to parse JSON config")?
    };

    config.validate()?;
    Ok(config)
}

/// Parse and validate a JSON configuration document.
pub fn load_from_str(contents: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(contents).context("Failed to parse JSON config")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_str() {
        let config = load_from_str(
            r#"{"virtual_server":[{"name":"web","address":"127.0.0.1:8083",
                "pool":[{"address":"127.0.0.1:9001","weight":1},{"address":"127.0.0.1:9002"}]}]}"#,
        )
        .unwrap();

        assert!(config.controller.is_none());
        let vs = &config.virtual_servers[0];
        assert_eq!(vs.name, "web");
        assert_eq!(vs.protocol, "");
        assert!(!vs.retry);
        assert_eq!(vs.pool[1].weight, 1);
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let err = load_from_str(
            r#"{"virtual_server":[{"name":"web","address":":80"},{"name":"web","address":":81"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate virtual server name"));
    }

    #[test]
    fn test_rejects_zero_weight_and_duplicate_peer() {
        let err = load_from_str(
            r#"{"virtual_server":[{"name":"web","address":":80","pool":[{"address":"a:1","weight":0}]}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("zero weight"));

        let err = load_from_str(
            r#"{"virtual_server":[{"name":"web","address":":80","pool":[{"address":"a:1"},{"address":"a:1"}]}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate peer"));
    }

    #[test]
    fn test_rejects_zero_max_fails() {
        let err = load_from_str(
            r#"{"virtual_server":[{"name":"web","address":":80","max_fails":0}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_fails must be at least 1"));

        let config = load_from_str(
            r#"{"virtual_server":[{"name":"web","address":":80","max_fails":1,"max_body_size":1024}]}"#,
        )
        .unwrap();
        assert_eq!(config.virtual_servers[0].max_fails, Some(1));
        assert_eq!(config.virtual_servers[0].max_body_size, Some(1024));
    }

    #[test]
    fn test_rejects_empty_controller_address() {
        let err = load_from_str(r#"{"controller":{"address":""}}"#).unwrap_err();
        assert!(err.to_string().contains("controller address"));
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "controller:\n  address: 127.0.0.1:6587\n  auth:\n    username: admin\n    password: secret\n\
             virtual_server:\n  - name: web\n    address: 127.0.0.1:8080\n    retry: true\n    fail_timeout_secs: 3\n    pool:\n      - address: 127.0.0.1:9000\n        weight: 2\n"
        )
        .unwrap();

        let config = load_config(file.path()).await.unwrap();
        let controller = config.controller.unwrap();
        assert_eq!(controller.address, "127.0.0.1:6587");
        assert_eq!(controller.auth.unwrap().username, "admin");

        let vs = &config.virtual_servers[0];
        assert!(vs.retry);
        assert_eq!(vs.fail_timeout(), Some(std::time::Duration::from_secs(3)));
        assert_eq!(vs.pool[0].weight, 2);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_config("/nonexistent/golb.json").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
