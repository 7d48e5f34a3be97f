//! Configuration loader with environment variable expansion

use super::{expand_env_vars, Config, ConfigError};
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Config, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
storage:
  endpoint: "localhost:9000"
  access_key: "key"
  secret_key: "secret"
  bucket: "uploads"
"#;
        let config = ConfigLoader::from_yaml(yaml).unwrap();
        assert_eq!(config.server.address, "0.0.0.0:8080");
        assert_eq!(config.upload.part_size, 10 * 1024 * 1024);
        assert_eq!(config.storage.init_attempts, 3);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_missing_storage_section_fails() {
        let yaml = "server:\n  address: \"127.0.0.1:8080\"\n";
        assert!(matches!(
            ConfigLoader::from_yaml(yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_env_default_in_yaml() {
        let yaml = r#"
storage:
  endpoint: "${UPLOAD_GATEWAY_TEST_UNSET_ENDPOINT:-minio:9000}"
  access_key: "key"
  secret_key: "secret"
  bucket: "uploads"
"#;
        let config = ConfigLoader::from_yaml(yaml).unwrap();
        assert_eq!(config.storage.endpoint, "minio:9000");
    }
}
