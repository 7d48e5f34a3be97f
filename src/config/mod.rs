//! Configuration module for the upload gateway
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Every required value is
//! checked at startup; a broken configuration never reaches a request.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Smallest part size S3 accepts for every part but the last.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

fn env_pattern() -> &'static regex_lite::Regex {
    static PATTERN: OnceLock<regex_lite::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("environment placeholder pattern is valid")
    })
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in env_pattern().captures_iter(s) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = &cap[1];

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

fn has_http_scheme(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn require(value: &str, name: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!("{} is required", name)));
    }
    Ok(())
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.server.address, "server.address")?;

        let storage = &self.storage;
        require(&storage.endpoint, "storage.endpoint")?;
        require(&storage.access_key, "storage.access_key")?;
        require(&storage.secret_key, "storage.secret_key")?;
        require(&storage.bucket, "storage.bucket")?;

        for (name, value) in [
            ("storage.endpoint", &storage.endpoint),
            ("storage.access_key", &storage.access_key),
            ("storage.secret_key", &storage.secret_key),
            ("storage.bucket", &storage.bucket),
        ] {
            if env_pattern().is_match(value) {
                return Err(ConfigError::ValidationError(format!(
                    "{} references an unset environment variable",
                    name
                )));
            }
        }

        if storage.init_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "storage.init_attempts must be at least 1".into(),
            ));
        }

        let upload = &self.upload;
        if upload.max_buffered_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload.max_buffered_size must be greater than zero".into(),
            ));
        }

        if upload.part_size < MIN_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "upload.part_size {} is below the S3 minimum of {} bytes",
                upload.part_size, MIN_PART_SIZE
            )));
        }

        if upload.copy_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload.copy_buffer_size must be greater than zero".into(),
            ));
        }

        if upload.pipe_capacity < upload.copy_buffer_size {
            return Err(ConfigError::ValidationError(format!(
                "upload.pipe_capacity {} must be at least upload.copy_buffer_size {}",
                upload.pipe_capacity, upload.copy_buffer_size
            )));
        }

        if upload.pipe_capacity > u32::MAX as usize {
            return Err(ConfigError::ValidationError(
                "upload.pipe_capacity is too large".into(),
            ));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// S3-compatible object store configuration
///
/// ```yaml
/// storage:
///   endpoint: "${MINIO_ENDPOINT:-localhost:9000}"
///   access_key: "${MINIO_ACCESS_KEY}"
///   secret_key: "${MINIO_SECRET_KEY}"
///   bucket: "uploads"
///   use_ssl: false
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(deserialize_with = "deserialize_with_env")]
    pub endpoint: String,
    #[serde(deserialize_with = "deserialize_with_env")]
    pub access_key: String,
    #[serde(deserialize_with = "deserialize_with_env")]
    pub secret_key: String,
    #[serde(deserialize_with = "deserialize_with_env")]
    pub bucket: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_init_attempts")]
    pub init_attempts: u32,
    #[serde(default = "default_init_retry_delay_ms")]
    pub init_retry_delay_ms: u64,
}

impl StorageConfig {
    /// Endpoint URL with a scheme; bare `host:port` values get one from `use_ssl`.
    pub fn endpoint_url(&self) -> String {
        if has_http_scheme(&self.endpoint) {
            self.endpoint.clone()
        } else if self.use_ssl {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }

    /// Region used for request signing.
    pub fn signing_region(&self) -> &str {
        self.region
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or("us-east-1")
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("use_ssl", &self.use_ssl)
            .field("region", &self.region)
            .field("init_attempts", &self.init_attempts)
            .finish_non_exhaustive()
    }
}

fn default_init_attempts() -> u32 {
    3
}

fn default_init_retry_delay_ms() -> u64 {
    2000
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

/// Upload pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Largest file accepted by the buffered (form) routes.
    #[serde(default = "default_max_buffered_size")]
    pub max_buffered_size: u64,
    /// Form files larger than this are spooled to disk instead of memory.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: usize,
    #[serde(default = "default_part_size")]
    pub part_size: usize,
    /// Bytes allowed in flight between the compressor and the uploader.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_buffered_size: default_max_buffered_size(),
            memory_threshold: default_memory_threshold(),
            part_size: default_part_size(),
            pipe_capacity: default_pipe_capacity(),
            copy_buffer_size: default_copy_buffer_size(),
            spool_dir: None,
        }
    }
}

fn default_max_buffered_size() -> u64 {
    2000 * 1024 * 1024
}

fn default_memory_threshold() -> usize {
    65536 // 64KB
}

fn default_part_size() -> usize {
    10485760 // 10MB
}

fn default_pipe_capacity() -> usize {
    1048576 // 1MB
}

fn default_copy_buffer_size() -> usize {
    81920 // 80KB
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}
