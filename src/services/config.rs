//! Service configuration.
//!
//! Layered: built-in defaults, then an optional TOML file, then environment
//! variables. Read-only after startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),
    #[error("failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("validation failed for {field}: {reason}")]
    ValidationError { field: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub sandbox: SandboxConfig,
    pub tools: ToolsConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            storage: StorageConfig::default(),
            sandbox: SandboxConfig::default(),
            tools: ToolsConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Concurrency bound for admitted tasks
    pub max_concurrent_tasks: usize,
    /// Default step budget when a request carries none
    pub default_max_steps: u32,
    /// Seconds the per-task event bus lingers after the terminal event
    pub stream_linger_secs: u64,
    /// Reflector cadence: invoke the model every this many steps
    pub reflection_interval_steps: u32,
    /// Per-call deadline for tool invocations
    pub tool_timeout_secs: u64,
    /// Per-call deadline for backend actions
    pub backend_timeout_secs: u64,
    /// Error instead of warn when screenshots disagree with the declared size
    pub strict_screen_size: bool,
    /// Remove the task workspace directory at task end
    pub cleanup_workspace: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            default_max_steps: 50,
            stream_linger_secs: 5,
            reflection_interval_steps: 5,
            tool_timeout_secs: 120,
            backend_timeout_secs: 30,
            strict_screen_size: false,
            cleanup_workspace: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sql,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sql_connection_string: Option<String>,
    /// Root under which per-task workspaces are created
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            sql_connection_string: None,
            log_dir: PathBuf::from("./logs"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Base URL of the sandbox control API
    pub api_url: Option<String>,
    /// Opaque credential forwarded on every call
    pub api_key: Option<String>,
}

/// Token-bucket parameters for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    /// Bucket capacity (burst size)
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            capacity: 5.0,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Base URL of the external tool service
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    /// Optional per-tool rate limits, keyed by tool name
    pub rate_limits: HashMap<String, RateLimit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// File name for the rolling process log inside `log_dir`; stdout only
    /// when absent
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load defaults, merge the optional TOML file, then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::FileNotFound(p.display().to_string()));
                }
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Recognized environment variables override file and defaults.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("LOG_DIR") {
            if !dir.is_empty() {
                self.storage.log_dir = PathBuf::from(dir);
            }
        }
        if let Ok(n) = std::env::var("TASK_MAX_TASKS") {
            if let Ok(n) = n.parse::<usize>() {
                self.service.max_concurrent_tasks = n;
            }
        }
        if let Ok(backend) = std::env::var("TASK_STORAGE_BACKEND") {
            match backend.to_lowercase().as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "sql" => self.storage.backend = StorageBackend::Sql,
                _ => {}
            }
        }
        if let Ok(conn) = std::env::var("SQL_CONNECTION_STRING") {
            if !conn.is_empty() {
                self.storage.sql_connection_string = Some(conn);
            }
        }
        if let Ok(v) = std::env::var("ENABLE_METRICS") {
            self.metrics.enabled = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(port) = std::env::var("METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }
        if let Ok(url) = std::env::var("SANDBOX_API_URL") {
            if !url.is_empty() {
                self.sandbox.api_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("SANDBOX_API_KEY") {
            if !key.is_empty() {
                self.sandbox.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("TOOLS_API_URL") {
            if !url.is_empty() {
                self.tools.api_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("TOOLS_API_KEY") {
            if !key.is_empty() {
                self.tools.api_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.max_concurrent_tasks == 0 {
            return Err(ConfigError::ValidationError {
                field: "service.max_concurrent_tasks".into(),
                reason: "must be >= 1".into(),
            });
        }
        if self.service.default_max_steps == 0 {
            return Err(ConfigError::ValidationError {
                field: "service.default_max_steps".into(),
                reason: "must be >= 1".into(),
            });
        }
        if self.storage.backend == StorageBackend::Sql
            && self.storage.sql_connection_string.is_none()
        {
            return Err(ConfigError::ValidationError {
                field: "storage.sql_connection_string".into(),
                reason: "required when storage.backend = \"sql\"".into(),
            });
        }
        Ok(())
    }

    /// Linger window clamped to the supported range.
    pub fn linger_secs(&self) -> u64 {
        self.service.stream_linger_secs.clamp(1, 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.service.max_concurrent_tasks, 5);
        assert_eq!(config.service.default_max_steps, 50);
        assert_eq!(config.linger_secs(), 5);
    }

    #[test]
    fn test_sql_backend_requires_connection_string() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Sql;
        assert!(config.validate().is_err());
        config.storage.sql_connection_string = Some("sqlite://tasks.db".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_linger_is_clamped() {
        let mut config = Config::default();
        config.service.stream_linger_secs = 0;
        assert_eq!(config.linger_secs(), 1);
        config.service.stream_linger_secs = 120;
        assert_eq!(config.linger_secs(), 30);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [service]
            max_concurrent_tasks = 2

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.service.max_concurrent_tasks, 2);
        assert_eq!(config.service.default_max_steps, 50);
        assert_eq!(config.metrics.enabled, false);
    }
}
