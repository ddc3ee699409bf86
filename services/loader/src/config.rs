//! Configuration management for the progressive loader.
//!
//! This module handles loading and validating configuration from
//! configuration files and environment variables.

use crate::options::RetrieveOptions;
use crate::stages::RetrieveConfiguration;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

/// Environment variable prefix, e.g. `LOADER__HTTP__MAX_RETRIES`
pub const ENV_PREFIX: &str = "LOADER";

/// Main configuration for the loader service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoaderConfig {
    /// HTTP client configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Retrieval stages
    #[serde(default)]
    pub retrieve: RetrieveConfiguration,

    /// Stage options, layered over the built-in table
    #[serde(default)]
    pub retrieve_options: RetrieveOptions,
}

/// HTTP client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Retries of transient transport failures (0 disables retry)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between retries in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Frames fetched concurrently within one stage
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// `Accept` header when the stage options do not override it
    #[serde(default = "default_media_type")]
    pub default_media_type: String,

    /// Custom User-Agent header
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Authentication
    #[serde(default)]
    pub auth: Option<HttpAuthConfig>,
}

/// Authentication configuration for HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HttpAuthConfig {
    /// Bearer token authentication
    Bearer { token: String },
    /// Custom header-based authentication, e.g. `X-API-Key`
    CustomHeader { name: String, value: String },
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Port for the Prometheus scrape listener
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_request_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    2000
}
fn default_max_concurrent_requests() -> usize {
    6
}
fn default_media_type() -> String {
    "multipart/related; type=application/octet-stream; transfer-syntax=*".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
            default_media_type: default_media_type(),
            user_agent: None,
            auth: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl LoaderConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with LOADER__)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. LOADER__HTTP__MAX_RETRIES
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// The built-in options table with configured overrides applied.
    pub fn effective_options(&self) -> RetrieveOptions {
        let mut options = RetrieveOptions::builtin();
        options.merge(self.retrieve_options.clone());
        options
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.http.request_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "http.request_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.http.max_concurrent_requests == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "http.max_concurrent_requests".to_string(),
                message: "Concurrency must be greater than 0".to_string(),
            });
        }

        if self.http.retry_max_delay_ms < self.http.retry_base_delay_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "http.retry_max_delay_ms".to_string(),
                message: "Maximum delay must not be below the base delay".to_string(),
            });
        }

        match &self.http.auth {
            Some(HttpAuthConfig::Bearer { token }) if token.is_empty() => {
                return Err(ConfigValidationError::MissingField(
                    "http.auth.token".to_string(),
                ));
            }
            Some(HttpAuthConfig::CustomHeader { name, .. }) if name.is_empty() => {
                return Err(ConfigValidationError::MissingField(
                    "http.auth.name".to_string(),
                ));
            }
            _ => {}
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::InvalidValue {
                field: "logging.format".to_string(),
                message: "Format must be json or pretty".to_string(),
            });
        }

        if self.retrieve.stages.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "retrieve.stages".to_string(),
            ));
        }

        if self.retrieve.stages.iter().any(|stage| stage.id.is_empty()) {
            return Err(ConfigValidationError::InvalidValue {
                field: "retrieve.stages.id".to_string(),
                message: "Stage ids must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

impl HttpConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get connection timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get base retry delay as Duration.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Get maximum retry delay as Duration.
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
