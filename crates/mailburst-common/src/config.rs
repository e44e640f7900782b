//! Configuration for Mailburst

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Dispatch engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Recipients per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batches with fewer successes than this double the next inter-batch delay
    #[serde(default = "default_low_success_threshold")]
    pub low_success_threshold: usize,

    /// Base delay between batches (seconds)
    #[serde(default = "default_inter_batch_delay_secs")]
    pub inter_batch_delay_secs: f64,

    /// Maximum send attempts per recipient
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry backoff (seconds), doubled per attempt
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: f64,

    /// Deadline for each send attempt (seconds)
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Deadline for connection open and handshake (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Maximum pending jobs per tenant
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Concurrently running jobs allowed per tenant
    #[serde(default = "default_tenant_concurrency")]
    pub tenant_concurrency: usize,

    /// Worker pool size across all tenants
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Domain validation cache time-to-live (hours)
    #[serde(default = "default_validation_cache_ttl_hours")]
    pub validation_cache_ttl_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            low_success_threshold: default_low_success_threshold(),
            inter_batch_delay_secs: default_inter_batch_delay_secs(),
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            queue_depth: default_queue_depth(),
            tenant_concurrency: default_tenant_concurrency(),
            worker_pool_size: default_worker_pool_size(),
            validation_cache_ttl_hours: default_validation_cache_ttl_hours(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_low_success_threshold() -> usize {
    10
}

fn default_inter_batch_delay_secs() -> f64 {
    5.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_secs() -> f64 {
    1.0
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_queue_depth() -> usize {
    1000
}

fn default_tenant_concurrency() -> usize {
    1
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_validation_cache_ttl_hours() -> i64 {
    24
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/mailburst/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}
