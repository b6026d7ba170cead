//! Configuration management.
//!
//! adflow configuration can come from:
//! - Built-in defaults
//! - Config file (~/.config/adflow/config.toml)
//! - Environment variables (ADFLOW_*)
//!
//! Later sources override earlier ones.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{ExecutorConfig, QuotaConfig};
use crate::error::{Error, Result};
use crate::workflow::{OrchestratorConfig, PersistenceMode};

/// adflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorSection,

    #[serde(default)]
    pub quota: QuotaSection,

    #[serde(default)]
    pub executor: ExecutorSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Where execution context lives
    #[serde(default)]
    pub persistence_mode: PersistenceMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_context_ttl")]
    pub context_ttl_seconds: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,

    #[serde(default = "default_max_error_length")]
    pub max_error_length: usize,

    /// Delay between attempts of a failing step
    #[serde(default = "default_step_retry_delay_ms")]
    pub step_retry_delay_ms: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            context_ttl_seconds: default_context_ttl(),
            cleanup_interval_seconds: default_cleanup_interval(),
            max_context_bytes: default_max_context_bytes(),
            max_error_length: default_max_error_length(),
            step_retry_delay_ms: default_step_retry_delay_ms(),
        }
    }
}

fn default_context_ttl() -> u64 {
    24 * 60 * 60
}

fn default_cleanup_interval() -> u64 {
    60 * 60
}

fn default_max_context_bytes() -> usize {
    1024 * 1024
}

fn default_max_error_length() -> usize {
    2000
}

fn default_step_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSection {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,

    #[serde(default = "default_per_minute_limit")]
    pub per_minute_limit: u64,

    /// JSON file the counters are persisted to
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            per_minute_limit: default_per_minute_limit(),
            state_path: None,
        }
    }
}

fn default_daily_limit() -> u64 {
    15_000
}

fn default_per_minute_limit() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_true")]
    pub fallback_enabled: bool,

    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,

    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            default_max_retries: default_max_retries(),
            fallback_enabled: true,
            min_output_bytes: default_min_output_bytes(),
            concurrency_limit: default_concurrency_limit(),
            output_dir: None,
        }
    }
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_min_output_bytes() -> u64 {
    crate::engine::MIN_OUTPUT_BYTES
}

fn default_concurrency_limit() -> usize {
    4
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Config(format!("Unknown log format: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from the default config file and environment.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from an explicit file, then apply the environment.
    ///
    /// Unlike [`Config::load`], a missing or malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::default();
        config.apply_partial(Self::parse_partial(&content)?);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("adflow"))
            .unwrap_or_else(|| PathBuf::from(".adflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("adflow"))
            .unwrap_or_else(|| PathBuf::from(".adflow"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("adflow.db"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.executor
            .output_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("output"))
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_timeout: Duration::from_secs(self.executor.default_timeout_seconds),
            default_max_retries: self.executor.default_max_retries,
            fallback_enabled: self.executor.fallback_enabled,
            min_output_bytes: self.executor.min_output_bytes,
            concurrency_limit: self.executor.concurrency_limit,
            ..ExecutorConfig::default()
        }
    }

    pub fn quota_config(&self) -> QuotaConfig {
        QuotaConfig {
            daily_limit: self.quota.daily_limit,
            per_minute_limit: self.quota.per_minute_limit,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            persistence_mode: self.storage.persistence_mode,
            context_ttl: Duration::from_secs(self.orchestrator.context_ttl_seconds),
            cleanup_interval: Duration::from_secs(self.orchestrator.cleanup_interval_seconds),
            max_context_bytes: self.orchestrator.max_context_bytes,
            max_error_length: self.orchestrator.max_error_length,
            step_retry_delay: Duration::from_millis(self.orchestrator.step_retry_delay_ms),
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        if let Some(path) = var("ADFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(mode) = parsed(var("ADFLOW_PERSISTENCE_MODE")) {
            self.storage.persistence_mode = mode;
        }
        if let Some(ttl) = parsed(var("ADFLOW_CONTEXT_TTL_SECONDS")) {
            self.orchestrator.context_ttl_seconds = ttl;
        }
        if let Some(interval) = parsed(var("ADFLOW_CLEANUP_INTERVAL_SECONDS")) {
            self.orchestrator.cleanup_interval_seconds = interval;
        }
        if let Some(bytes) = parsed(var("ADFLOW_MAX_CONTEXT_BYTES")) {
            self.orchestrator.max_context_bytes = bytes;
        }
        if let Some(limit) = parsed(var("ADFLOW_QUOTA_DAILY_LIMIT")) {
            self.quota.daily_limit = limit;
        }
        if let Some(limit) = parsed(var("ADFLOW_QUOTA_PER_MINUTE_LIMIT")) {
            self.quota.per_minute_limit = limit;
        }
        if let Some(path) = var("ADFLOW_QUOTA_STATE_PATH") {
            self.quota.state_path = Some(PathBuf::from(path));
        }
        if let Some(timeout) = parsed(var("ADFLOW_DEFAULT_TIMEOUT_SECONDS")) {
            self.executor.default_timeout_seconds = timeout;
        }
        if let Some(retries) = parsed(var("ADFLOW_DEFAULT_MAX_RETRIES")) {
            self.executor.default_max_retries = retries;
        }
        if let Some(enabled) = parsed(var("ADFLOW_FALLBACK_ENABLED")) {
            self.executor.fallback_enabled = enabled;
        }
        if let Some(dir) = var("ADFLOW_OUTPUT_DIR") {
            self.executor.output_dir = Some(PathBuf::from(dir));
        }
        if let Some(format) = parsed(var("ADFLOW_LOG_FORMAT")) {
            self.logging.format = format;
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        Self::parse_partial(&content).map_err(|_| ())
    }

    fn parse_partial(content: &str) -> Result<PartialConfig> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(orchestrator) = partial.orchestrator {
            self.orchestrator = orchestrator;
        }
        if let Some(quota) = partial.quota {
            self.quota = quota;
        }
        if let Some(executor) = partial.executor {
            self.executor = executor;
        }
        if let Some(logging) = partial.logging {
            self.logging = logging;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    storage: Option<StorageConfig>,
    orchestrator: Option<OrchestratorSection>,
    quota: Option<QuotaSection>,
    executor: Option<ExecutorSection>,
    logging: Option<LoggingConfig>,
}
