//! Application configuration for docflow.
//!
//! User config lives at `~/.docflow/docflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DocflowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docflow";

// ---------------------------------------------------------------------------
// Config structs (matching docflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// State machine timing.
    #[serde(default)]
    pub workflow: WorkflowSection,

    /// Retry policy applied to failed steps.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Analysis service settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Checkpoint database and result object store.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[workflow]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSection {
    /// Seconds to wait between status polls.
    #[serde(default = "default_wait_interval")]
    pub wait_interval_secs: u64,

    /// Maximum executions resumed in parallel.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: u32,

    /// How long a runner's claim on an execution outlives its last checkpoint.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            wait_interval_secs: default_wait_interval(),
            max_concurrent_executions: default_max_concurrent(),
            lease_secs: default_lease(),
        }
    }
}

fn default_wait_interval() -> u64 {
    5
}
fn default_max_concurrent() -> u32 {
    4
}
fn default_lease() -> u64 {
    300
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per step, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_retry_interval")]
    pub interval_secs: u64,

    /// Multiplier applied to the delay after each retry.
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,

    /// Upper bound on a single retry delay.
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_secs: default_retry_interval(),
            backoff_rate: default_backoff_rate(),
            max_interval_secs: default_max_interval(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_interval() -> u64 {
    2
}
fn default_backoff_rate() -> f64 {
    2.0
}
fn default_max_interval() -> u64 {
    60
}

/// `[analysis]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Base URL of the analysis API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the API token (never store the token itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Feature set requested for every job.
    #[serde(default = "default_feature_types")]
    pub feature_types: Vec<String>,

    /// HTTP request timeout.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            feature_types: default_feature_types(),
            timeout_secs: default_timeout(),
        }
    }
}

impl AnalysisConfig {
    /// Parse the configured endpoint.
    pub fn endpoint_url(&self) -> Result<Url> {
        Url::parse(&self.endpoint).map_err(|e| {
            DocflowError::config(format!("invalid analysis endpoint '{}': {e}", self.endpoint))
        })
    }
}

fn default_endpoint() -> String {
    "http://localhost:8080".into()
}
fn default_api_key_env() -> String {
    "DOCFLOW_API_KEY".into()
}
fn default_feature_types() -> Vec<String> {
    vec!["TABLES".into(), "FORMS".into()]
}
fn default_timeout() -> u64 {
    30
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the execution checkpoint database.
    #[serde(default = "default_database")]
    pub database: String,

    /// Root directory of the result object store.
    #[serde(default = "default_objects_dir")]
    pub objects_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            objects_dir: default_objects_dir(),
        }
    }
}

fn default_database() -> String {
    "~/.docflow/executions.db".into()
}
fn default_objects_dir() -> String {
    "~/.docflow/objects".into()
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Retry policy for failed steps: exponential backoff without jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub interval: Duration,
    /// Multiplier applied per retry.
    pub backoff_rate: f64,
    /// Cap on a single delay.
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            interval: Duration::ZERO,
            backoff_rate: 1.0,
            max_interval: Duration::ZERO,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let factor = self.backoff_rate.max(1.0).powi(exponent);
        let secs = self.interval.as_secs_f64() * factor;
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            interval: Duration::from_secs(config.interval_secs),
            backoff_rate: config.backoff_rate,
            max_interval: Duration::from_secs(config.max_interval_secs),
        }
    }
}

/// Runtime workflow configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Fixed pause between polls.
    pub wait_interval: Duration,
    /// Parallelism bound when resuming many executions.
    pub max_concurrent_executions: usize,
    /// Claim duration past the last checkpoint (or past a pending resume time).
    pub lease: Duration,
    /// Step retry policy.
    pub retry: RetryPolicy,
}

impl From<&AppConfig> for WorkflowConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            wait_interval: Duration::from_secs(config.workflow.wait_interval_secs),
            max_concurrent_executions: config.workflow.max_concurrent_executions.max(1) as usize,
            lease: Duration::from_secs(config.workflow.lease_secs.max(1)),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DocflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docflow/docflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| DocflowError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DocflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DocflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the API token from the env var named in config, if it is set.
pub fn resolve_api_key(config: &AnalysisConfig) -> Option<String> {
    match std::env::var(&config.api_key_env) {
        Ok(val) if !val.is_empty() => Some(val),
        _ => None,
    }
}
