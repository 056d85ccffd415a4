//! Configuration System
//!
//! Layered configuration for the orchestrator: built-in defaults, the global
//! user file, workspace files and `DARKROOM__SECTION__KEY` environment
//! overrides, merged with the `config` crate and validated as a whole.

use crate::error::OrchestratorError;
use crate::logging::LoggingConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod merge;
mod sources;

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DarkroomConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Job monitoring schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// First poll interval after submission
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Growth factor applied after every poll
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Interval cap
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Absolute monitoring deadline, counted from the start of monitoring
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Per-call timeout for every backend request
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Cap on steps polled concurrently in one sweep
    #[serde(default = "default_max_monitored_steps")]
    pub max_monitored_steps: usize,
}

fn default_initial_interval_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_deadline_secs() -> u64 {
    600
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_max_monitored_steps() -> usize {
    32
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            deadline_secs: default_deadline_secs(),
            call_timeout_ms: default_call_timeout_ms(),
            max_monitored_steps: default_max_monitored_steps(),
        }
    }
}

impl MonitorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_secs.saturating_mul(1_000)
    }
}

/// Token-scan window sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_overfetch_multiplier")]
    pub overfetch_multiplier: usize,

    /// Smallest window, so late or out-of-order completions stay visible
    #[serde(default = "default_min_window")]
    pub min_window: usize,
}

fn default_overfetch_multiplier() -> usize {
    3
}

fn default_min_window() -> usize {
    10
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            overfetch_multiplier: default_overfetch_multiplier(),
            min_window: default_min_window(),
        }
    }
}

impl CorrelationConfig {
    /// Number of recent artifacts to list for a step expecting `expected`.
    pub fn window_for(&self, expected: u32) -> usize {
        (expected as usize)
            .saturating_mul(self.overfetch_multiplier)
            .max(self.min_window)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Concurrent fetches per sweep
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Tasks selected per sweep
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_parallel() -> usize {
    4
}

fn default_batch_size() -> usize {
    64
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_parallel: default_max_parallel(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    #[serde(default = "default_retrieval_interval_ms")]
    pub retrieval_interval_ms: u64,
}

fn default_monitor_interval_ms() -> u64 {
    1_000
}

fn default_retrieval_interval_ms() -> u64 {
    5_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            retrieval_interval_ms: default_retrieval_interval_ms(),
        }
    }
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory
    pub store_path: PathBuf,
    /// Root of the content-addressed artifact files
    pub artifacts_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = default_data_root(Path::new("."));
        Self {
            store_path: root.join("store"),
            artifacts_path: root,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:7860".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Platform data directory, or `{workspace_root}/.darkroom` without one.
pub fn default_data_root(workspace_root: &Path) -> PathBuf {
    directories::ProjectDirs::from("", "", "darkroom")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| workspace_root.join(".darkroom"))
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Monitor(String),
    Correlation(String),
    Retrieval(String),
    Scheduler(String),
    Storage(String),
    Backend(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Monitor(msg) => write!(f, "monitor: {}", msg),
            ValidationError::Correlation(msg) => write!(f, "correlation: {}", msg),
            ValidationError::Retrieval(msg) => write!(f, "retrieval: {}", msg),
            ValidationError::Scheduler(msg) => write!(f, "scheduler: {}", msg),
            ValidationError::Storage(msg) => write!(f, "storage: {}", msg),
            ValidationError::Backend(msg) => write!(f, "backend: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl DarkroomConfig {
    /// Validate the entire configuration, collecting every violation.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let monitor = &self.monitor;
        if monitor.initial_interval_ms == 0 {
            errors.push(ValidationError::Monitor("initial_interval_ms must be > 0".into()));
        }
        if !(monitor.multiplier >= 1.0) {
            errors.push(ValidationError::Monitor("multiplier must be >= 1.0".into()));
        }
        if monitor.max_interval_ms < monitor.initial_interval_ms {
            errors.push(ValidationError::Monitor(
                "max_interval_ms must be >= initial_interval_ms".into(),
            ));
        }
        if monitor.deadline_secs == 0 {
            errors.push(ValidationError::Monitor("deadline_secs must be > 0".into()));
        }
        if monitor.call_timeout_ms == 0 {
            errors.push(ValidationError::Monitor("call_timeout_ms must be > 0".into()));
        }
        if monitor.max_monitored_steps == 0 {
            errors.push(ValidationError::Monitor("max_monitored_steps must be >= 1".into()));
        }

        if self.correlation.overfetch_multiplier == 0 {
            errors.push(ValidationError::Correlation(
                "overfetch_multiplier must be >= 1".into(),
            ));
        }

        if self.retrieval.max_attempts == 0 {
            errors.push(ValidationError::Retrieval("max_attempts must be >= 1".into()));
        }
        if self.retrieval.max_parallel == 0 {
            errors.push(ValidationError::Retrieval("max_parallel must be >= 1".into()));
        }
        if self.retrieval.batch_size == 0 {
            errors.push(ValidationError::Retrieval("batch_size must be >= 1".into()));
        }

        if self.scheduler.monitor_interval_ms == 0 || self.scheduler.retrieval_interval_ms == 0 {
            errors.push(ValidationError::Scheduler("sweep intervals must be > 0".into()));
        }

        if self.storage.store_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage("store_path cannot be empty".into()));
        }
        if self.storage.artifacts_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage("artifacts_path cannot be empty".into()));
        }

        if self.backend.base_url.trim().is_empty() {
            errors.push(ValidationError::Backend("base_url cannot be empty".into()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate, folding every violation into one `ConfigError`.
    pub fn ensure_valid(&self) -> Result<(), OrchestratorError> {
        self.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            OrchestratorError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })
    }
}

/// Loads [`DarkroomConfig`] from the layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace.
    ///
    /// Precedence (lowest to highest): defaults, global file, workspace
    /// `config/config.toml`, `config/{DARKROOM_ENV}.toml`, environment.
    pub fn load(workspace_root: &Path) -> Result<DarkroomConfig, config::ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults(&default_data_root(workspace_root))?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        builder
            .add_source(environment_source())
            .build()?
            .try_deserialize()
    }

    /// Load a single explicit file on top of the defaults and environment.
    pub fn load_from_file(path: &Path) -> Result<DarkroomConfig, config::ConfigError> {
        let workspace_root = path.parent().unwrap_or_else(|| Path::new("."));
        merge::merge_policy::builder_with_defaults(&default_data_root(workspace_root))?
            .add_source(File::from(path.to_path_buf()).required(true))
            .add_source(environment_source())
            .build()?
            .try_deserialize()
    }

    /// Built-in defaults only.
    pub fn defaults() -> Result<DarkroomConfig, config::ConfigError> {
        let built: Config =
            merge::merge_policy::builder_with_defaults(&default_data_root(Path::new(".")))?.build()?;
        built.try_deserialize()
    }
}

fn environment_source() -> Environment {
    Environment::with_prefix("DARKROOM")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
