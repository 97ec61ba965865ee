//! Harness configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration. Environment variables override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DATA_DIR_ENV: &str = "AGENT_HARNESS_DATA_DIR";
pub const MAX_RETRIES_ENV: &str = "AGENT_HARNESS_MAX_RETRIES";
pub const RETRY_DELAY_ENV: &str = "AGENT_HARNESS_RETRY_DELAY_MS";
pub const CACHE_TIMEOUT_ENV: &str = "AGENT_HARNESS_CACHE_TIMEOUT_MS";
pub const PREFER_DATABASE_ENV: &str = "AGENT_HARNESS_PREFER_DATABASE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub hybrid: HybridConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bus: BusConfig::default(),
            consumer: ConsumerConfig::default(),
            tracker: TrackerConfig::default(),
            hybrid: HybridConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Read an optional JSON config file, then apply environment overrides.
    ///
    /// A `.env` file in the working directory is honoured if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => HarnessConfig::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                self.data_dir = PathBuf::from(trimmed);
            }
        }
        if let Some(value) = env_parse::<u32>(MAX_RETRIES_ENV)? {
            self.consumer.max_retries = value;
        }
        if let Some(value) = env_parse::<u64>(RETRY_DELAY_ENV)? {
            self.consumer.retry_delay_ms = value;
        }
        if let Some(value) = env_parse::<u64>(CACHE_TIMEOUT_ENV)? {
            self.hybrid.cache_timeout_ms = value;
        }
        if let Some(value) = env_parse::<bool>(PREFER_DATABASE_ENV)? {
            self.hybrid.prefer_database = value;
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("agent-harness.db")
    }

    /// Directory used by the file backend of the hybrid store.
    pub fn state_dir(&self) -> PathBuf {
        self.hybrid
            .state_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("conversations"))
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    let Ok(raw) = std::env::var(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Env { var, value: raw })
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub enable_buffering: bool,
    #[serde(default = "default_bus_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_bus_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enable_buffering: false,
            buffer_size: default_bus_buffer_size(),
            flush_interval_ms: default_bus_flush_interval_ms(),
            max_history_size: default_max_history_size(),
        }
    }
}

impl BusConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub enable_batching: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_consumer_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enable_batching: false,
            batch_size: default_batch_size(),
            flush_interval_ms: default_consumer_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ConsumerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Delay before retry number `attempt` (1-based): linear in the attempt.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_true")]
    pub enable_auto_save: bool,
    #[serde(default = "default_auto_save_interval_ms")]
    pub auto_save_interval_ms: u64,
    #[serde(default = "default_true")]
    pub buffer_updates: bool,
    #[serde(default = "default_tracker_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_tracker_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_true")]
    pub emit_events: bool,
    #[serde(default = "default_true")]
    pub direct_high_value_writes: bool,
    #[serde(default = "default_true")]
    pub track_phases: bool,
    #[serde(default = "default_true")]
    pub track_tools: bool,
    #[serde(default = "default_true")]
    pub track_files: bool,
    #[serde(default = "default_true")]
    pub track_costs: bool,
    #[serde(default = "default_completion_grace_ms")]
    pub completion_grace_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enable_auto_save: true,
            auto_save_interval_ms: default_auto_save_interval_ms(),
            buffer_updates: true,
            buffer_size: default_tracker_buffer_size(),
            flush_interval_ms: default_tracker_flush_interval_ms(),
            emit_events: true,
            direct_high_value_writes: true,
            track_phases: true,
            track_tools: true,
            track_files: true,
            track_costs: true,
            completion_grace_ms: default_completion_grace_ms(),
        }
    }
}

impl TrackerConfig {
    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_millis(self.auto_save_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default = "default_true")]
    pub enable_database: bool,
    #[serde(default = "default_true")]
    pub prefer_database: bool,
    #[serde(default = "default_true")]
    pub fallback_to_file: bool,
    #[serde(default)]
    pub sync_between_sources: bool,
    #[serde(default = "default_cache_timeout_ms")]
    pub cache_timeout_ms: u64,
    #[serde(default = "default_cache_cleanup_interval_ms")]
    pub cache_cleanup_interval_ms: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enable_database: true,
            prefer_database: true,
            fallback_to_file: true,
            sync_between_sources: false,
            cache_timeout_ms: default_cache_timeout_ms(),
            cache_cleanup_interval_ms: default_cache_cleanup_interval_ms(),
            retention_days: default_retention_days(),
            state_dir: None,
        }
    }
}

impl HybridConfig {
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cache_cleanup_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_bus_buffer_size() -> usize {
    100
}

fn default_bus_flush_interval_ms() -> u64 {
    1_000
}

fn default_max_history_size() -> usize {
    1_000
}

fn default_batch_size() -> usize {
    10
}

fn default_consumer_flush_interval_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_auto_save_interval_ms() -> u64 {
    30_000
}

fn default_tracker_buffer_size() -> usize {
    10
}

fn default_tracker_flush_interval_ms() -> u64 {
    5_000
}

fn default_completion_grace_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_cache_timeout_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_cache_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_retention_days() -> u32 {
    30
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(app_data) = std::env::var("APPDATA") {
            return PathBuf::from(app_data).join("AgentHarness");
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".agent-harness");
    }

    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".agent-harness");
    }

    PathBuf::from(".agent-harness")
}
