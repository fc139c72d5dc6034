//! Engine configuration loaded from `~/.ruck/engine.toml`.
//!
//! Every field has a default so a partial (or missing) file is valid.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use crate::error::ConfigError;
use crate::location::TrackingMode;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".ruck/engine.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub heart_rate: HeartRateConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub resource: ResourceConfig,
    #[serde(default)]
    pub companion: CompanionConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// When false the host drives `tick()` itself.
    #[serde(default = "default_true")]
    pub auto_tick: bool,
    #[serde(default = "default_pace_window_secs")]
    pub pace_window_secs: i64,
    #[serde(default = "default_command_wait_ms")]
    pub command_wait_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            auto_tick: true,
            pace_window_secs: default_pace_window_secs(),
            command_wait_ms: default_command_wait_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn start_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.start_timeout_ms)
    }

    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn command_wait(&self) -> StdDuration {
        StdDuration::from_millis(self.command_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    #[serde(default)]
    pub preferred_mode: TrackingMode,
    #[serde(default = "default_max_accuracy_m")]
    pub max_accuracy_m: f64,
    #[serde(default = "default_reorder_window_ms")]
    pub reorder_window_ms: i64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            preferred_mode: TrackingMode::default(),
            max_accuracy_m: default_max_accuracy_m(),
            reorder_window_ms: default_reorder_window_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartRateConfig {
    #[serde(default = "default_companion_stall_secs")]
    pub companion_stall_secs: i64,
    #[serde(default = "default_min_bpm")]
    pub min_bpm: u16,
    #[serde(default = "default_max_bpm")]
    pub max_bpm: u16,
    #[serde(default = "default_gap_fill_threshold_secs")]
    pub gap_fill_threshold_secs: i64,
}

impl Default for HeartRateConfig {
    fn default() -> Self {
        Self {
            companion_stall_secs: default_companion_stall_secs(),
            min_bpm: default_min_bpm(),
            max_bpm: default_max_bpm(),
            gap_fill_threshold_secs: default_gap_fill_threshold_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: i64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: i64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_emergency_timeout_ms")]
    pub emergency_timeout_ms: u64,
    #[serde(default = "default_emergency_batch_size")]
    pub emergency_batch_size: usize,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: i64,
    /// Soft bound; above it the engine coarsens ingestion instead of
    /// dropping samples.
    #[serde(default = "default_queue_soft_capacity")]
    pub queue_soft_capacity: usize,
    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            batch_size: default_batch_size(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            request_timeout_ms: default_request_timeout_ms(),
            emergency_timeout_ms: default_emergency_timeout_ms(),
            emergency_batch_size: default_emergency_batch_size(),
            stop_grace_secs: default_stop_grace_secs(),
            queue_soft_capacity: default_queue_soft_capacity(),
            worker_poll_ms: default_worker_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,
    /// Budget fractions at which low / moderate / high / critical begin.
    #[serde(default = "default_thresholds")]
    pub thresholds: [f64; 4],
    #[serde(default = "default_sustain_samples")]
    pub sustain_samples: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            memory_budget_mb: default_memory_budget_mb(),
            thresholds: default_thresholds(),
            sustain_samples: default_sustain_samples(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompanionConfig {
    #[serde(default = "default_command_cache_secs")]
    pub command_cache_secs: i64,
    #[serde(default = "default_mirror_interval_secs")]
    pub mirror_interval_secs: i64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            command_cache_secs: default_command_cache_secs(),
            mirror_interval_secs: default_mirror_interval_secs(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: i64,
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval_secs(),
            write_attempts: default_write_attempts(),
        }
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    toml::from_str::<EngineConfig>(&content).map_err(|source| ConfigError::Parse {
        path: config_path,
        source,
    })
}

fn default_true() -> bool {
    true
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_pace_window_secs() -> i64 {
    60
}

fn default_command_wait_ms() -> u64 {
    2_000
}

fn default_max_accuracy_m() -> f64 {
    50.0
}

fn default_reorder_window_ms() -> i64 {
    2_000
}

fn default_poll_timeout_ms() -> u64 {
    250
}

fn default_companion_stall_secs() -> i64 {
    15
}

fn default_min_bpm() -> u16 {
    25
}

fn default_max_bpm() -> u16 {
    250
}

fn default_gap_fill_threshold_secs() -> i64 {
    30
}

fn default_flush_interval_secs() -> i64 {
    10
}

fn default_batch_size() -> usize {
    50
}

fn default_backoff_initial_ms() -> i64 {
    1_000
}

fn default_backoff_max_ms() -> i64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_emergency_timeout_ms() -> u64 {
    3_000
}

fn default_emergency_batch_size() -> usize {
    20
}

fn default_stop_grace_secs() -> i64 {
    5
}

fn default_queue_soft_capacity() -> usize {
    5_000
}

fn default_worker_poll_ms() -> u64 {
    250
}

fn default_sample_interval_ms() -> u64 {
    5_000
}

fn default_memory_budget_mb() -> u64 {
    512
}

fn default_thresholds() -> [f64; 4] {
    [0.6, 0.7, 0.8, 0.9]
}

fn default_sustain_samples() -> u32 {
    2
}

fn default_cooldown_secs() -> i64 {
    30
}

fn default_command_cache_secs() -> i64 {
    45
}

fn default_mirror_interval_secs() -> i64 {
    2
}

fn default_snapshot_interval_secs() -> i64 {
    3
}

fn default_write_attempts() -> u32 {
    3
}
