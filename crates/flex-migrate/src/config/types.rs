//! Configuration type definitions with auto-tuning based on system resources.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Run identifier. Checkpoints are keyed by it; a fresh one is generated if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Source decoding behavior.
    #[serde(default)]
    pub decoder: DecoderConfig,

    /// Schema analysis behavior.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Memory governor thresholds.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Batch execution behavior.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Retry policy and failure tolerance.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Checkpoint persistence.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Rollback behavior.
    #[serde(default)]
    pub rollback: RollbackConfig,

    /// Progress reporting throttle.
    #[serde(default)]
    pub progress: ProgressConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.memory = self.memory.with_auto_tuning(&resources);
        self.batch = self.batch.with_auto_tuning(&resources);
        self
    }
}

/// Source decoding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Reject sources larger than this many bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_source_bytes: Option<u64>,

    /// Lines sampled for delimiter and header detection (default: 10).
    #[serde(default = "default_sample_lines")]
    pub sample_lines: usize,

    /// Force a delimiter instead of detecting one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,

    /// Force header presence instead of detecting it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_header: Option<bool>,

    /// Maximum column-count mismatch padded/truncated silently. Unset = no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_tolerance: Option<usize>,

    /// Raw tokens that decode to null (default: `NULL`, `\N`).
    #[serde(default = "default_null_tokens")]
    pub null_tokens: Vec<String>,

    /// Markup element that delimits one record. Detected if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_element: Option<String>,

    /// Skip DOCTYPE declarations instead of rejecting the document. Entities are never expanded.
    #[serde(default)]
    pub allow_dtd: bool,

    /// Script table whose INSERTs become records. First table with data if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: None,
            sample_lines: default_sample_lines(),
            delimiter: None,
            has_header: None,
            column_tolerance: None,
            null_tokens: default_null_tokens(),
            record_element: None,
            allow_dtd: false,
            table: None,
        }
    }
}

/// Schema analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Maximum records sampled (default: 1000).
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Records pulled per sampling chunk (default: 100).
    #[serde(default = "default_analysis_chunk")]
    pub chunk_size: usize,

    /// Values cached per field profile (default: 50).
    #[serde(default = "default_sample_cache_cap")]
    pub sample_cache_cap: usize,

    /// Null+empty fraction above which a field is nullable (default: 0.10).
    #[serde(default = "default_nullable_threshold")]
    pub nullable_threshold: f64,

    /// Sample size that must be exceeded before declaring uniqueness (default: 10).
    #[serde(default = "default_unique_min_sample")]
    pub unique_min_sample: u64,

    /// Maximum distinct values for an enum-like field (default: 10).
    #[serde(default = "default_enum_max_distinct")]
    pub enum_max_distinct: usize,

    /// Maximum distinct/non-empty ratio for an enum-like field (default: 0.5).
    #[serde(default = "default_enum_max_ratio")]
    pub enum_max_ratio: f64,

    /// Share of values a structural pattern must match to be reported (default: 0.8).
    #[serde(default = "default_pattern_min_ratio")]
    pub pattern_min_ratio: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            chunk_size: default_analysis_chunk(),
            sample_cache_cap: default_sample_cache_cap(),
            nullable_threshold: default_nullable_threshold(),
            unique_min_sample: default_unique_min_sample(),
            enum_max_distinct: default_enum_max_distinct(),
            enum_max_ratio: default_enum_max_ratio(),
            pattern_min_ratio: default_pattern_min_ratio(),
        }
    }
}

/// Memory governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Process memory ceiling in bytes. Auto-tuned to half of system RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling_bytes: Option<u64>,

    /// Usage ratio entering the warning band (default: 0.70).
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Usage ratio entering the critical band (default: 0.85).
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    /// Usage ratio entering the emergency band (default: 0.95).
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f64,

    /// Minimum seconds between collections in the critical band (default: 30).
    #[serde(default = "default_collection_cooldown")]
    pub collection_cooldown_secs: u64,

    /// Usage samples kept for trend analysis (default: 20).
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: None,
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            emergency_threshold: default_emergency_threshold(),
            collection_cooldown_secs: default_collection_cooldown(),
            history_size: default_history_size(),
        }
    }
}

impl MemoryConfig {
    /// Fill the ceiling from system RAM when not set.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.ceiling_bytes.is_none() && resources.total_memory_bytes > 0 {
            self.ceiling_bytes = Some(resources.total_memory_bytes / 2);
        }
        info!(
            "Auto-tuned memory ceiling: {} MB",
            self.get_ceiling_bytes() / (1024 * 1024)
        );
        self
    }

    pub fn get_ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes.unwrap_or(2 * 1024 * 1024 * 1024)
    }

    pub fn collection_cooldown(&self) -> Duration {
        Duration::from_secs(self.collection_cooldown_secs)
    }
}

/// Batch execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Initial (and original) batch size (default: 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Lower bound for governor adjustments (default: 10).
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Upper bound for governor adjustments (default: 5000).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Persist a checkpoint every N records (default: 1000).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Distribute batches to a worker pool instead of the sequential loop.
    #[serde(default)]
    pub parallel: bool,

    /// Worker pool size for parallel mode. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Per-batch timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout_secs: Option<u64>,

    /// Keep going when individual records fail (default: true).
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            checkpoint_interval: default_checkpoint_interval(),
            parallel: false,
            workers: None,
            batch_timeout_secs: None,
            continue_on_error: true,
        }
    }
}

impl BatchConfig {
    /// Fill the worker count from CPU cores when not set.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Workers: cores - 2, but at least 2 and at most 16
        if self.workers.is_none() {
            let workers = resources.cpu_cores.saturating_sub(2).max(2).min(16);
            self.workers = Some(workers);
        }
        info!("Auto-tuned config: workers={}", self.get_workers());
        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_secs.map(Duration::from_secs)
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// attempt × base
    Linear,
    /// base × 2^(attempt-1)
    #[default]
    Exponential,
    /// base
    Fixed,
}

/// Retry and failure tolerance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per operation, including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff strategy (default: exponential).
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Base delay in milliseconds (default: 100).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (default: 10000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Add up to 10% random jitter to each delay (default: true).
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Failure ratio that trips the circuit breaker (default: 0.1).
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,

    /// Items per partial-failure sub-batch (default: 100).
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
            max_failure_ratio: default_max_failure_ratio(),
            sub_batch_size: default_sub_batch_size(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory for checkpoint files. In-memory store if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    /// Checkpoints kept per run (default: 10).
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: None,
            retention: default_retention(),
        }
    }
}

/// How a rollback is applied to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMode {
    /// One all-or-nothing undo scope (requires destination transactions).
    Transactional,
    /// Best-effort sequential replay.
    #[default]
    Manual,
}

/// Rollback configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Rollback mode (default: manual).
    #[serde(default)]
    pub mode: RollbackMode,

    /// Directory for per-run JSON-lines operation journals (`<run_id>.jsonl`).
    /// Operations are kept in memory only if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<PathBuf>,
}

/// Progress reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Minimum milliseconds between sink calls (default: 1000).
    #[serde(default = "default_progress_interval_ms")]
    pub min_interval_ms: u64,

    /// Minimum percentage movement between sink calls (default: 1.0).
    #[serde(default = "default_progress_delta")]
    pub min_percent_delta: f64,

    /// Items since the last emit that force a sink call (default: 10000).
    #[serde(default = "default_progress_items")]
    pub min_items: u64,

    /// Batches in the rolling throughput window (default: 10).
    #[serde(default = "default_throughput_window")]
    pub throughput_window: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_progress_interval_ms(),
            min_percent_delta: default_progress_delta(),
            min_items: default_progress_items(),
            throughput_window: default_throughput_window(),
        }
    }
}

impl ProgressConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

// Default value functions for serde
fn default_sample_lines() -> usize {
    10
}

fn default_null_tokens() -> Vec<String> {
    vec!["NULL".to_string(), "\\N".to_string()]
}

fn default_sample_size() -> usize {
    1000
}

fn default_analysis_chunk() -> usize {
    100
}

fn default_sample_cache_cap() -> usize {
    50
}

fn default_nullable_threshold() -> f64 {
    0.10
}

fn default_unique_min_sample() -> u64 {
    10
}

fn default_enum_max_distinct() -> usize {
    10
}

fn default_enum_max_ratio() -> f64 {
    0.5
}

fn default_pattern_min_ratio() -> f64 {
    0.8
}

fn default_warning_threshold() -> f64 {
    0.70
}

fn default_critical_threshold() -> f64 {
    0.85
}

fn default_emergency_threshold() -> f64 {
    0.95
}

fn default_collection_cooldown() -> u64 {
    30
}

fn default_history_size() -> usize {
    20
}

fn default_batch_size() -> usize {
    500
}

fn default_min_batch_size() -> usize {
    10
}

fn default_max_batch_size() -> usize {
    5000
}

fn default_checkpoint_interval() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_failure_ratio() -> f64 {
    0.1
}

fn default_sub_batch_size() -> usize {
    100
}

fn default_retention() -> usize {
    10
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_progress_delta() -> f64 {
    1.0
}

fn default_progress_items() -> u64 {
    10_000
}

fn default_throughput_window() -> usize {
    10
}

fn default_true() -> bool {
    true
}
