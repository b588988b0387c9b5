use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::MemoryState;
use crate::retry::{ItemFailure, RetryStats};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Source exhausted.
    Completed,
    /// Cancellation observed between batches.
    Cancelled,
}

/// Result of an executor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,

    pub status: RunStatus,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Checkpoint this run resumed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,

    /// Records consumed from the source, including those before a resume.
    pub cursor: u64,

    pub success_count: u64,
    pub failure_count: u64,

    /// Batches executed, including those before a resume.
    pub batches: u64,

    /// Operations recorded in the rollback log by this run.
    pub operations: usize,

    /// Average throughput of this run (records/second).
    pub records_per_second: f64,

    /// Last checkpoint written.
    pub last_checkpoint: Option<String>,

    /// First failures of this run. `index` is the record's position in the source.
    pub failures: Vec<ItemFailure>,

    pub retry: RetryStats,

    pub memory: MemoryState,
}

impl RunReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
