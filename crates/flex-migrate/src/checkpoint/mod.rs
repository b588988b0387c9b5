//! Checkpoints for resuming interrupted runs.
//!
//! A checkpoint captures the decoder cursor and the run counters at a batch
//! boundary. Checkpoints are append-only per run; stores keep only the most
//! recent few. Two stores are provided:
//!
//! - [`FileCheckpointStore`]: one HMAC-signed JSON file per checkpoint
//! - [`MemoryCheckpointStore`]: process-local, for tests and dry runs

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::CheckpointConfig;
use crate::error::{MigrateError, Result};
use crate::memory::MemoryState;

type HmacSha256 = Hmac<Sha256>;

/// Resumable position of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint identifier.
    pub id: String,

    /// Run this checkpoint belongs to.
    pub run_id: String,

    /// Position in the run's checkpoint sequence, assigned by the store.
    pub sequence: u64,

    /// Records consumed from the decoder (the resume cursor).
    pub cursor: u64,

    pub success_count: u64,
    pub failure_count: u64,
    pub current_batch_index: u64,

    /// Total batches, when the source size is known.
    pub total_batches: Option<u64>,

    /// Governor state at the time of the checkpoint.
    pub memory: Option<MemoryState>,

    /// Caller-owned resumable state.
    #[serde(default)]
    pub state: serde_json::Value,

    pub created_at: DateTime<Utc>,

    /// HMAC-SHA256 over the serialized checkpoint (excluding this field).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl Checkpoint {
    /// Create an unsaved checkpoint at `cursor`.
    pub fn new(run_id: impl Into<String>, cursor: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            sequence: 0,
            cursor,
            success_count: 0,
            failure_count: 0,
            current_batch_index: 0,
            total_batches: None,
            memory: None,
            state: serde_json::Value::Null,
            created_at: Utc::now(),
            hmac: None,
        }
    }

    /// MAC over the serialized checkpoint without its signature, keyed by `key`.
    fn mac(&self, key: &str) -> Result<HmacSha256> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| MigrateError::Config(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(mac)
    }

    /// Sign with `key` (the config hash).
    pub fn sign(&mut self, key: &str) -> Result<()> {
        let mac = self.mac(key)?;
        self.hmac = Some(hex::encode(mac.finalize().into_bytes()));
        Ok(())
    }

    /// Verify the signature against `key`.
    pub fn verify(&self, key: &str) -> Result<()> {
        let corrupt = |reason: &str| MigrateError::CheckpointCorrupt {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        let stored = self
            .hmac
            .as_deref()
            .ok_or_else(|| corrupt("missing HMAC signature"))?;
        let stored = hex::decode(stored).map_err(|_| corrupt("malformed HMAC signature"))?;
        self.mac(key)?
            .verify_slice(&stored)
            .map_err(|_| corrupt("HMAC mismatch (possible tampering)"))
    }

    /// Fail with `CheckpointMismatch` unless this checkpoint belongs to `run_id`.
    pub fn ensure_run(&self, run_id: &str) -> Result<()> {
        if self.run_id != run_id {
            return Err(MigrateError::CheckpointMismatch {
                id: self.id.clone(),
                expected: run_id.to_string(),
                found: self.run_id.clone(),
            });
        }
        Ok(())
    }
}

/// Persistence for a single run's checkpoints.
///
/// Implementations must be `Send + Sync`; the executor shares the store as
/// `Arc<dyn CheckpointStore>`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, assigning its sequence. Returns its id.
    async fn save(&self, checkpoint: Checkpoint) -> Result<String>;

    /// Load a checkpoint by id.
    async fn load(&self, id: &str) -> Result<Checkpoint>;

    /// Most recent checkpoint, if any.
    async fn latest(&self) -> Result<Option<Checkpoint>>;

    /// All retained checkpoints ordered by sequence.
    async fn list(&self) -> Result<Vec<Checkpoint>>;

    /// Run this store is keyed by.
    fn run_id(&self) -> &str;

    /// Store type name for logging.
    fn store_type(&self) -> &'static str;
}

/// Open the store described by `config`.
///
/// A configured directory selects the file store; otherwise checkpoints live in memory.
pub fn open_store(
    config: &CheckpointConfig,
    run_id: &str,
    key: &str,
) -> Result<Arc<dyn CheckpointStore>> {
    Ok(match &config.directory {
        Some(dir) => Arc::new(FileCheckpointStore::open(dir, run_id, key, config.retention)?),
        None => Arc::new(MemoryCheckpointStore::new(run_id, config.retention)),
    })
}
