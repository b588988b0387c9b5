//! File-backed checkpoint store.
//!
//! Layout: `<directory>/<run_id>/checkpoint-<sequence>-<id>.json`. The sequence
//! is zero-padded so lexical order is creation order.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Checkpoint, CheckpointStore};
use crate::error::{MigrateError, Result};

const PREFIX: &str = "checkpoint-";
const SUFFIX: &str = ".json";

/// Checkpoints as signed JSON files, written atomically.
pub struct FileCheckpointStore {
    dir: PathBuf,
    run_id: String,
    key: String,
    retention: usize,
    next_sequence: Mutex<u64>,
}

/// Sequence and id parsed from a checkpoint file name.
fn parse_name(name: &str) -> Option<(u64, &str)> {
    let rest = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let (seq, id) = rest.split_once('-')?;
    Some((seq.parse().ok()?, id))
}

/// `(sequence, id, path)` for every checkpoint file in `dir`, ordered by sequence.
fn scan(dir: &Path) -> Result<Vec<(u64, String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if let Some((seq, id)) = parse_name(name) {
            entries.push((seq, id.to_string(), entry.path()));
        }
    }
    entries.sort_by_key(|(seq, _, _)| *seq);
    Ok(entries)
}

impl FileCheckpointStore {
    /// Open (creating if needed) the store for `run_id` under `directory`.
    ///
    /// `key` signs and verifies every checkpoint; pass the config hash.
    pub fn open(
        directory: impl AsRef<Path>,
        run_id: &str,
        key: &str,
        retention: usize,
    ) -> Result<Self> {
        let dir = directory.as_ref().join(run_id);
        std::fs::create_dir_all(&dir)?;

        let existing = scan(&dir)?;
        let next = existing.last().map_or(0, |(seq, _, _)| seq + 1);
        info!(
            "Checkpoint store at {} ({} existing)",
            dir.display(),
            existing.len()
        );

        Ok(Self {
            dir,
            run_id: run_id.to_string(),
            key: key.to_string(),
            retention: retention.max(1),
            next_sequence: Mutex::new(next),
        })
    }

    /// Directory holding this run's checkpoints.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn entries(&self) -> Result<Vec<(u64, String, PathBuf)>> {
        scan(&self.dir)
    }

    fn read(&self, id: &str, path: &Path) -> Result<Checkpoint> {
        let content = std::fs::read_to_string(path)?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&content).map_err(|e| MigrateError::CheckpointCorrupt {
                id: id.to_string(),
                reason: format!("unparseable: {}", e),
            })?;
        if checkpoint.id != id {
            return Err(MigrateError::CheckpointCorrupt {
                id: id.to_string(),
                reason: format!("file holds checkpoint {}", checkpoint.id),
            });
        }
        checkpoint.verify(&self.key)?;
        checkpoint.ensure_run(&self.run_id)?;
        Ok(checkpoint)
    }

    fn prune(&self) -> Result<()> {
        let entries = self.entries()?;
        if entries.len() <= self.retention {
            return Ok(());
        }
        let excess = entries.len() - self.retention;
        for (seq, id, path) in entries.into_iter().take(excess) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Pruned checkpoint {} ({})", seq, id),
                Err(e) => warn!("Failed to prune checkpoint {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, mut checkpoint: Checkpoint) -> Result<String> {
        checkpoint.ensure_run(&self.run_id)?;

        let mut next = self.next_sequence.lock().await;
        checkpoint.sequence = *next;
        checkpoint.sign(&self.key)?;

        let path = self
            .dir
            .join(format!("{}{:010}-{}{}", PREFIX, checkpoint.sequence, checkpoint.id, SUFFIX));
        let content = serde_json::to_string_pretty(&checkpoint)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &path)?;
        *next += 1;
        drop(next);

        debug!(
            "Saved checkpoint {} (sequence {}, cursor {})",
            checkpoint.id, checkpoint.sequence, checkpoint.cursor
        );
        self.prune()?;
        Ok(checkpoint.id)
    }

    async fn load(&self, id: &str) -> Result<Checkpoint> {
        let entry = self
            .entries()?
            .into_iter()
            .find(|(_, entry_id, _)| entry_id == id)
            .ok_or_else(|| MigrateError::CheckpointNotFound(id.to_string()))?;
        self.read(id, &entry.2)
    }

    async fn latest(&self) -> Result<Option<Checkpoint>> {
        match self.entries()?.pop() {
            Some((_, id, path)) => self.read(&id, &path).map(Some),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for (_, id, path) in self.entries()? {
            match self.read(&id, &path) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!("Skipping unreadable checkpoint {}: {}", id, e),
            }
        }
        Ok(checkpoints)
    }

    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn store_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint(cursor: u64) -> Checkpoint {
        let mut cp = Checkpoint::new("run-1", cursor);
        cp.success_count = cursor;
        cp
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "run-1", "hash", 10).unwrap();

        let id = store.save(checkpoint(1000)).await.unwrap();
        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.cursor, 1000);
        assert_eq!(loaded.sequence, 0);
        assert!(loaded.hmac.is_some());

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, id);
    }

    #[tokio::test]
    async fn test_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "run-1", "hash", 10).unwrap();
        assert!(store.latest().await.unwrap().is_none());
        assert!(matches!(
            store.load("nope").await,
            Err(MigrateError::CheckpointNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "run-1", "hash", 10).unwrap();
        let id = store.save(checkpoint(1000)).await.unwrap();

        let (_, _, path) = store.entries().unwrap().pop().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("\"cursor\": 1000", "\"cursor\": 5000")).unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(MigrateError::CheckpointCorrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_unparseable_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "run-1", "hash", 10).unwrap();
        let id = store.save(checkpoint(1)).await.unwrap();
        let (_, _, path) = store.entries().unwrap().pop().unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(MigrateError::CheckpointCorrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_config_change_invalidates_signature() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "run-1", "hash-a", 10).unwrap();
        let id = store.save(checkpoint(1)).await.unwrap();

        let reopened = FileCheckpointStore::open(dir.path(), "run-1", "hash-b", 10).unwrap();
        assert!(matches!(
            reopened.load(&id).await,
            Err(MigrateError::CheckpointCorrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_run_is_mismatch() {
        let dir = TempDir::new().unwrap();
        let other = FileCheckpointStore::open(dir.path(), "run-2", "hash", 10).unwrap();
        other.save(Checkpoint::new("run-2", 7)).await.unwrap();

        // Move run-2's file into run-1's directory.
        let store = FileCheckpointStore::open(dir.path(), "run-1", "hash", 10).unwrap();
        let (_, id, path) = other.entries().unwrap().pop().unwrap();
        std::fs::rename(&path, store.directory().join(path.file_name().unwrap())).unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(MigrateError::CheckpointMismatch { .. })
        ));
        assert!(matches!(
            store.latest().await,
            Err(MigrateError::CheckpointMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "run-1", "hash", 3).unwrap();
        for cursor in 1..=5 {
            store.save(checkpoint(cursor * 100)).await.unwrap();
        }

        let list = store.list().await.unwrap();
        let cursors: Vec<u64> = list.iter().map(|c| c.cursor).collect();
        assert_eq!(cursors, vec![300, 400, 500]);
        let sequences: Vec<u64> = list.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileCheckpointStore::open(dir.path(), "run-1", "hash", 10).unwrap();
            store.save(checkpoint(1)).await.unwrap();
            store.save(checkpoint(2)).await.unwrap();
        }
        let store = FileCheckpointStore::open(dir.path(), "run-1", "hash", 10).unwrap();
        store.save(checkpoint(3)).await.unwrap();
        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.cursor, 3);
    }

    #[tokio::test]
    async fn test_no_temp_files_left() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "run-1", "hash", 10).unwrap();
        store.save(checkpoint(1)).await.unwrap();
        let leftovers = std::fs::read_dir(store.directory())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.path().extension().map_or(false, |x| x == "tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
