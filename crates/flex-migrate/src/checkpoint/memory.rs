//! In-memory checkpoint store.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Checkpoint, CheckpointStore};
use crate::error::{MigrateError, Result};

/// Process-local store. Nothing survives the process.
pub struct MemoryCheckpointStore {
    run_id: String,
    retention: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    checkpoints: Vec<Checkpoint>,
    next_sequence: u64,
}

impl MemoryCheckpointStore {
    pub fn new(run_id: impl Into<String>, retention: usize) -> Self {
        Self {
            run_id: run_id.into(),
            retention: retention.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, mut checkpoint: Checkpoint) -> Result<String> {
        checkpoint.ensure_run(&self.run_id)?;
        let mut inner = self.inner.lock().await;
        checkpoint.sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let id = checkpoint.id.clone();
        inner.checkpoints.push(checkpoint);
        if inner.checkpoints.len() > self.retention {
            let excess = inner.checkpoints.len() - self.retention;
            inner.checkpoints.drain(..excess);
        }
        Ok(id)
    }

    async fn load(&self, id: &str) -> Result<Checkpoint> {
        let inner = self.inner.lock().await;
        inner
            .checkpoints
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| MigrateError::CheckpointNotFound(id.to_string()))
    }

    async fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.inner.lock().await.checkpoints.last().cloned())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.inner.lock().await.checkpoints.clone())
    }

    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_and_retention() {
        let store = MemoryCheckpointStore::new("run", 2);
        let first = store.save(Checkpoint::new("run", 1)).await.unwrap();
        store.save(Checkpoint::new("run", 2)).await.unwrap();
        store.save(Checkpoint::new("run", 3)).await.unwrap();

        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].sequence, 1);
        assert_eq!(store.latest().await.unwrap().unwrap().cursor, 3);
        assert!(matches!(
            store.load(&first).await,
            Err(MigrateError::CheckpointNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_foreign_run() {
        let store = MemoryCheckpointStore::new("run", 2);
        assert!(matches!(
            store.save(Checkpoint::new("other", 1)).await,
            Err(MigrateError::CheckpointMismatch { .. })
        ));
    }
}
