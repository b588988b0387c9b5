//! Progress sinks.

use tokio::sync::mpsc;
use tracing::info;

use super::ProgressSnapshot;
use crate::error::{MigrateError, Result};

/// Receives throttled progress snapshots.
///
/// Errors and panics are logged by the aggregator and never interrupt the run.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, snapshot: &ProgressSnapshot) -> Result<()>;
}

/// Writes the progress line through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        info!("{}", snapshot.line());
        Ok(())
    }
}

/// Forwards snapshots over a bounded channel without waiting.
///
/// A full channel drops the snapshot and reports an error.
impl ProgressSink for mpsc::Sender<ProgressSnapshot> {
    fn emit(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        self.try_send(snapshot.clone())
            .map_err(|e| MigrateError::processing(format!("progress channel: {}", e)))
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressSnapshot> {
    fn emit(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        self.send(snapshot.clone())
            .map_err(|e| MigrateError::processing(format!("progress channel: {}", e)))
    }
}
