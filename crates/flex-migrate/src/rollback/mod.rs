//! Rollback log: every applied mutation, with enough data to undo it.
//!
//! Operations are append-only. Undoing one appends its inverse with
//! `reverts` set, so a log replayed from its journal knows what has already
//! been rolled back.

mod journal;
mod operation;
mod target;

pub use journal::Journal;
pub use operation::{Operation, OperationKind};
pub use target::{InMemoryTarget, MutationTarget};

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{RollbackConfig, RollbackMode};
use crate::error::{MigrateError, Result};
use crate::retry::{ErrorCategory, ErrorClassifier};

/// Operations recorded by one parallel worker, merged into the run log when
/// the worker finishes.
#[derive(Debug, Clone, Default)]
pub struct LogSegment {
    pub worker_id: usize,
    operations: Vec<Operation>,
}

impl LogSegment {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            operations: Vec::new(),
        }
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn extend(&mut self, operations: impl IntoIterator<Item = Operation>) {
        self.operations.extend(operations);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// An operation that was not undone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackFailure {
    pub operation_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

/// Outcome of [`OperationLog::rollback`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackReport {
    /// Mode actually used.
    pub mode: RollbackMode,
    /// Transactional was requested but the target does not support it.
    pub fell_back: bool,
    /// Ids of the operations undone, newest first.
    pub reverted: Vec<String>,
    /// Operations skipped because they could not safely invert.
    pub unsafe_ops: Vec<RollbackFailure>,
    /// Operations whose inverse failed on the target.
    pub failed: Vec<RollbackFailure>,
    /// Operations left untouched after an abort.
    pub not_attempted: Vec<String>,
    pub aborted: bool,
}

impl RollbackReport {
    fn new(mode: RollbackMode) -> Self {
        Self {
            mode,
            fell_back: false,
            reverted: Vec::new(),
            unsafe_ops: Vec::new(),
            failed: Vec::new(),
            not_attempted: Vec::new(),
            aborted: false,
        }
    }

    /// Every candidate was undone.
    pub fn is_complete(&self) -> bool {
        !self.aborted && self.failed.is_empty() && self.unsafe_ops.is_empty()
    }
}

/// The run's operation log, optionally mirrored to a journal file.
pub struct OperationLog {
    run_id: String,
    operations: Vec<Operation>,
    next_sequence: u64,
    journal: Option<Journal>,
    reverted: HashSet<String>,
    classifier: ErrorClassifier,
}

impl OperationLog {
    /// In-memory log for `run_id`.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            operations: Vec::new(),
            next_sequence: 0,
            journal: None,
            reverted: HashSet::new(),
            classifier: ErrorClassifier::new(),
        }
    }

    /// Log for `run_id`, restored from its journal when one is configured.
    pub fn open(run_id: impl Into<String>, config: &RollbackConfig) -> Result<Self> {
        let mut log = Self::new(run_id);
        if let Some(dir) = &config.journal {
            let (journal, existing) = Journal::open(Journal::path_for(dir, &log.run_id))?;
            for op in &existing {
                if let Some(original) = &op.reverts {
                    log.reverted.insert(original.clone());
                }
            }
            log.next_sequence = existing.iter().map(|op| op.sequence + 1).max().unwrap_or(0);
            log.operations = existing;
            log.journal = Some(journal);
        }
        Ok(log)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append an operation, assigning its sequence.
    pub fn record(&mut self, mut operation: Operation) -> Result<()> {
        operation.sequence = self.next_sequence;
        if let Some(journal) = &mut self.journal {
            journal.append(&operation)?;
        }
        self.next_sequence += 1;
        if let Some(original) = &operation.reverts {
            self.reverted.insert(original.clone());
        }
        self.operations.push(operation);
        Ok(())
    }

    /// Fresh segment for a parallel worker.
    pub fn segment(&self, worker_id: usize) -> LogSegment {
        LogSegment::new(worker_id)
    }

    /// Append a finished worker's operations. Returns how many were merged.
    pub fn merge(&mut self, segment: LogSegment) -> Result<usize> {
        let count = segment.operations.len();
        for op in segment.operations {
            self.record(op)?;
        }
        debug!("Merged {} operation(s) from worker {}", count, segment.worker_id);
        Ok(count)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn is_reverted(&self, operation_id: &str) -> bool {
        self.reverted.contains(operation_id)
    }

    /// Operations still to undo, newest first. `since` is inclusive.
    fn candidates(&self, since: Option<&str>) -> Result<Vec<Operation>> {
        let floor = match since {
            Some(id) => self
                .operations
                .iter()
                .find(|op| op.id == id)
                .map(|op| op.sequence)
                .ok_or_else(|| MigrateError::processing(format!("unknown operation {}", id)))?,
            None => 0,
        };
        Ok(self
            .operations
            .iter()
            .rev()
            .filter(|op| op.sequence >= floor)
            .filter(|op| op.reverts.is_none() && !self.reverted.contains(&op.id))
            .cloned()
            .collect())
    }

    /// Undo recorded operations newest-first, down to `since` (inclusive) or
    /// the start of the log.
    pub async fn rollback(
        &mut self,
        target: &dyn MutationTarget,
        since: Option<&str>,
        mode: RollbackMode,
    ) -> Result<RollbackReport> {
        let candidates = self.candidates(since)?;
        info!(
            "Rolling back {} operation(s) for run {} ({:?})",
            candidates.len(),
            self.run_id,
            mode
        );

        let report = match mode {
            RollbackMode::Transactional if target.supports_transactions() => {
                self.rollback_transactional(target, candidates).await?
            }
            RollbackMode::Transactional => {
                warn!("Target does not support transactions, falling back to manual rollback");
                let mut report = self.rollback_manual(target, candidates).await?;
                report.fell_back = true;
                report
            }
            RollbackMode::Manual => self.rollback_manual(target, candidates).await?,
        };

        info!(
            "Rollback finished: {} reverted, {} unsafe, {} failed, {} not attempted",
            report.reverted.len(),
            report.unsafe_ops.len(),
            report.failed.len(),
            report.not_attempted.len()
        );
        Ok(report)
    }

    async fn rollback_manual(
        &mut self,
        target: &dyn MutationTarget,
        candidates: Vec<Operation>,
    ) -> Result<RollbackReport> {
        let mut report = RollbackReport::new(RollbackMode::Manual);
        let mut remaining = candidates.into_iter();

        while let Some(op) = remaining.next() {
            let inverse = match op.inverse() {
                Ok(inverse) => inverse,
                Err(e) => {
                    warn!("{}", e);
                    report.unsafe_ops.push(unsafe_failure(&op, e));
                    continue;
                }
            };

            match apply(target, &inverse).await {
                Ok(()) => {
                    self.record(inverse)?;
                    report.reverted.push(op.id);
                }
                Err(e) => {
                    let category = self.classifier.classify(&e);
                    warn!("Failed to undo {} {} ({}): {}", op.kind, op.id, category, e);
                    report.failed.push(RollbackFailure {
                        operation_id: op.id,
                        reason: e.to_string(),
                        category: Some(category),
                    });
                    if !category.is_recoverable() {
                        report.aborted = true;
                        report.not_attempted = remaining.map(|op| op.id).collect();
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn rollback_transactional(
        &mut self,
        target: &dyn MutationTarget,
        candidates: Vec<Operation>,
    ) -> Result<RollbackReport> {
        let mut report = RollbackReport::new(RollbackMode::Transactional);
        let mut applied: Vec<(String, Operation)> = Vec::new();
        target.begin().await?;

        let mut remaining = candidates.into_iter();
        while let Some(op) = remaining.next() {
            let inverse = match op.inverse() {
                Ok(inverse) => inverse,
                Err(e) => {
                    warn!("{}", e);
                    report.unsafe_ops.push(unsafe_failure(&op, e));
                    continue;
                }
            };

            if let Err(e) = apply(target, &inverse).await {
                let category = self.classifier.classify(&e);
                warn!(
                    "Failed to undo {} {} ({}), aborting transaction: {}",
                    op.kind, op.id, category, e
                );
                if let Err(abort_err) = target.abort().await {
                    warn!("Transaction abort failed: {}", abort_err);
                }
                report.failed.push(RollbackFailure {
                    operation_id: op.id,
                    reason: e.to_string(),
                    category: Some(category),
                });
                report.not_attempted = applied
                    .into_iter()
                    .map(|(id, _)| id)
                    .chain(remaining.map(|op| op.id))
                    .collect();
                report.aborted = true;
                return Ok(report);
            }
            applied.push((op.id, inverse));
        }

        target.commit().await?;
        for (id, inverse) in applied {
            self.record(inverse)?;
            report.reverted.push(id);
        }
        Ok(report)
    }
}

fn unsafe_failure(op: &Operation, error: MigrateError) -> RollbackFailure {
    RollbackFailure {
        operation_id: op.id.clone(),
        reason: error.to_string(),
        category: None,
    }
}

async fn apply(target: &dyn MutationTarget, op: &Operation) -> Result<()> {
    match op.kind {
        OperationKind::Insert => {
            let image = op.after.as_ref().ok_or_else(|| MigrateError::RollbackUnsafe {
                operation_id: op.id.clone(),
                reason: "insert has no image".to_string(),
            })?;
            target.insert(&op.collection, &op.key, image).await
        }
        OperationKind::Update => {
            let image = op.after.as_ref().ok_or_else(|| MigrateError::RollbackUnsafe {
                operation_id: op.id.clone(),
                reason: "update has no image".to_string(),
            })?;
            target.update(&op.collection, &op.key, image).await
        }
        OperationKind::Delete => target.delete(&op.collection, &op.key).await,
    }
}
