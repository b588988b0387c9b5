//! Batch executor: decode, process, record, checkpoint, report.
//!
//! The default loop is sequential and preserves source order. With
//! `batch.parallel` the coordinator hands partitions to a worker pool (see
//! [`parallel`]) and stays the single checkpoint writer.

mod parallel;
mod range;
mod report;

pub use crate::progress::BatchResult;
pub use range::RangeTracker;
pub use report::{RunReport, RunStatus};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{open_store, Checkpoint, CheckpointStore};
use crate::config::{BatchConfig, Config};
use crate::core::{Provenance, Record};
use crate::decoder::Decoder;
use crate::error::{MigrateError, Result};
use crate::memory::MemoryGovernor;
use crate::progress::ProgressAggregator;
use crate::retry::{ItemFailure, PartialOutcome, RetryController};
use crate::rollback::{LogSegment, Operation, OperationLog};

/// Failures kept in the run report.
const MAX_REPORTED_FAILURES: usize = 100;

/// Applies one record to the destination.
///
/// Returns the mutations it applied so they can be rolled back. The call may
/// be retried, so implementations should tolerate re-delivery of a record
/// whose previous attempt failed. A call cut short by a batch timeout is
/// dropped, and anything it applied before returning is not logged.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: Record) -> Result<Vec<Operation>>;
}

/// One slot of a batch: a record, or a record the decoder could not parse.
#[derive(Debug, Clone)]
enum BatchItem {
    Record(Record),
    Malformed {
        message: String,
        provenance: Provenance,
    },
}

impl BatchItem {
    fn provenance(&self) -> &Provenance {
        match self {
            BatchItem::Record(record) => record.provenance(),
            BatchItem::Malformed { provenance, .. } => provenance,
        }
    }
}

struct BatchOutcome {
    /// Items consumed, counted from the start of the batch.
    processed: usize,
    success_count: u64,
    operations: Vec<Operation>,
    failures: Vec<ItemFailure>,
    /// The failure-ratio breaker tripped inside this batch.
    tripped: bool,
    duration: Duration,
}

impl BatchOutcome {
    fn failure_count(&self) -> u64 {
        self.failures.len() as u64
    }
}

/// Counters persisted in checkpoints.
#[derive(Debug, Clone, Default, PartialEq)]
struct Tally {
    cursor: u64,
    success: u64,
    failure: u64,
    batch_index: u64,
}

/// Commits completed batch ranges in cursor order.
///
/// Counts only join the tally once every earlier record has completed, so a
/// checkpoint never claims work beyond its cursor.
struct Ledger {
    tracker: RangeTracker,
    pending: BTreeMap<u64, (u64, u64)>,
    tally: Tally,
}

impl Ledger {
    fn new(tally: Tally) -> Self {
        Self {
            tracker: RangeTracker::new(tally.cursor),
            pending: BTreeMap::new(),
            tally,
        }
    }

    /// Record a completed range. Returns the committed cursor before the call.
    fn complete(&mut self, start: u64, processed: u64, success: u64, failure: u64) -> u64 {
        let before = self.tally.cursor;
        self.tracker.add_range(start, start + processed);
        self.pending.insert(start, (success, failure));

        let safe = self.tracker.cursor();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() >= safe {
                break;
            }
            let (success, failure) = entry.remove();
            self.tally.success += success;
            self.tally.failure += failure;
            self.tally.batch_index += 1;
        }
        self.tally.cursor = safe;
        before
    }
}

/// Why a loop stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Exhausted,
    Cancelled,
}

/// Pull up to `size` items. Malformed records take a slot and stay in order.
fn pull_batch<D: Decoder + ?Sized>(decoder: &mut D, size: usize) -> Result<Vec<BatchItem>> {
    let mut items = Vec::with_capacity(size);
    while items.len() < size {
        match decoder.next_record() {
            Ok(Some(record)) => items.push(BatchItem::Record(record)),
            Ok(None) => break,
            Err(MigrateError::Decode {
                message,
                provenance,
            }) => items.push(BatchItem::Malformed {
                message,
                provenance,
            }),
            Err(e) => return Err(e),
        }
    }
    Ok(items)
}

/// Operations applied so far in one batch, keyed by item index.
///
/// Filled as each record finishes, so a timed-out attempt keeps what it applied.
type Applied = Arc<Mutex<BTreeMap<usize, Vec<Operation>>>>;

fn lock_applied(applied: &Applied) -> MutexGuard<'_, BTreeMap<usize, Vec<Operation>>> {
    applied.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One pass over the items not yet applied, bounded by `timeout`.
///
/// Returns the batch indexes attempted with their outcome.
async fn attempt_batch(
    retry: &RetryController,
    processor: &Arc<dyn RecordProcessor>,
    items: &[BatchItem],
    applied: &Applied,
    max_failure_ratio: f64,
    timeout: Option<Duration>,
    batch_index: u64,
) -> Result<(Vec<usize>, PartialOutcome<()>)> {
    let remaining: Vec<(usize, BatchItem)> = {
        let done = lock_applied(applied);
        items
            .iter()
            .enumerate()
            .filter(|(index, _)| !done.contains_key(index))
            .map(|(index, item)| (index, item.clone()))
            .collect()
    };
    let indexes: Vec<usize> = remaining.iter().map(|(index, _)| *index).collect();

    let work = retry.process_with_partial_failures(
        &remaining,
        |(index, item): (usize, BatchItem)| {
            let processor = Arc::clone(processor);
            let applied = Arc::clone(applied);
            async move {
                let operations = match item {
                    BatchItem::Record(record) => processor.process(record).await?,
                    BatchItem::Malformed {
                        message,
                        provenance,
                    } => return Err(MigrateError::decode(message, provenance)),
                };
                lock_applied(&applied).insert(index, operations);
                Ok(())
            }
        },
        max_failure_ratio,
    );

    let partial = match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| MigrateError::BatchTimeout {
                batch_index,
                timeout: limit,
            })?,
        None => work.await,
    };
    Ok((indexes, partial))
}

/// Run one batch through the retry controller.
///
/// With a timeout, a timed-out pass is a recoverable failure of the whole
/// batch: it is retried with backoff over the records not yet applied. Once
/// attempts run out those records count as failures.
async fn execute_batch(
    retry: &RetryController,
    processor: &Arc<dyn RecordProcessor>,
    items: &[BatchItem],
    max_failure_ratio: f64,
    timeout: Option<Duration>,
    batch_index: u64,
) -> BatchOutcome {
    let started = Instant::now();
    let applied: Applied = Arc::new(Mutex::new(BTreeMap::new()));

    let attempted = match timeout {
        Some(_) => retry
            .execute_with_retry(|| {
                attempt_batch(
                    retry,
                    processor,
                    items,
                    &applied,
                    max_failure_ratio,
                    timeout,
                    batch_index,
                )
            })
            .await
            .map(|retried| retried.value),
        None => {
            attempt_batch(
                retry,
                processor,
                items,
                &applied,
                max_failure_ratio,
                None,
                batch_index,
            )
            .await
        }
    };
    let applied = std::mem::take(&mut *lock_applied(&applied));

    let (processed, failures, tripped) = match attempted {
        Ok((indexes, partial)) => {
            let failures = partial
                .failures
                .into_iter()
                .map(|mut failure| {
                    failure.index = indexes.get(failure.index).copied().unwrap_or(failure.index);
                    if failure.provenance.is_none() {
                        failure.provenance =
                            items.get(failure.index).map(|i| i.provenance().clone());
                    }
                    failure
                })
                .collect();
            // Everything before the first unattempted index has been settled.
            let processed = indexes.get(partial.processed).copied().unwrap_or(items.len());
            (processed, failures, partial.aborted)
        }
        Err(err) => {
            let category = retry.classify(&err);
            let failures: Vec<ItemFailure> = items
                .iter()
                .enumerate()
                .filter(|(index, _)| !applied.contains_key(index))
                .map(|(index, item)| ItemFailure {
                    index,
                    category,
                    message: err.to_string(),
                    provenance: Some(item.provenance().clone()),
                })
                .collect();
            warn!(
                "Batch {}: {}, counting {} record(s) as failed",
                batch_index,
                err,
                failures.len()
            );
            (items.len(), failures, false)
        }
    };

    BatchOutcome {
        processed,
        success_count: applied.len() as u64,
        operations: applied.into_values().flatten().collect(),
        failures,
        tripped,
        duration: started.elapsed(),
    }
}

/// A batch that finished, from the sequential loop or a worker.
struct Completed {
    index: u64,
    start: u64,
    worker_id: Option<usize>,
    outcome: BatchOutcome,
    segment: LogSegment,
}

/// Drives a decoder through a [`RecordProcessor`] in governed batches.
pub struct BatchExecutor {
    run_id: String,
    batch: BatchConfig,
    max_failure_ratio: f64,
    governor: MemoryGovernor,
    retry: Arc<RetryController>,
    store: Arc<dyn CheckpointStore>,
    log: OperationLog,
    progress: ProgressAggregator,
    cancel: CancellationToken,
    failures: Vec<ItemFailure>,
    last_checkpoint: Option<String>,
}

impl BatchExecutor {
    pub fn new(
        config: &Config,
        run_id: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        log: OperationLog,
    ) -> Self {
        let max_failure_ratio = if config.batch.continue_on_error {
            config.retry.max_failure_ratio
        } else {
            0.0
        };
        Self {
            run_id: run_id.into(),
            batch: config.batch.clone(),
            max_failure_ratio,
            governor: MemoryGovernor::new(&config.memory, &config.batch),
            retry: Arc::new(RetryController::new(&config.retry)),
            store,
            log,
            progress: ProgressAggregator::new(config.progress.clone()),
            cancel: CancellationToken::new(),
            failures: Vec::new(),
            last_checkpoint: None,
        }
    }

    /// Executor with the checkpoint store and operation log the config describes.
    pub fn from_config(config: &Config) -> Result<Self> {
        let run_id = config.resolve_run_id();
        let store = open_store(&config.checkpoint, &run_id, &config.hash())?;
        let log = OperationLog::open(run_id.clone(), &config.rollback)?;
        info!(
            "Run {} using {} checkpoint store",
            run_id,
            store.store_type()
        );
        Ok(Self::new(config, run_id, store, log))
    }

    pub fn with_governor(mut self, governor: MemoryGovernor) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_progress(mut self, progress: ProgressAggregator) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the run at the next batch boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut OperationLog {
        &mut self.log
    }

    pub fn into_log(self) -> OperationLog {
        self.log
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }

    pub fn governor_mut(&mut self) -> &mut MemoryGovernor {
        &mut self.governor
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    /// Run from the decoder's current position.
    pub async fn run<D: Decoder + ?Sized>(
        &mut self,
        decoder: &mut D,
        processor: Arc<dyn RecordProcessor>,
    ) -> Result<RunReport> {
        self.execute(decoder, processor, None).await
    }

    /// Resume from a stored checkpoint (`None` for the latest).
    ///
    /// `decoder` must be freshly opened on the same source.
    pub async fn resume<D: Decoder + ?Sized>(
        &mut self,
        decoder: &mut D,
        processor: Arc<dyn RecordProcessor>,
        checkpoint_id: Option<&str>,
    ) -> Result<RunReport> {
        let checkpoint = match checkpoint_id {
            Some(id) => self.store.load(id).await?,
            None => self.store.latest().await?.ok_or_else(|| {
                MigrateError::CheckpointNotFound(format!("latest for run {}", self.run_id))
            })?,
        };
        self.execute(decoder, processor, Some(checkpoint)).await
    }

    /// Resume from a checkpoint the caller already holds.
    pub async fn resume_from<D: Decoder + ?Sized>(
        &mut self,
        decoder: &mut D,
        processor: Arc<dyn RecordProcessor>,
        checkpoint: Checkpoint,
    ) -> Result<RunReport> {
        self.execute(decoder, processor, Some(checkpoint)).await
    }

    async fn execute<D: Decoder + ?Sized>(
        &mut self,
        decoder: &mut D,
        processor: Arc<dyn RecordProcessor>,
        checkpoint: Option<Checkpoint>,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        self.failures.clear();

        let mut tally = Tally::default();
        let mut resumed_from = None;
        if let Some(cp) = checkpoint {
            cp.ensure_run(&self.run_id)?;
            info!(
                "Resuming run {} from checkpoint {} at record {} ({} ok, {} failed)",
                self.run_id, cp.id, cp.cursor, cp.success_count, cp.failure_count
            );
            decoder.skip_to(cp.cursor)?;
            tally = Tally {
                cursor: cp.cursor,
                success: cp.success_count,
                failure: cp.failure_count,
                batch_index: cp.current_batch_index,
            };
            self.progress.resume_from(cp.success_count, cp.failure_count);
            self.last_checkpoint = Some(cp.id.clone());
            resumed_from = Some(cp.id);
        }

        let entity = decoder.entity_hint().unwrap_or("records").to_string();
        let total = decoder.estimated_total();
        self.progress.set_total(total);
        let initial_cursor = tally.cursor;
        let operations_before = self.log.len();
        let mut ledger = Ledger::new(tally);

        info!(
            "Starting run {} ({} mode, batch size {})",
            self.run_id,
            if self.batch.parallel { "parallel" } else { "sequential" },
            self.governor.batch_size()
        );

        let outcome = if self.batch.parallel {
            self.run_parallel(decoder, processor, &entity, total, &mut ledger)
                .await
        } else {
            self.run_sequential(decoder, processor, &entity, total, &mut ledger)
                .await
        };

        let status = match outcome {
            Ok(Stop::Exhausted) => RunStatus::Completed,
            Ok(Stop::Cancelled) => RunStatus::Cancelled,
            Err(e) => {
                if let Err(save_err) = self.checkpoint(&ledger.tally, total).await {
                    warn!("Failed to save final checkpoint: {}", save_err);
                }
                let reason = match e {
                    MigrateError::Aborted { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!("Run {} aborted: {}", self.run_id, reason);
                self.progress.finish();
                return Err(MigrateError::Aborted {
                    reason,
                    last_checkpoint: self.last_checkpoint.clone(),
                });
            }
        };

        self.checkpoint(&ledger.tally, total).await?;
        self.progress.finish();

        let tally = ledger.tally;
        let duration = start.elapsed().as_secs_f64();
        let consumed = tally.cursor - initial_cursor;
        let report = RunReport {
            run_id: self.run_id.clone(),
            status,
            duration_seconds: duration,
            started_at,
            completed_at: Utc::now(),
            resumed_from,
            cursor: tally.cursor,
            success_count: tally.success,
            failure_count: tally.failure,
            batches: tally.batch_index,
            operations: self.log.len() - operations_before,
            records_per_second: if duration > 0.0 {
                consumed as f64 / duration
            } else {
                0.0
            },
            last_checkpoint: self.last_checkpoint.clone(),
            failures: self.failures.clone(),
            retry: self.retry.stats(),
            memory: self.governor.state(),
        };
        info!(
            "Run {} {:?}: {} ok, {} failed, {:.0} records/s",
            report.run_id,
            report.status,
            report.success_count,
            report.failure_count,
            report.records_per_second
        );
        Ok(report)
    }

    async fn run_sequential<D: Decoder + ?Sized>(
        &mut self,
        decoder: &mut D,
        processor: Arc<dyn RecordProcessor>,
        entity: &str,
        total: Option<u64>,
        ledger: &mut Ledger,
    ) -> Result<Stop> {
        let timeout = self.batch.batch_timeout();
        loop {
            if self.cancel.is_cancelled() {
                info!(
                    "Cancellation requested, stopping at record {}",
                    ledger.tally.cursor
                );
                return Ok(Stop::Cancelled);
            }

            self.governor.sample();
            let items = pull_batch(decoder, self.governor.batch_size())?;
            if items.is_empty() {
                return Ok(Stop::Exhausted);
            }

            let index = ledger.tally.batch_index;
            let mut outcome = execute_batch(
                &self.retry,
                &processor,
                &items,
                self.max_failure_ratio,
                timeout,
                index,
            )
            .await;
            let mut segment = self.log.segment(0);
            segment.extend(std::mem::take(&mut outcome.operations));

            let completed = Completed {
                index,
                start: ledger.tally.cursor,
                worker_id: None,
                outcome,
                segment,
            };
            if let Some(reason) = self.absorb(completed, entity, total, ledger).await? {
                return Err(MigrateError::Aborted {
                    reason,
                    last_checkpoint: None,
                });
            }
        }
    }

    /// Fold a completed batch into the log, ledger and progress, checkpointing
    /// when the committed cursor crosses an interval boundary.
    ///
    /// Returns the breaker reason when the batch tripped it.
    async fn absorb(
        &mut self,
        completed: Completed,
        entity: &str,
        total: Option<u64>,
        ledger: &mut Ledger,
    ) -> Result<Option<String>> {
        let Completed {
            index,
            start,
            worker_id,
            outcome,
            segment,
        } = completed;

        self.log.merge(segment)?;

        let failure_count = outcome.failure_count();
        for mut failure in outcome.failures {
            failure.index += start as usize;
            if self.failures.len() < MAX_REPORTED_FAILURES {
                self.failures.push(failure);
            }
        }

        let before = ledger.complete(
            start,
            outcome.processed as u64,
            outcome.success_count,
            failure_count,
        );

        let mut result = BatchResult::new(
            index,
            entity,
            outcome.success_count,
            failure_count,
            outcome.duration,
        );
        if let Some(worker_id) = worker_id {
            result = result.on_worker(worker_id);
        }
        debug!(
            "Batch {} done: {} ok, {} failed in {:?}",
            index, result.success_count, result.failure_count, result.duration
        );
        self.progress.record(&result);

        let interval = self.batch.checkpoint_interval;
        if interval > 0 && ledger.tally.cursor / interval > before / interval {
            self.checkpoint(&ledger.tally, total).await?;
        }

        if outcome.tripped {
            return Ok(Some(format!(
                "failure ratio exceeded {:.3} in batch {}",
                self.max_failure_ratio, index
            )));
        }
        Ok(None)
    }

    async fn checkpoint(&mut self, tally: &Tally, total: Option<u64>) -> Result<String> {
        let mut checkpoint = Checkpoint::new(self.run_id.clone(), tally.cursor);
        checkpoint.success_count = tally.success;
        checkpoint.failure_count = tally.failure;
        checkpoint.current_batch_index = tally.batch_index;
        checkpoint.total_batches =
            total.map(|t| t.div_ceil(self.governor.batch_size().max(1) as u64));
        checkpoint.memory = Some(self.governor.state());

        let id = self.store.save(checkpoint).await?;
        debug!("Checkpoint {} at record {}", id, tally.cursor);
        self.last_checkpoint = Some(id.clone());
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::DecoderConfig;
    use crate::decoder::TabularDecoder;
    use crate::memory::FixedProbe;
    use crate::rollback::{InMemoryTarget, MutationTarget};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Inserts each record into `users`; ids listed in `reject` fail fatally,
    /// `slow` sleeps past any timeout for its first `slow_times` deliveries,
    /// `cancel_after` cancels once seen.
    struct Loader {
        target: Arc<InMemoryTarget>,
        reject: Vec<String>,
        slow: Option<String>,
        slow_times: usize,
        delayed: AtomicUsize,
        cancel_after: Option<(String, CancellationToken)>,
    }

    impl Loader {
        fn new(target: Arc<InMemoryTarget>) -> Self {
            Self {
                target,
                reject: Vec::new(),
                slow: None,
                slow_times: usize::MAX,
                delayed: AtomicUsize::new(0),
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl RecordProcessor for Loader {
        async fn process(&self, record: Record) -> Result<Vec<Operation>> {
            let key = record.get("id").unwrap_or_default().to_string();
            if self.reject.contains(&key) {
                return Err(MigrateError::processing("invalid data in record"));
            }
            if self.slow.as_deref() == Some(key.as_str())
                && self.delayed.fetch_add(1, Ordering::SeqCst) < self.slow_times
            {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            let image = record.to_json();
            self.target.insert("users", &key, &image).await?;
            if let Some((id, token)) = &self.cancel_after {
                if *id == key {
                    token.cancel();
                }
            }
            Ok(vec![Operation::insert("users", key, image)])
        }
    }

    fn csv(rows: usize) -> TabularDecoder<Cursor<Vec<u8>>> {
        let mut data = String::from("id,name\n");
        for i in 1..=rows {
            data.push_str(&format!("{},name{}\n", i, i));
        }
        let decoder_config = DecoderConfig {
            delimiter: Some(','),
            has_header: Some(true),
            ..DecoderConfig::default()
        };
        TabularDecoder::from_reader(
            Cursor::new(data.into_bytes()),
            &decoder_config,
            Some("users".to_string()),
        )
        .unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.batch.batch_size = 10;
        config.batch.min_batch_size = 5;
        config.batch.max_batch_size = 50;
        config.batch.checkpoint_interval = 10;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config
    }

    fn executor(config: &Config, store: Arc<dyn CheckpointStore>) -> BatchExecutor {
        let governor = MemoryGovernor::with_probe(
            &config.memory,
            &config.batch,
            Box::new(FixedProbe(0)),
        );
        BatchExecutor::new(config, "run-1", store, OperationLog::new("run-1"))
            .with_governor(governor)
    }

    fn memory_store() -> Arc<dyn CheckpointStore> {
        Arc::new(MemoryCheckpointStore::new("run-1", 10))
    }

    #[test]
    fn test_ledger_commits_contiguous_prefix() {
        let mut ledger = Ledger::new(Tally::default());
        ledger.complete(10, 10, 9, 1);
        assert_eq!(ledger.tally.cursor, 0);
        assert_eq!(ledger.tally.success, 0);

        ledger.complete(0, 10, 10, 0);
        assert_eq!(ledger.tally.cursor, 20);
        assert_eq!(ledger.tally.success, 19);
        assert_eq!(ledger.tally.failure, 1);
        assert_eq!(ledger.tally.batch_index, 2);
    }

    #[tokio::test]
    async fn test_sequential_run_completes() {
        let config = config();
        let store = memory_store();
        let target = Arc::new(InMemoryTarget::new());
        let mut exec = executor(&config, store.clone());

        let report = exec
            .run(&mut csv(25), Arc::new(Loader::new(target.clone())))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.success_count, 25);
        assert_eq!(report.failure_count, 0);
        assert_eq!(report.batches, 3);
        assert_eq!(report.operations, 25);
        assert_eq!(target.count("users"), 25);

        // Interval crossings at 10 and 20, plus the final checkpoint.
        let checkpoints = store.list().await.unwrap();
        assert_eq!(checkpoints.len(), 3);
        let cursors: Vec<u64> = checkpoints.iter().map(|c| c.cursor).collect();
        assert_eq!(cursors, vec![10, 20, 25]);
        assert_eq!(report.last_checkpoint.as_deref(), Some(checkpoints[2].id.as_str()));
        assert_eq!(exec.progress().snapshot().processed, 25);
    }

    #[tokio::test]
    async fn test_failures_recorded_with_position() {
        let config = config();
        let target = Arc::new(InMemoryTarget::new());
        let mut loader = Loader::new(target.clone());
        loader.reject.push("5".to_string());
        let mut exec = executor(&config, memory_store());

        let report = exec.run(&mut csv(25), Arc::new(loader)).await.unwrap();
        assert_eq!(report.success_count, 24);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.failures[0].index, 4);
        assert_eq!(
            report.failures[0].provenance.as_ref().map(|p| p.record_number),
            Some(4)
        );
        assert!(report.to_json().unwrap().contains("invalid_data_format"));
    }

    #[tokio::test]
    async fn test_breaker_aborts_with_checkpoint() {
        let mut config = config();
        config.batch.continue_on_error = false;
        config.retry.sub_batch_size = 2;
        let store = memory_store();
        let target = Arc::new(InMemoryTarget::new());
        let mut loader = Loader::new(target.clone());
        loader.reject.push("5".to_string());
        let mut exec = executor(&config, store.clone());

        let err = exec.run(&mut csv(25), Arc::new(loader)).await.unwrap_err();
        let last = match err {
            MigrateError::Aborted {
                last_checkpoint, ..
            } => last_checkpoint.unwrap(),
            other => panic!("unexpected error: {other}"),
        };

        let checkpoint = store.load(&last).await.unwrap();
        assert_eq!(checkpoint.cursor, 6);
        assert_eq!(checkpoint.success_count, 5);
        assert_eq!(checkpoint.failure_count, 1);
        // The aborted batch's applied records are still logged for rollback.
        assert_eq!(exec.log().len(), 5);
        assert_eq!(target.count("users"), 5);
    }

    #[tokio::test]
    async fn test_cancellation_stops_at_batch_boundary() {
        let config = config();
        let store = memory_store();
        let target = Arc::new(InMemoryTarget::new());
        let token = CancellationToken::new();
        let mut loader = Loader::new(target.clone());
        loader.cancel_after = Some(("3".to_string(), token.clone()));
        let mut exec = executor(&config, store.clone()).with_cancellation(token);

        let report = exec.run(&mut csv(25), Arc::new(loader)).await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        // The batch in flight finishes.
        assert_eq!(report.cursor, 10);
        assert_eq!(target.count("users"), 10);
        assert_eq!(store.latest().await.unwrap().unwrap().cursor, 10);

        // Resume with a fresh token and decoder.
        let mut exec = executor(&config, store.clone());
        let report = exec
            .resume(&mut csv(25), Arc::new(Loader::new(target.clone())), None)
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.success_count, 25);
        assert_eq!(report.operations, 15);
        assert!(report.resumed_from.is_some());
        assert_eq!(target.count("users"), 25);
    }

    #[tokio::test]
    async fn test_resume_rejects_foreign_checkpoint() {
        let config = config();
        let target = Arc::new(InMemoryTarget::new());
        let mut exec = executor(&config, memory_store());
        let result = exec
            .resume_from(
                &mut csv(5),
                Arc::new(Loader::new(target)),
                Checkpoint::new("other-run", 2),
            )
            .await;
        assert!(matches!(result, Err(MigrateError::CheckpointMismatch { .. })));
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint() {
        let config = config();
        let target = Arc::new(InMemoryTarget::new());
        let mut exec = executor(&config, memory_store());
        let result = exec
            .resume(&mut csv(5), Arc::new(Loader::new(target)), None)
            .await;
        assert!(matches!(result, Err(MigrateError::CheckpointNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_fails_only_that_batch() {
        let mut config = config();
        config.batch.batch_timeout_secs = Some(1);
        config.retry.max_attempts = 2;
        let target = Arc::new(InMemoryTarget::new());
        let mut loader = Loader::new(target.clone());
        loader.slow = Some("3".to_string());
        let mut exec = executor(&config, memory_store());

        let report = exec.run(&mut csv(25), Arc::new(loader)).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        // Records 1 and 2 were applied before the first timeout.
        assert_eq!(report.success_count, 17);
        assert_eq!(report.failure_count, 8);
        assert_eq!(report.failures[0].index, 2);
        assert!(report.failures[0].message.contains("timed out"));
        assert_eq!(report.retry.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_retried_until_success() {
        let mut config = config();
        config.batch.batch_timeout_secs = Some(1);
        let target = Arc::new(InMemoryTarget::new());
        let mut loader = Loader::new(target.clone());
        loader.slow = Some("3".to_string());
        loader.slow_times = 1;
        let mut exec = executor(&config, memory_store());

        let report = exec.run(&mut csv(25), Arc::new(loader)).await.unwrap();
        assert_eq!(report.success_count, 25);
        assert_eq!(report.failure_count, 0);
        assert_eq!(report.retry.recovered, 1);
        // The retry skips the records the timed-out pass already applied.
        assert_eq!(target.count("users"), 25);
        assert_eq!(exec.log().len(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_batch_rolls_back_fully() {
        let mut config = config();
        config.batch.batch_timeout_secs = Some(1);
        config.retry.max_attempts = 1;
        let target = Arc::new(InMemoryTarget::new());
        let mut loader = Loader::new(target.clone());
        loader.slow = Some("3".to_string());
        let mut exec = executor(&config, memory_store());

        let report = exec.run(&mut csv(25), Arc::new(loader)).await.unwrap();
        assert_eq!(report.failure_count, 8);
        assert_eq!(exec.log().len(), target.count("users"));
        assert_eq!(report.operations, target.count("users"));

        let mut log = exec.into_log();
        log.rollback(target.as_ref() as &dyn MutationTarget, None, config.rollback.mode)
            .await
            .unwrap();
        assert_eq!(target.count("users"), 0);
    }

    #[tokio::test]
    async fn test_malformed_records_count_as_failures() {
        let config = config();
        let target = Arc::new(InMemoryTarget::new());
        let data = "id,name\n1,a\n2,b,extra,more,fields\n3,c\n";
        let decoder_config = DecoderConfig {
            delimiter: Some(','),
            has_header: Some(true),
            column_tolerance: Some(1),
            ..DecoderConfig::default()
        };
        let mut decoder = TabularDecoder::from_reader(
            Cursor::new(data.as_bytes().to_vec()),
            &decoder_config,
            None,
        )
        .unwrap();
        let mut exec = executor(&config, memory_store());

        let report = exec
            .run(&mut decoder, Arc::new(Loader::new(target.clone())))
            .await
            .unwrap();
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(target.count("users"), 2);
    }

    #[tokio::test]
    async fn test_rollback_after_run() {
        let config = config();
        let target = Arc::new(InMemoryTarget::new());
        let mut exec = executor(&config, memory_store());
        exec.run(&mut csv(12), Arc::new(Loader::new(target.clone())))
            .await
            .unwrap();

        let mut log = exec.into_log();
        let report = log
            .rollback(target.as_ref() as &dyn MutationTarget, None, config.rollback.mode)
            .await
            .unwrap();
        assert_eq!(report.reverted.len(), 12);
        assert_eq!(target.count("users"), 0);
    }
}
