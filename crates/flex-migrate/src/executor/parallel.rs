//! Parallel partition execution.
//!
//! The coordinator reads partitions from the decoder and dispatches them over
//! a bounded `async-channel` to a fixed pool of tokio workers. Each worker
//! runs its partition through the retry controller, collects the applied
//! operations in its own [`LogSegment`], and reports back over an unbounded
//! channel so it never blocks on the coordinator. The coordinator merges
//! results in completion order and is the only checkpoint writer.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    execute_batch, pull_batch, BatchExecutor, BatchItem, Completed, Ledger, RecordProcessor, Stop,
};
use crate::decoder::Decoder;
use crate::error::{MigrateError, Result};
use crate::rollback::LogSegment;

/// A contiguous slice of the source handed to one worker.
struct Partition {
    index: u64,
    start: u64,
    items: Vec<BatchItem>,
}

impl BatchExecutor {
    pub(super) async fn run_parallel<D: Decoder + ?Sized>(
        &mut self,
        decoder: &mut D,
        processor: Arc<dyn RecordProcessor>,
        entity: &str,
        total: Option<u64>,
        ledger: &mut Ledger,
    ) -> Result<Stop> {
        let workers = self.batch.get_workers().max(1);
        let timeout = self.batch.batch_timeout();
        let (work_tx, work_rx) = async_channel::bounded::<Partition>(workers * 2);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completed>();
        info!("Starting {} worker(s)", workers);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = work_rx.clone();
            let tx = done_tx.clone();
            let retry = Arc::clone(&self.retry);
            let processor = Arc::clone(&processor);
            let max_failure_ratio = self.max_failure_ratio;

            handles.push(tokio::spawn(async move {
                let mut partitions = 0u64;
                while let Ok(partition) = rx.recv().await {
                    let mut outcome = execute_batch(
                        &retry,
                        &processor,
                        &partition.items,
                        max_failure_ratio,
                        timeout,
                        partition.index,
                    )
                    .await;

                    let mut segment = LogSegment::new(worker_id);
                    segment.extend(std::mem::take(&mut outcome.operations));
                    partitions += 1;

                    let completed = Completed {
                        index: partition.index,
                        start: partition.start,
                        worker_id: Some(worker_id),
                        outcome,
                        segment,
                    };
                    if tx.send(completed).is_err() {
                        break;
                    }
                }
                debug!("Worker {} finished after {} partition(s)", worker_id, partitions);
            }));
        }
        // Workers hold the only remaining handles; the channels close with them.
        drop(work_rx);
        drop(done_tx);

        let mut next_index = ledger.tally.batch_index;
        let mut next_cursor = ledger.tally.cursor;
        let mut outstanding = 0usize;
        let mut stop = Stop::Exhausted;
        let mut tripped: Option<String> = None;
        let mut failed: Option<MigrateError> = None;

        loop {
            while let Ok(completed) = done_rx.try_recv() {
                outstanding -= 1;
                self.absorb_or_trip(completed, entity, total, ledger, &mut tripped, &mut failed)
                    .await;
            }
            if tripped.is_some() || failed.is_some() {
                break;
            }
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, draining {} partition(s)", outstanding);
                stop = Stop::Cancelled;
                break;
            }

            self.governor.sample();
            let items = match pull_batch(decoder, self.governor.batch_size()) {
                Ok(items) => items,
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            };
            if items.is_empty() {
                break;
            }

            let len = items.len() as u64;
            let partition = Partition {
                index: next_index,
                start: next_cursor,
                items,
            };
            if work_tx.send(partition).await.is_err() {
                failed = Some(MigrateError::processing("worker pool closed"));
                break;
            }
            next_index += 1;
            next_cursor += len;
            outstanding += 1;
        }

        // Let idle workers exit, then wait for the partitions in flight.
        drop(work_tx);
        while outstanding > 0 {
            match done_rx.recv().await {
                Some(completed) => {
                    outstanding -= 1;
                    self.absorb_or_trip(completed, entity, total, ledger, &mut tripped, &mut failed)
                        .await;
                }
                None => break,
            }
        }

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                warn!("Worker task failed: {}", e);
            }
        }

        if outstanding > 0 {
            return Err(MigrateError::processing(format!(
                "{} partition(s) lost to worker failure",
                outstanding
            )));
        }
        if let Some(e) = failed {
            return Err(e);
        }
        if let Some(reason) = tripped {
            return Err(MigrateError::Aborted {
                reason,
                last_checkpoint: None,
            });
        }
        Ok(stop)
    }

    /// Absorb a worker result, keeping the first breaker reason or error.
    async fn absorb_or_trip(
        &mut self,
        completed: Completed,
        entity: &str,
        total: Option<u64>,
        ledger: &mut Ledger,
        tripped: &mut Option<String>,
        failed: &mut Option<MigrateError>,
    ) {
        match self.absorb(completed, entity, total, ledger).await {
            Ok(Some(reason)) => {
                tripped.get_or_insert(reason);
            }
            Ok(None) => {}
            Err(e) => {
                if failed.is_none() {
                    *failed = Some(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::config::{Config, DecoderConfig};
    use crate::core::Record;
    use crate::decoder::TabularDecoder;
    use crate::executor::RunStatus;
    use crate::memory::{FixedProbe, MemoryGovernor};
    use crate::rollback::{InMemoryTarget, MutationTarget, Operation, OperationLog};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::time::Duration;

    struct Loader {
        target: Arc<InMemoryTarget>,
        reject: HashSet<String>,
        slow: Option<String>,
    }

    #[async_trait]
    impl RecordProcessor for Loader {
        async fn process(&self, record: Record) -> Result<Vec<Operation>> {
            let key = record.get("id").unwrap_or_default().to_string();
            if self.reject.contains(&key) {
                return Err(MigrateError::processing("invalid data in record"));
            }
            if self.slow.as_deref() == Some(key.as_str()) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            // Uneven work so partitions finish out of order.
            let delay = key.parse::<u64>().unwrap_or(0) % 3;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let image = record.to_json();
            self.target.insert("users", &key, &image).await?;
            Ok(vec![Operation::insert("users", key, image)])
        }
    }

    fn csv(rows: usize) -> TabularDecoder<Cursor<Vec<u8>>> {
        let mut data = String::from("id,name\n");
        for i in 1..=rows {
            data.push_str(&format!("{},name{}\n", i, i));
        }
        let config = DecoderConfig {
            delimiter: Some(','),
            has_header: Some(true),
            ..DecoderConfig::default()
        };
        TabularDecoder::from_reader(Cursor::new(data.into_bytes()), &config, None).unwrap()
    }

    fn setup(config: &Config) -> (BatchExecutor, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new("par", 10));
        let governor =
            MemoryGovernor::with_probe(&config.memory, &config.batch, Box::new(FixedProbe(0)));
        let exec = BatchExecutor::new(config, "par", store.clone(), OperationLog::new("par"))
            .with_governor(governor);
        (exec, store)
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.batch.parallel = true;
        config.batch.workers = Some(3);
        config.batch.batch_size = 5;
        config.batch.min_batch_size = 5;
        config.batch.max_batch_size = 50;
        config.batch.checkpoint_interval = 10;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_run_processes_everything() {
        let config = config();
        let (mut exec, store) = setup(&config);
        let target = Arc::new(InMemoryTarget::new());
        let loader = Loader {
            target: target.clone(),
            reject: HashSet::new(),
            slow: None,
        };

        let report = exec.run(&mut csv(42), Arc::new(loader)).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.success_count, 42);
        assert_eq!(report.cursor, 42);
        assert_eq!(report.batches, 9);
        assert_eq!(exec.log().len(), 42);
        assert_eq!(target.count("users"), 42);

        let cursors: Vec<u64> = store.list().await.unwrap().iter().map(|c| c.cursor).collect();
        assert!(cursors.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(cursors.last(), Some(&42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_failures_and_rollback() {
        let mut config = config();
        config.retry.max_failure_ratio = 0.5;
        let (mut exec, _) = setup(&config);
        let target = Arc::new(InMemoryTarget::new());
        let loader = Loader {
            target: target.clone(),
            reject: ["7".to_string()].into_iter().collect(),
            slow: None,
        };

        let report = exec.run(&mut csv(30), Arc::new(loader)).await.unwrap();
        assert_eq!(report.success_count, 29);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.failures[0].index, 6);

        let mut log = exec.into_log();
        log.rollback(
            target.as_ref() as &dyn MutationTarget,
            None,
            config.rollback.mode,
        )
        .await
        .unwrap();
        assert_eq!(target.count("users"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_timeout_keeps_log_in_step_with_target() {
        let mut config = config();
        config.batch.batch_timeout_secs = Some(1);
        config.retry.max_attempts = 2;
        let (mut exec, _) = setup(&config);
        let target = Arc::new(InMemoryTarget::new());
        let loader = Loader {
            target: target.clone(),
            reject: HashSet::new(),
            slow: Some("7".to_string()),
        };

        let report = exec.run(&mut csv(30), Arc::new(loader)).await.unwrap();
        // Record 6 landed before partition 1 timed out; 7..=10 did not.
        assert_eq!(report.success_count, 26);
        assert_eq!(report.failure_count, 4);
        assert_eq!(exec.log().len(), target.count("users"));

        let mut log = exec.into_log();
        log.rollback(
            target.as_ref() as &dyn MutationTarget,
            None,
            config.rollback.mode,
        )
        .await
        .unwrap();
        assert_eq!(target.count("users"), 0);
    }
}
