//! Progress aggregation and throttled reporting.

mod sink;

pub use sink::{LogSink, ProgressSink};

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ProgressConfig;

/// Outcome of one executed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: u64,
    pub entity: String,
    pub record_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub duration: Duration,
    /// Worker that ran the batch; `None` in sequential mode.
    pub worker_id: Option<usize>,
    /// Records per second for this batch.
    pub throughput: f64,
}

impl BatchResult {
    pub fn new(
        batch_id: u64,
        entity: impl Into<String>,
        success_count: u64,
        failure_count: u64,
        duration: Duration,
    ) -> Self {
        let record_count = success_count + failure_count;
        let secs = duration.as_secs_f64();
        Self {
            batch_id,
            entity: entity.into(),
            record_count,
            success_count,
            failure_count,
            duration,
            worker_id: None,
            throughput: if secs > 0.0 {
                record_count as f64 / secs
            } else {
                0.0
            },
        }
    }

    pub fn on_worker(mut self, worker_id: usize) -> Self {
        self.worker_id = Some(worker_id);
        self
    }
}

/// Totals for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityProgress {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u64,
}

/// Point-in-time view of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Expected records, when known.
    pub total: Option<u64>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u64,
    /// 0-100, when the total is known.
    pub percent: Option<f64>,
    /// Records per second over the rolling window.
    pub throughput: f64,
    pub eta_secs: Option<f64>,
    pub elapsed_secs: f64,
    pub entities: BTreeMap<String, EntityProgress>,
    pub complete: bool,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Human-readable progress line.
    pub fn line(&self) -> String {
        let mut line = match (self.total, self.percent) {
            (Some(total), Some(percent)) => {
                format!("{}/{} records ({:.1}%)", self.processed, total, percent)
            }
            _ => format!("{} records", self.processed),
        };
        if self.failed > 0 {
            line.push_str(&format!(", {} failed", self.failed));
        }
        line.push_str(&format!(", {:.0} rec/s", self.throughput));
        if self.complete {
            line.push_str(&format!(", done in {}", format_secs(self.elapsed_secs)));
        } else if let Some(eta) = self.eta_secs {
            line.push_str(&format!(", ETA {}", format_secs(eta)));
        }
        line
    }
}

fn format_secs(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[derive(Debug, Clone, Copy)]
struct Emitted {
    at: Instant,
    percent: f64,
    processed: u64,
}

/// Accumulates batch results and emits throttled snapshots to its sinks.
pub struct ProgressAggregator {
    config: ProgressConfig,
    total: Option<u64>,
    started: Instant,
    processed: u64,
    succeeded: u64,
    failed: u64,
    batches: u64,
    entities: BTreeMap<String, EntityProgress>,
    window: VecDeque<(u64, Duration)>,
    last_emit: Option<Emitted>,
    emitted: u64,
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl ProgressAggregator {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            total: None,
            started: Instant::now(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            batches: 0,
            entities: BTreeMap::new(),
            window: VecDeque::new(),
            last_emit: None,
            emitted: 0,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn ProgressSink>) {
        self.sinks.push(sink);
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
    }

    /// Restore counters carried over from a checkpoint.
    pub fn resume_from(&mut self, succeeded: u64, failed: u64) {
        self.succeeded = succeeded;
        self.failed = failed;
        self.processed = succeeded + failed;
    }

    /// Snapshots delivered so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Fold in one batch result. Returns whether a snapshot was emitted.
    pub fn record(&mut self, result: &BatchResult) -> bool {
        self.record_at(result, Instant::now())
    }

    pub(crate) fn record_at(&mut self, result: &BatchResult, now: Instant) -> bool {
        self.processed += result.record_count;
        self.succeeded += result.success_count;
        self.failed += result.failure_count;
        self.batches += 1;

        let entity = self.entities.entry(result.entity.clone()).or_default();
        entity.processed += result.record_count;
        entity.succeeded += result.success_count;
        entity.failed += result.failure_count;
        entity.batches += 1;

        self.window.push_back((result.record_count, result.duration));
        while self.window.len() > self.config.throughput_window.max(1) {
            self.window.pop_front();
        }

        let snapshot = self.snapshot_at(now, false);
        if self.should_emit(&snapshot, now) {
            self.emit(snapshot, now);
            true
        } else {
            false
        }
    }

    /// Emit the final snapshot, bypassing the throttle.
    pub fn finish(&mut self) -> ProgressSnapshot {
        let now = Instant::now();
        let snapshot = self.snapshot_at(now, true);
        self.emit(snapshot.clone(), now);
        snapshot
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now(), false)
    }

    fn throughput(&self) -> f64 {
        let (records, elapsed) = self
            .window
            .iter()
            .fold((0u64, Duration::ZERO), |(r, d), (records, duration)| {
                (r + records, d + *duration)
            });
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            records as f64 / secs
        } else {
            0.0
        }
    }

    fn percent(&self) -> Option<f64> {
        self.total.map(|total| {
            if total == 0 {
                0.0
            } else {
                (self.processed as f64 * 100.0 / total as f64).min(100.0)
            }
        })
    }

    fn snapshot_at(&self, now: Instant, complete: bool) -> ProgressSnapshot {
        let throughput = self.throughput();
        let eta_secs = match self.total {
            Some(total) if throughput > 0.0 => {
                Some(total.saturating_sub(self.processed) as f64 / throughput)
            }
            _ => None,
        };
        ProgressSnapshot {
            total: self.total,
            processed: self.processed,
            succeeded: self.succeeded,
            failed: self.failed,
            batches: self.batches,
            percent: self.percent(),
            throughput,
            eta_secs,
            elapsed_secs: now.saturating_duration_since(self.started).as_secs_f64(),
            entities: self.entities.clone(),
            complete: complete || self.total.map_or(false, |t| self.processed >= t),
            timestamp: Utc::now(),
        }
    }

    fn should_emit(&self, snapshot: &ProgressSnapshot, now: Instant) -> bool {
        if snapshot.complete {
            return true;
        }
        let last = self.last_emit.unwrap_or(Emitted {
            at: self.started,
            percent: 0.0,
            processed: 0,
        });
        if snapshot.processed.saturating_sub(last.processed) >= self.config.min_items.max(1) {
            return true;
        }
        if now.saturating_duration_since(last.at) < self.config.min_interval() {
            return false;
        }
        match snapshot.percent {
            Some(percent) => percent - last.percent >= self.config.min_percent_delta,
            // Unknown total: the interval alone throttles.
            None => true,
        }
    }

    fn emit(&mut self, snapshot: ProgressSnapshot, now: Instant) {
        self.last_emit = Some(Emitted {
            at: now,
            percent: snapshot.percent.unwrap_or(0.0),
            processed: snapshot.processed,
        });
        self.emitted += 1;
        debug!("Progress: {}", snapshot.line());

        for sink in &self.sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.emit(&snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Progress sink failed: {}", e),
                Err(_) => warn!("Progress sink panicked"),
            }
        }
    }
}
