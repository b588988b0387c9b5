//! Memory pressure governor.
//!
//! The governor samples resident memory, classifies it into a pressure band
//! against the configured ceiling, and recommends a batch size. It never fails
//! and never blocks: it only recommends, logs, and invokes registered hooks.

mod probe;

pub use probe::{FixedProbe, MemoryProbe, SysinfoProbe};

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BatchConfig, MemoryConfig};

/// Pressure band of current usage against the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
            PressureLevel::Emergency => "emergency",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the governor after a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryState {
    pub usage_bytes: u64,
    pub ceiling_bytes: u64,
    pub usage_ratio: f64,
    pub level: PressureLevel,
    pub batch_size: usize,
    pub original_batch_size: usize,
    pub last_collection: Option<DateTime<Utc>>,
    /// Linear trend over the recent history, bytes per second.
    pub growth_rate: f64,
    /// Naive projection until the ceiling is reached at the current trend.
    pub seconds_to_ceiling: Option<f64>,
}

/// Hook invoked with the state whenever a sample lands in a given level.
pub type PressureCallback = Box<dyn Fn(&MemoryState) + Send + Sync>;

/// Hook standing in for a collector run.
pub type CollectionHook = Box<dyn Fn() + Send + Sync>;

/// Recommends batch sizes from observed memory pressure.
pub struct MemoryGovernor {
    probe: Box<dyn MemoryProbe>,
    config: MemoryConfig,
    ceiling: u64,
    min_batch: usize,
    max_batch: usize,
    original_batch: usize,
    batch_size: usize,
    history: VecDeque<(Instant, u64)>,
    level: PressureLevel,
    last_usage: u64,
    last_collection: Option<(Instant, DateTime<Utc>)>,
    collections: u64,
    callbacks: Vec<(PressureLevel, PressureCallback)>,
    collectors: Vec<CollectionHook>,
}

impl MemoryGovernor {
    /// Governor reading this process's memory through `sysinfo`.
    pub fn new(memory: &MemoryConfig, batch: &BatchConfig) -> Self {
        Self::with_probe(memory, batch, Box::new(SysinfoProbe::new()))
    }

    pub fn with_probe(memory: &MemoryConfig, batch: &BatchConfig, probe: Box<dyn MemoryProbe>) -> Self {
        let original = batch
            .batch_size
            .clamp(batch.min_batch_size, batch.max_batch_size.max(batch.min_batch_size));
        Self {
            probe,
            ceiling: memory.get_ceiling_bytes().max(1),
            config: memory.clone(),
            min_batch: batch.min_batch_size,
            max_batch: batch.max_batch_size.max(batch.min_batch_size),
            original_batch: original,
            batch_size: original,
            history: VecDeque::with_capacity(memory.history_size),
            level: PressureLevel::Normal,
            last_usage: 0,
            last_collection: None,
            collections: 0,
            callbacks: Vec::new(),
            collectors: Vec::new(),
        }
    }

    /// Register a callback for samples at `level`.
    pub fn on_level(&mut self, level: PressureLevel, callback: PressureCallback) {
        self.callbacks.push((level, callback));
    }

    /// Register a collection hook.
    pub fn on_collect(&mut self, hook: CollectionHook) {
        self.collectors.push(hook);
    }

    /// Current batch size recommendation.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn level(&self) -> PressureLevel {
        self.level
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling
    }

    /// Collection passes triggered so far.
    pub fn collections(&self) -> u64 {
        self.collections
    }

    /// Sample the probe and adjust.
    ///
    /// An unavailable measurement reuses the last observed value.
    pub fn sample(&mut self) -> MemoryState {
        let bytes = match self.probe.resident_bytes() {
            Some(bytes) => bytes,
            None => {
                debug!("Memory probe unavailable, reusing last sample");
                self.last_usage
            }
        };
        self.observe(bytes)
    }

    /// Feed an externally measured usage value and adjust.
    pub fn observe(&mut self, bytes: u64) -> MemoryState {
        self.observe_at(bytes, Instant::now())
    }

    pub(crate) fn observe_at(&mut self, bytes: u64, at: Instant) -> MemoryState {
        self.last_usage = bytes;
        self.history.push_back((at, bytes));
        while self.history.len() > self.config.history_size.max(2) {
            self.history.pop_front();
        }

        let ratio = bytes as f64 / self.ceiling as f64;
        let level = self.level_for(ratio);
        if level != self.level {
            if level > self.level {
                warn!(
                    "Memory pressure {} -> {} ({:.1}% of {} MB)",
                    self.level,
                    level,
                    ratio * 100.0,
                    self.ceiling / (1024 * 1024)
                );
            } else {
                info!("Memory pressure eased to {} ({:.1}%)", level, ratio * 100.0);
            }
            self.level = level;
        }

        let previous = self.batch_size;
        self.adjust(level, at);
        if self.batch_size != previous {
            debug!("Batch size {} -> {} ({})", previous, self.batch_size, level);
        }

        let state = self.state();
        for (cb_level, callback) in &self.callbacks {
            if *cb_level == level && catch_unwind(AssertUnwindSafe(|| callback(&state))).is_err() {
                warn!("Memory pressure callback panicked at level {}", level);
            }
        }
        state
    }

    /// Current state without taking a new sample.
    pub fn state(&self) -> MemoryState {
        let growth_rate = self.growth_rate();
        let seconds_to_ceiling = if growth_rate > 0.0 && self.last_usage < self.ceiling {
            Some((self.ceiling - self.last_usage) as f64 / growth_rate)
        } else {
            None
        };
        MemoryState {
            usage_bytes: self.last_usage,
            ceiling_bytes: self.ceiling,
            usage_ratio: self.last_usage as f64 / self.ceiling as f64,
            level: self.level,
            batch_size: self.batch_size,
            original_batch_size: self.original_batch,
            last_collection: self.last_collection.map(|(_, at)| at),
            growth_rate,
            seconds_to_ceiling,
        }
    }

    fn level_for(&self, ratio: f64) -> PressureLevel {
        if ratio >= self.config.emergency_threshold {
            PressureLevel::Emergency
        } else if ratio >= self.config.critical_threshold {
            PressureLevel::Critical
        } else if ratio >= self.config.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    fn adjust(&mut self, level: PressureLevel, at: Instant) {
        let current = self.batch_size;
        let next = match level {
            PressureLevel::Emergency => {
                self.collect(at);
                current / 2
            }
            PressureLevel::Critical => {
                let cooled = self.last_collection.map_or(true, |(last, _)| {
                    at.duration_since(last) >= self.config.collection_cooldown()
                });
                if cooled {
                    self.collect(at);
                }
                current * 7 / 10
            }
            PressureLevel::Warning => current * 85 / 100,
            // Grow by 10% (rounded up) back toward the original size.
            PressureLevel::Normal if current < self.original_batch => {
                ((current * 11 + 9) / 10).min(self.original_batch)
            }
            PressureLevel::Normal => current,
        };
        self.batch_size = next.clamp(self.min_batch, self.max_batch);
    }

    fn collect(&mut self, at: Instant) {
        self.collections += 1;
        self.last_collection = Some((at, Utc::now()));
        for hook in &self.collectors {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                warn!("Collection hook panicked");
            }
        }
    }

    /// Least-squares slope of usage over time, bytes per second.
    fn growth_rate(&self) -> f64 {
        let n = self.history.len();
        if n < 2 {
            return 0.0;
        }
        let origin = self.history[0].0;
        let points: Vec<(f64, f64)> = self
            .history
            .iter()
            .map(|(t, b)| (t.duration_since(origin).as_secs_f64(), *b as f64))
            .collect();
        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n as f64;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n as f64;
        let var_x: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
        if var_x == 0.0 {
            return 0.0;
        }
        let cov: f64 = points
            .iter()
            .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
            .sum();
        cov / var_x
    }
}

/// Duration form of [`MemoryState::seconds_to_ceiling`].
pub fn time_to_ceiling(state: &MemoryState) -> Option<Duration> {
    state
        .seconds_to_ceiling
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const MB: u64 = 1024 * 1024;

    fn governor() -> MemoryGovernor {
        let memory = MemoryConfig {
            ceiling_bytes: Some(1000 * MB),
            ..MemoryConfig::default()
        };
        let batch = BatchConfig {
            batch_size: 1000,
            min_batch_size: 10,
            max_batch_size: 5000,
            ..BatchConfig::default()
        };
        MemoryGovernor::with_probe(&memory, &batch, Box::new(FixedProbe(100 * MB)))
    }

    #[test]
    fn test_levels_follow_thresholds() {
        let mut g = governor();
        assert_eq!(g.observe(100 * MB).level, PressureLevel::Normal);
        assert_eq!(g.observe(700 * MB).level, PressureLevel::Warning);
        assert_eq!(g.observe(850 * MB).level, PressureLevel::Critical);
        assert_eq!(g.observe(950 * MB).level, PressureLevel::Emergency);
    }

    #[test]
    fn test_rising_pressure_never_grows_batch() {
        let mut g = governor();
        let mut sizes = Vec::new();
        for mb in (700..1000).step_by(10) {
            sizes.push(g.observe(mb * MB).batch_size);
        }
        for pair in sizes.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert!(sizes.iter().all(|s| (10..=5000).contains(s)));
        assert_eq!(*sizes.last().unwrap(), 10);
    }

    #[test]
    fn test_adjustment_factors() {
        let mut g = governor();
        assert_eq!(g.observe(700 * MB).batch_size, 850);
        assert_eq!(g.observe(850 * MB).batch_size, 595);
        assert_eq!(g.observe(960 * MB).batch_size, 297);
        // Recovery grows by 10% back toward the original.
        assert_eq!(g.observe(100 * MB).batch_size, 327);
        for _ in 0..50 {
            g.observe(100 * MB);
        }
        assert_eq!(g.batch_size(), 1000);
    }

    #[test]
    fn test_critical_collection_respects_cooldown() {
        let mut g = governor();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        g.on_collect(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let start = Instant::now();
        g.observe_at(860 * MB, start);
        g.observe_at(860 * MB, start + Duration::from_secs(5));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        g.observe_at(860 * MB, start + Duration::from_secs(31));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        // Emergency always collects.
        g.observe_at(990 * MB, start + Duration::from_secs(32));
        assert_eq!(g.collections(), 3);
    }

    #[test]
    fn test_growth_rate_projection() {
        let mut g = governor();
        let start = Instant::now();
        g.observe_at(100 * MB, start);
        g.observe_at(200 * MB, start + Duration::from_secs(10));
        let state = g.observe_at(300 * MB, start + Duration::from_secs(20));
        assert!((state.growth_rate - 10.0 * MB as f64).abs() < 1.0);
        let eta = time_to_ceiling(&state).unwrap();
        assert_eq!(eta.as_secs(), 70);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut g = governor();
        for i in 0..100 {
            g.observe(i * MB);
        }
        assert!(g.history.len() <= 20);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut g = governor();
        g.on_level(PressureLevel::Warning, Box::new(|_| panic!("boom")));
        let state = g.observe(750 * MB);
        assert_eq!(state.level, PressureLevel::Warning);
    }

    #[test]
    fn test_sample_uses_probe() {
        let mut g = governor();
        let state = g.sample();
        assert_eq!(state.usage_bytes, 100 * MB);
        assert!((state.usage_ratio - 0.1).abs() < 1e-9);
    }
}
