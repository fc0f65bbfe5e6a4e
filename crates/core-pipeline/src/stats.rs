//! Per-batch timing accounting and the end-of-run summary.
//!
//! A batch is "slow" when its wall-clock time (basecall and align included)
//! exceeds the instrument's advertised chunk duration, meaning the pipeline
//! is deciding on stale signal. Slowness is observational: it feeds a
//! rolling window and a warning, never a behaviour change.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use core_cache::CacheMetricsSnapshot;
use core_decision::TrackerSnapshot;

#[derive(Debug)]
pub struct BatchStats {
    pub batches: u64,
    pub chunks: u64,
    pub slow_batches: u64,
    /// Chunks discarded because their read already received a terminal
    /// action.
    pub dropped_terminal: u64,
    pub last_batch: Duration,
    pub total_busy: Duration,
    window: VecDeque<bool>,
    window_size: usize,
}

/// Outcome of recording one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchVerdict {
    pub slow: bool,
    /// Fraction of slow batches over the rolling window.
    pub window_fraction: f64,
    /// Whether the rolling window has filled once.
    pub window_full: bool,
}

impl BatchStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            batches: 0,
            chunks: 0,
            slow_batches: 0,
            dropped_terminal: 0,
            last_batch: Duration::ZERO,
            total_busy: Duration::ZERO,
            window: VecDeque::with_capacity(window_size.max(1)),
            window_size: window_size.max(1),
        }
    }

    pub fn record_batch(
        &mut self,
        chunks: usize,
        elapsed: Duration,
        budget: Duration,
    ) -> BatchVerdict {
        self.batches += 1;
        self.chunks += chunks as u64;
        self.last_batch = elapsed;
        self.total_busy += elapsed;
        let slow = elapsed > budget;
        if slow {
            self.slow_batches += 1;
        }
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(slow);
        BatchVerdict {
            slow,
            window_fraction: self.window_fraction(),
            window_full: self.window.len() == self.window_size,
        }
    }

    pub fn note_dropped_terminal(&mut self, n: u64) {
        self.dropped_terminal += n;
    }

    pub fn window_fraction(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let slow = self.window.iter().filter(|&&s| s).count();
        slow as f64 / self.window.len() as f64
    }

    pub fn mean_batch_ms(&self) -> f64 {
        if self.batches == 0 {
            return 0.0;
        }
        self.total_busy.as_secs_f64() * 1_000.0 / self.batches as f64
    }
}

/// Machine-readable summary written at the end of a run; the external
/// report tool renders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub batches: u64,
    pub chunks: u64,
    pub slow_batches: u64,
    pub dropped_terminal: u64,
    pub mean_batch_ms: f64,
    pub unblocks_sent: u64,
    pub stop_receivings_sent: u64,
    pub suppressed: u64,
    pub cache_inserted: u64,
    pub cache_replaced: u64,
    pub cache_displaced: u64,
}

impl RunSummary {
    pub fn assemble(
        stats: &BatchStats,
        tracker: TrackerSnapshot,
        cache: CacheMetricsSnapshot,
    ) -> Self {
        Self {
            batches: stats.batches,
            chunks: stats.chunks,
            slow_batches: stats.slow_batches,
            dropped_terminal: stats.dropped_terminal,
            mean_batch_ms: stats.mean_batch_ms(),
            unblocks_sent: tracker.unblocks_sent,
            stop_receivings_sent: tracker.stop_receivings_sent,
            suppressed: tracker.suppressed,
            cache_inserted: cache.inserted,
            cache_replaced: cache.replaced,
            cache_displaced: cache.displaced,
        }
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, json)
    }

    pub fn read_from(path: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_batches_accumulate_in_window() {
        let mut stats = BatchStats::new(4);
        let budget = Duration::from_millis(100);
        for _ in 0..2 {
            let verdict = stats.record_batch(10, Duration::from_millis(50), budget);
            assert!(!verdict.slow);
        }
        let verdict = stats.record_batch(10, Duration::from_millis(150), budget);
        assert!(verdict.slow);
        assert!(!verdict.window_full);
        assert!((verdict.window_fraction - 1.0 / 3.0).abs() < 1e-9);
        let verdict = stats.record_batch(10, Duration::from_millis(150), budget);
        assert!(verdict.window_full);
        assert_eq!(stats.slow_batches, 2);
        assert_eq!(stats.batches, 4);
        assert_eq!(stats.chunks, 40);
    }

    #[test]
    fn window_is_rolling() {
        let mut stats = BatchStats::new(2);
        let budget = Duration::from_millis(100);
        stats.record_batch(1, Duration::from_millis(200), budget);
        stats.record_batch(1, Duration::from_millis(10), budget);
        let verdict = stats.record_batch(1, Duration::from_millis(10), budget);
        // The slow batch has rolled out of the window but not the totals.
        assert_eq!(verdict.window_fraction, 0.0);
        assert_eq!(stats.slow_batches, 1);
    }

    #[test]
    fn summary_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_summary.json");
        let mut stats = BatchStats::new(4);
        stats.record_batch(3, Duration::from_millis(20), Duration::from_millis(100));
        let summary = RunSummary::assemble(
            &stats,
            TrackerSnapshot::default(),
            CacheMetricsSnapshot::default(),
        );
        summary.write_to(&path).unwrap();
        assert_eq!(RunSummary::read_from(&path).unwrap(), summary);
    }
}
