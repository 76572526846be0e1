//! Write-path metrics consumed by the scale monitor.
//!
//! Each backend owns a [`WriteStats`] that records commit latency and the
//! writer identities seen recently. Samples are in-process only; the store
//! widens the writer count with the cross-process notification feed.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Latency samples kept per backend.
const SAMPLE_CAPACITY: usize = 1024;

/// How long a writer stays tracked when no window is configured.
const DEFAULT_WRITER_WINDOW: Duration = Duration::from_secs(300);

/// Point-in-time view of a backend's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BackendMetrics {
    /// Work units with at least one event.
    pub document_count: usize,
    /// Distinct writers seen inside the monitoring window.
    pub writer_count: usize,
    /// Mean commit latency over recent samples, in microseconds.
    pub avg_write_latency_us: u64,
}

impl BackendMetrics {
    #[must_use]
    pub const fn avg_write_latency(&self) -> Duration {
        Duration::from_micros(self.avg_write_latency_us)
    }
}

#[derive(Debug, Default)]
struct Inner {
    latencies: VecDeque<Duration>,
    writers: HashMap<String, Instant>,
}

/// Thread-safe commit statistics.
///
/// Writers older than the configured window are forgotten on the next
/// commit, so the table only holds identities that can still count.
#[derive(Debug)]
pub struct WriteStats {
    inner: Mutex<Inner>,
    writer_window: Duration,
}

impl Default for WriteStats {
    fn default() -> Self {
        Self::with_writer_window(DEFAULT_WRITER_WINDOW)
    }
}

impl WriteStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_writer_window(writer_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            writer_window,
        }
    }

    /// Run `f` and record its duration as a commit by `writer`.
    pub fn timed<R>(&self, writer: &str, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        self.record(writer, started.elapsed());
        result
    }

    pub fn record(&self, writer: &str, elapsed: Duration) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.latencies.len() == SAMPLE_CAPACITY {
            inner.latencies.pop_front();
        }
        inner.latencies.push_back(elapsed);
        let window = self.writer_window;
        inner.writers.retain(|_, seen| seen.elapsed() <= window);
        inner.writers.insert(writer.to_string(), Instant::now());
    }

    /// Writer identities currently held, stale or not.
    #[must_use]
    pub fn tracked_writers(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.writers.len())
    }

    /// Mean of the retained samples, zero when none were recorded.
    #[must_use]
    pub fn avg_latency(&self) -> Duration {
        let Ok(inner) = self.inner.lock() else {
            return Duration::ZERO;
        };
        if inner.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = inner.latencies.iter().sum();
        let count = u32::try_from(inner.latencies.len()).unwrap_or(u32::MAX);
        total / count
    }

    /// 95th percentile of the retained samples.
    #[must_use]
    pub fn p95_latency(&self) -> Duration {
        let Ok(inner) = self.inner.lock() else {
            return Duration::ZERO;
        };
        let mut values: Vec<Duration> = inner.latencies.iter().copied().collect();
        values.sort_unstable();
        percentile(&values, 95)
    }

    /// Writers that committed within `window`.
    #[must_use]
    pub fn recent_writers(&self, window: Duration) -> BTreeSet<String> {
        let Ok(inner) = self.inner.lock() else {
            return BTreeSet::new();
        };
        inner
            .writers
            .iter()
            .filter(|(_, seen)| seen.elapsed() <= window)
            .map(|(writer, _)| writer.clone())
            .collect()
    }

    /// Assemble a snapshot for the given document count.
    #[must_use]
    pub fn snapshot(&self, document_count: usize, window: Duration) -> BackendMetrics {
        BackendMetrics {
            document_count,
            writer_count: self.recent_writers(window).len(),
            avg_write_latency_us: u64::try_from(self.avg_latency().as_micros())
                .unwrap_or(u64::MAX),
        }
    }
}

fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1) - 1;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_report_zero() {
        let stats = WriteStats::new();
        assert_eq!(stats.avg_latency(), Duration::ZERO);
        assert_eq!(stats.p95_latency(), Duration::ZERO);
        assert_eq!(stats.snapshot(3, Duration::from_secs(60)).writer_count, 0);
    }

    #[test]
    fn average_and_percentile_over_samples() {
        let stats = WriteStats::new();
        for ms in 1..=100 {
            stats.record("w", Duration::from_millis(ms));
        }
        assert_eq!(stats.avg_latency(), Duration::from_micros(50_500));
        assert_eq!(stats.p95_latency(), Duration::from_millis(95));
    }

    #[test]
    fn capacity_drops_oldest_samples() {
        let stats = WriteStats::new();
        for _ in 0..SAMPLE_CAPACITY {
            stats.record("w", Duration::from_secs(1));
        }
        for _ in 0..SAMPLE_CAPACITY {
            stats.record("w", Duration::from_millis(1));
        }
        assert_eq!(stats.avg_latency(), Duration::from_millis(1));
    }

    #[test]
    fn writers_are_counted_distinctly() {
        let stats = WriteStats::new();
        let value = stats.timed("a", || 7);
        assert_eq!(value, 7);
        stats.record("b", Duration::from_millis(1));
        stats.record("a", Duration::from_millis(1));
        let snapshot = stats.snapshot(10, Duration::from_secs(60));
        assert_eq!(snapshot.writer_count, 2);
        assert_eq!(snapshot.document_count, 10);
        assert!(stats.recent_writers(Duration::ZERO).len() <= 2);
    }

    #[test]
    fn stale_writers_are_forgotten_on_commit() {
        let stats = WriteStats::with_writer_window(Duration::from_millis(30));
        for n in 0..50 {
            stats.record(&format!("batch-{n}"), Duration::from_millis(1));
        }
        assert_eq!(stats.tracked_writers(), 50);

        std::thread::sleep(Duration::from_millis(60));
        stats.record("late", Duration::from_millis(1));
        assert_eq!(stats.tracked_writers(), 1);
        assert_eq!(
            stats.recent_writers(Duration::from_secs(60)),
            BTreeSet::from(["late".to_string()])
        );
    }
}
