//! Inference timing statistics

use std::collections::VecDeque;
use std::time::Duration;

/// Summary of recent chain runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceStats {
    /// Average run time in milliseconds
    pub avg_ms: f64,
    /// Minimum run time in milliseconds
    pub min_ms: f64,
    /// Maximum run time in milliseconds
    pub max_ms: f64,
    /// Median run time
    pub p50_ms: f64,
    /// 95th percentile run time
    pub p95_ms: f64,
    /// Number of samples in the window
    pub sample_count: usize,
    /// Runs since creation
    pub runs: u64,
    /// Failed runs since creation
    pub failures: u64,
    /// Results dropped because a stop arrived first
    pub discarded: u64,
    /// Scheduler interval at the time of the last run
    pub interval_secs: f64,
}

impl InferenceStats {
    /// Effective inference rate implied by the interval
    pub fn runs_per_second(&self) -> f64 {
        if self.interval_secs > 0.0 {
            1.0 / self.interval_secs
        } else {
            0.0
        }
    }
}

/// Bounded window of run durations plus lifetime counters
#[derive(Debug, Clone)]
pub struct InferenceProfiler {
    durations: VecDeque<Duration>,
    max_samples: usize,
    runs: u64,
    failures: u64,
    discarded: u64,
    interval_secs: f64,
}

impl Default for InferenceProfiler {
    fn default() -> Self {
        Self::new(120)
    }
}

impl InferenceProfiler {
    pub fn new(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            durations: VecDeque::with_capacity(max_samples),
            max_samples,
            runs: 0,
            failures: 0,
            discarded: 0,
            interval_secs: 0.0,
        }
    }

    /// Record a finished run
    pub fn record_run(&mut self, duration: Duration, succeeded: bool, interval_secs: f64) {
        self.durations.push_back(duration);
        if self.durations.len() > self.max_samples {
            self.durations.pop_front();
        }
        self.runs += 1;
        if !succeeded {
            self.failures += 1;
        }
        self.interval_secs = interval_secs;
    }

    pub fn record_discard(&mut self) {
        self.discarded += 1;
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn last_run_ms(&self) -> f64 {
        self.durations
            .back()
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    /// Forget timing samples; counters are kept
    pub fn clear_window(&mut self) {
        self.durations.clear();
    }

    pub fn stats(&self) -> InferenceStats {
        let mut stats = InferenceStats {
            runs: self.runs,
            failures: self.failures,
            discarded: self.discarded,
            interval_secs: self.interval_secs,
            ..InferenceStats::default()
        };
        if self.durations.is_empty() {
            return stats;
        }

        let mut times: Vec<f64> = self
            .durations
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        times.sort_by(|a, b| a.total_cmp(b));

        let sum: f64 = times.iter().sum();
        stats.avg_ms = sum / times.len() as f64;
        stats.min_ms = times[0];
        stats.max_ms = times[times.len() - 1];
        stats.p50_ms = percentile(&times, 0.50);
        stats.p95_ms = percentile(&times, 0.95);
        stats.sample_count = times.len();
        stats
    }
}

/// Percentile of an ascending slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p) as usize;
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_profiler_stats() {
        let stats = InferenceProfiler::default().stats();
        assert_eq!(stats.sample_count, 0);
        assert_eq!(stats.avg_ms, 0.0);
        assert_eq!(stats.runs_per_second(), 0.0);
    }

    #[test]
    fn test_stats_over_window() {
        let mut profiler = InferenceProfiler::new(10);
        for ms in [10u64, 20, 30, 40] {
            profiler.record_run(Duration::from_millis(ms), ms != 30, 0.5);
        }
        profiler.record_discard();

        let stats = profiler.stats();
        assert_eq!(stats.sample_count, 4);
        assert!((stats.avg_ms - 25.0).abs() < 1e-9);
        assert!((stats.min_ms - 10.0).abs() < 1e-9);
        assert!((stats.max_ms - 40.0).abs() < 1e-9);
        assert!((stats.p50_ms - 20.0).abs() < 1e-9);
        assert_eq!(stats.runs, 4);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.runs_per_second(), 2.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut profiler = InferenceProfiler::new(3);
        for ms in 1..=10u64 {
            profiler.record_run(Duration::from_millis(ms), true, 0.1);
        }
        let stats = profiler.stats();
        assert_eq!(stats.sample_count, 3);
        assert!((stats.min_ms - 8.0).abs() < 1e-9);
        assert_eq!(stats.runs, 10);
        assert!((profiler.last_run_ms() - 10.0).abs() < 1e-9);
    }
}
