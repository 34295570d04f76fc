//! Adaptive scheduler
//!
//! Decides when the next segmentation run may start, adjusts the interval
//! between runs to the measured cost of each run, and latches into fallback
//! after repeated failures.
//!
//! State machine: `Idle → Running → {Idle, Fallback}`. Leaving fallback
//! takes an explicit [`AdaptiveScheduler::reset`].

use std::time::{Duration, Instant};

use crate::error::InferenceFailure;
use crate::settings::SchedulerSettings;

/// Whether live inference is running or the static mask is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerMode {
    #[default]
    Live,
    Fallback,
}

/// Whether a chain run is currently executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
}

/// Snapshot of scheduler state
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerState {
    /// Start of the most recent run
    pub last_run: Option<Instant>,
    pub current_interval_secs: f64,
    pub consecutive_errors: u32,
    pub mode: SchedulerMode,
    pub run_state: RunState,
    /// Why fallback was entered
    pub fallback_reason: Option<String>,
}

/// Interval controller and fallback latch
#[derive(Debug, Clone)]
pub struct AdaptiveScheduler {
    settings: SchedulerSettings,
    state: SchedulerState,
}

impl AdaptiveScheduler {
    /// Create a scheduler; an inverted or non-finite interval band is repaired
    pub fn new(mut settings: SchedulerSettings) -> Self {
        settings.sanitize();
        let state = Self::initial_state(&settings);
        Self { settings, state }
    }

    fn initial_state(settings: &SchedulerSettings) -> SchedulerState {
        SchedulerState {
            last_run: None,
            current_interval_secs: settings.initial_interval_secs,
            consecutive_errors: 0,
            mode: SchedulerMode::Live,
            run_state: RunState::Idle,
            fallback_reason: None,
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn mode(&self) -> SchedulerMode {
        self.state.mode
    }

    pub fn is_fallback(&self) -> bool {
        self.state.mode == SchedulerMode::Fallback
    }

    pub fn is_running(&self) -> bool {
        self.state.run_state == RunState::Running
    }

    pub fn current_interval(&self) -> Duration {
        Duration::from_secs_f64(self.state.current_interval_secs)
    }

    /// Whether a run may start at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        if self.state.mode == SchedulerMode::Fallback || self.state.run_state == RunState::Running {
            return false;
        }
        match self.state.last_run {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last).as_secs_f64()
                    >= self.state.current_interval_secs
            }
        }
    }

    /// Enter `Running` if a run is due. Returns whether it did.
    pub fn begin_run(&mut self, now: Instant) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.state.run_state = RunState::Running;
        self.state.last_run = Some(now);
        true
    }

    /// Leave `Running` with the measured duration and outcome of the run
    pub fn complete_run<T>(&mut self, duration: Duration, result: &Result<T, InferenceFailure>) {
        if self.state.run_state != RunState::Running {
            tracing::warn!(
                target: "wall_segmentation::scheduler",
                "run completed while no run was started"
            );
            return;
        }
        self.state.run_state = RunState::Idle;

        if self.settings.adaptive {
            self.adapt_interval(duration);
        }

        match result {
            Ok(_) => self.state.consecutive_errors = 0,
            Err(failure) => {
                self.state.consecutive_errors += 1;
                tracing::warn!(
                    target: "wall_segmentation::scheduler",
                    errors = self.state.consecutive_errors,
                    threshold = self.settings.error_threshold,
                    "{}",
                    failure
                );
                if self.state.consecutive_errors >= self.settings.error_threshold {
                    self.enter_fallback(format!(
                        "{} consecutive inference failures, last: {}",
                        self.state.consecutive_errors, failure.message
                    ));
                }
            }
        }
    }

    /// Leave `Running` without touching the interval or error count
    pub fn cancel_run(&mut self) {
        self.state.run_state = RunState::Idle;
    }

    /// Run `chain` if due, timing it and recording its outcome
    ///
    /// Returns `None` when no run was due.
    pub fn tick<T, F>(&mut self, now: Instant, chain: F) -> Option<Result<T, InferenceFailure>>
    where
        F: FnOnce() -> Result<T, InferenceFailure>,
    {
        if !self.begin_run(now) {
            return None;
        }
        let started = Instant::now();
        let result = chain();
        self.complete_run(started.elapsed(), &result);
        Some(result)
    }

    /// Stop scheduling inference until [`AdaptiveScheduler::reset`]
    pub fn enter_fallback(&mut self, reason: impl Into<String>) {
        if self.state.mode == SchedulerMode::Fallback {
            return;
        }
        let reason = reason.into();
        tracing::warn!(
            target: "wall_segmentation::scheduler",
            reason = %reason,
            "switching to fallback mask"
        );
        self.state.mode = SchedulerMode::Fallback;
        self.state.fallback_reason = Some(reason);
    }

    /// Return to `Live` with the initial interval and a clean error count
    pub fn reset(&mut self) {
        self.state = Self::initial_state(&self.settings);
        tracing::info!(target: "wall_segmentation::scheduler", "scheduler reset");
    }

    /// Proportional interval update for a run that took `duration`
    fn adapt_interval(&mut self, duration: Duration) {
        let d = duration.as_secs_f64();
        let target = self.settings.target_frame_budget_ms / 1000.0;
        let (min, max) = (self.settings.min_interval_secs, self.settings.max_interval_secs);
        let interval = self.state.current_interval_secs;

        let next = if d > target {
            (interval * (d / target)).min(max)
        } else if d < target * 0.5 && interval > min {
            (interval * (d / target)).max(min)
        } else {
            interval
        };

        if next != interval {
            tracing::debug!(
                target: "wall_segmentation::scheduler",
                duration_ms = d * 1000.0,
                from = interval,
                to = next,
                "interval adjusted"
            );
        }
        self.state.current_interval_secs = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(initial: f64) -> SchedulerSettings {
        SchedulerSettings {
            initial_interval_secs: initial,
            ..SchedulerSettings::default()
        }
    }

    fn ok() -> Result<(), InferenceFailure> {
        Ok(())
    }

    fn failed() -> Result<(), InferenceFailure> {
        Err(InferenceFailure::new("backend exploded"))
    }

    /// Start a run and complete it with a synthetic duration
    fn run(
        scheduler: &mut AdaptiveScheduler,
        now: Instant,
        ms: u64,
        result: Result<(), InferenceFailure>,
    ) -> bool {
        if !scheduler.begin_run(now) {
            return false;
        }
        scheduler.complete_run(Duration::from_millis(ms), &result);
        true
    }

    #[test]
    fn test_slow_run_doubles_interval() {
        let mut scheduler = AdaptiveScheduler::new(settings(0.1));
        assert!(run(&mut scheduler, Instant::now(), 60, ok()));
        assert!((scheduler.state().current_interval_secs - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_fast_run_shrinks_interval() {
        let mut scheduler = AdaptiveScheduler::new(settings(1.0));
        run(&mut scheduler, Instant::now(), 10, ok());
        assert!((scheduler.state().current_interval_secs - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_run_within_band_keeps_interval() {
        let mut scheduler = AdaptiveScheduler::new(settings(0.5));
        run(&mut scheduler, Instant::now(), 20, ok());
        assert_eq!(scheduler.state().current_interval_secs, 0.5);
    }

    #[test]
    fn test_interval_clamped_to_band() {
        let mut scheduler = AdaptiveScheduler::new(settings(1.5));
        run(&mut scheduler, Instant::now(), 300, ok());
        assert_eq!(scheduler.state().current_interval_secs, 2.0);

        let mut scheduler = AdaptiveScheduler::new(settings(0.15));
        run(&mut scheduler, Instant::now(), 1, ok());
        assert_eq!(scheduler.state().current_interval_secs, 0.1);
    }

    #[test]
    fn test_converges_under_constant_duration() {
        for ms in [1u64, 10, 20, 25, 45, 90, 500] {
            let mut scheduler = AdaptiveScheduler::new(SchedulerSettings::default());
            let mut now = Instant::now();
            let mut history = Vec::new();
            for _ in 0..50 {
                now += Duration::from_secs(3);
                assert!(run(&mut scheduler, now, ms, ok()));
                let interval = scheduler.state().current_interval_secs;
                assert!((0.1..=2.0).contains(&interval), "ms={} interval={}", ms, interval);
                history.push(interval);
            }
            let tail = &history[history.len() - 5..];
            assert!(
                tail.windows(2).all(|w| w[0] == w[1]),
                "ms={} did not settle: {:?}",
                ms,
                tail
            );
        }
    }

    #[test]
    fn test_inverted_band_is_repaired() {
        let scheduler = AdaptiveScheduler::new(SchedulerSettings {
            min_interval_secs: 0.5,
            max_interval_secs: 0.2,
            ..SchedulerSettings::default()
        });
        assert_eq!(scheduler.settings().max_interval_secs, 0.5);
        assert_eq!(scheduler.state().current_interval_secs, 0.5);
    }

    #[test]
    fn test_not_due_before_interval_elapses() {
        let mut scheduler = AdaptiveScheduler::new(settings(0.3));
        let start = Instant::now();
        assert!(run(&mut scheduler, start, 20, ok()));
        assert!(!scheduler.is_due(start + Duration::from_millis(100)));
        assert!(scheduler.is_due(start + Duration::from_millis(300)));
    }

    #[test]
    fn test_no_overlapping_runs() {
        let mut scheduler = AdaptiveScheduler::new(settings(0.1));
        let now = Instant::now();
        assert!(scheduler.begin_run(now));
        assert!(scheduler.is_running());
        assert!(!scheduler.begin_run(now + Duration::from_secs(5)));
        scheduler.cancel_run();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.state().current_interval_secs, 0.1);
    }

    #[test]
    fn test_fallback_latch() {
        let mut scheduler = AdaptiveScheduler::new(settings(0.1));
        let mut now = Instant::now();
        for _ in 0..3 {
            assert_eq!(scheduler.mode(), SchedulerMode::Live);
            now += Duration::from_secs(5);
            assert!(run(&mut scheduler, now, 20, failed()));
        }
        assert_eq!(scheduler.mode(), SchedulerMode::Fallback);
        assert!(scheduler
            .state()
            .fallback_reason
            .as_deref()
            .unwrap()
            .contains("backend exploded"));

        // Later runs would succeed, but none is started
        for _ in 0..5 {
            now += Duration::from_secs(5);
            assert!(scheduler.tick(now, ok).is_none());
            assert!(scheduler.is_fallback());
        }

        scheduler.reset();
        assert_eq!(scheduler.mode(), SchedulerMode::Live);
        assert_eq!(scheduler.state().consecutive_errors, 0);
        assert!(scheduler.tick(now, ok).is_some());
    }

    #[test]
    fn test_success_resets_error_count() {
        let mut scheduler = AdaptiveScheduler::new(settings(0.1));
        let mut now = Instant::now();
        for result in [failed(), failed(), ok(), failed(), failed()] {
            now += Duration::from_secs(5);
            run(&mut scheduler, now, 20, result);
        }
        assert_eq!(scheduler.mode(), SchedulerMode::Live);
        assert_eq!(scheduler.state().consecutive_errors, 2);
    }

    #[test]
    fn test_non_adaptive_keeps_interval() {
        let mut scheduler = AdaptiveScheduler::new(SchedulerSettings {
            adaptive: false,
            ..settings(0.3)
        });
        run(&mut scheduler, Instant::now(), 500, ok());
        assert_eq!(scheduler.state().current_interval_secs, 0.3);
    }

    #[test]
    fn test_tick_runs_chain_when_due() {
        let mut scheduler = AdaptiveScheduler::new(settings(0.3));
        let now = Instant::now();
        let result = scheduler.tick(now, || Ok::<_, InferenceFailure>(7));
        assert_eq!(result.unwrap().unwrap(), 7);
        assert!(scheduler.tick(now, || Ok::<_, InferenceFailure>(8)).is_none());
    }
}
