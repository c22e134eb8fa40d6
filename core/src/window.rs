//! Sliding windows of call outcomes
//!
//! This module provides two aggregating windows:
//! - `CountWindow`: ring buffer over the last N outcomes
//! - `TimeWindow`: ring of time buckets covering the last window duration
//!
//! Both keep running totals so that a write is O(1): the contribution of an
//! evicted slot or bucket is subtracted before the new outcome is added.

use crate::clock::Clock;
use crate::{Outcome, OutcomeKind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Rate reported while fewer than the minimum number of calls are buffered
pub const NOT_ENOUGH_DATA: f32 = -1.0;

/// Aggregating window of recent outcomes
pub trait SlidingWindow: Send + Sync + std::fmt::Debug {
    /// Record an outcome and return the aggregate including it
    fn record(&self, outcome: &Outcome) -> WindowSnapshot;

    /// Current aggregate without recording anything
    fn snapshot(&self) -> WindowSnapshot;

    /// Drop every buffered outcome
    fn reset(&self);
}

/// Aggregated counts for a slot, a bucket or a whole window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    pub total: usize,
    pub failures: usize,
    pub slow: usize,
}

impl WindowCounts {
    pub(crate) fn add(&mut self, kind: OutcomeKind) {
        self.total += 1;
        if kind.is_failure() {
            self.failures += 1;
        }
        if kind.is_slow() {
            self.slow += 1;
        }
    }

    fn remove(&mut self, kind: OutcomeKind) {
        self.total = self.total.saturating_sub(1);
        if kind.is_failure() {
            self.failures = self.failures.saturating_sub(1);
        }
        if kind.is_slow() {
            self.slow = self.slow.saturating_sub(1);
        }
    }

    fn subtract(&mut self, other: &WindowCounts) {
        self.total = self.total.saturating_sub(other.total);
        self.failures = self.failures.saturating_sub(other.failures);
        self.slow = self.slow.saturating_sub(other.slow);
    }
}

/// Point-in-time aggregate of a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub total_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    pub minimum_calls: usize,
}

impl WindowSnapshot {
    pub(crate) fn new(counts: WindowCounts, minimum_calls: usize) -> Self {
        Self {
            total_calls: counts.total,
            failed_calls: counts.failures,
            slow_calls: counts.slow,
            minimum_calls,
        }
    }

    /// Whether enough calls are buffered for the rates to be meaningful
    pub fn has_enough_calls(&self) -> bool {
        self.total_calls > 0 && self.total_calls >= self.minimum_calls
    }

    /// Failure percentage (0-100), or [`NOT_ENOUGH_DATA`]
    pub fn failure_rate(&self) -> f32 {
        self.rate(self.failed_calls)
    }

    /// Slow call percentage (0-100), or [`NOT_ENOUGH_DATA`]
    ///
    /// Slow calls are counted whether they succeeded or failed.
    pub fn slow_call_rate(&self) -> f32 {
        self.rate(self.slow_calls)
    }

    fn rate(&self, count: usize) -> f32 {
        if !self.has_enough_calls() {
            return NOT_ENOUGH_DATA;
        }
        count as f32 * 100.0 / self.total_calls as f32
    }
}

/// Count-based window over the most recent `size` outcomes
#[derive(Debug)]
pub struct CountWindow {
    state: RwLock<CountState>,
    minimum_calls: usize,
}

#[derive(Debug)]
struct CountState {
    slots: Vec<Option<OutcomeKind>>,
    head: usize,
    totals: WindowCounts,
}

impl CountWindow {
    /// Create a window of `size` slots
    ///
    /// `minimum_calls` is capped at `size`, a full window always has enough data.
    ///
    /// # Panics
    ///
    /// Panics if `size` is 0.
    pub fn new(size: usize, minimum_calls: usize) -> Self {
        assert!(size > 0, "Sliding window size must be greater than 0");
        Self {
            state: RwLock::new(CountState {
                slots: vec![None; size],
                head: 0,
                totals: WindowCounts::default(),
            }),
            minimum_calls: minimum_calls.min(size),
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }
}

impl SlidingWindow for CountWindow {
    fn record(&self, outcome: &Outcome) -> WindowSnapshot {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let head = state.head;

        if let Some(evicted) = state.slots[head].replace(outcome.kind) {
            state.totals.remove(evicted);
        }
        state.totals.add(outcome.kind);
        state.head = (head + 1) % state.slots.len();

        WindowSnapshot::new(state.totals, self.minimum_calls)
    }

    fn snapshot(&self) -> WindowSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        WindowSnapshot::new(state.totals, self.minimum_calls)
    }

    fn reset(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.slots.iter_mut().for_each(|slot| *slot = None);
        state.head = 0;
        state.totals = WindowCounts::default();
    }
}

/// Time-based window split into equally sized buckets
///
/// Buckets are rolled over on access: before any read or write, every bucket
/// whose slot of time has passed out of the window is zeroed and its counts
/// removed from the running totals.
#[derive(Debug)]
pub struct TimeWindow {
    state: Mutex<TimeState>,
    bucket_nanos: u128,
    minimum_calls: usize,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct TimeState {
    buckets: Vec<WindowCounts>,
    head_tick: u128,
    totals: WindowCounts,
}

impl TimeWindow {
    /// Create a window covering `duration`, split into `buckets` buckets
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is 0 or `duration` is shorter than one nanosecond per bucket.
    pub fn new(
        duration: Duration,
        buckets: usize,
        minimum_calls: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        assert!(buckets > 0, "Time window needs at least one bucket");
        let bucket_nanos = duration.as_nanos() / buckets as u128;
        assert!(bucket_nanos > 0, "Time window bucket duration must be > 0");

        let head_tick = clock.now().as_nanos() / bucket_nanos;

        Self {
            state: Mutex::new(TimeState {
                buckets: vec![WindowCounts::default(); buckets],
                head_tick,
                totals: WindowCounts::default(),
            }),
            bucket_nanos,
            minimum_calls,
            clock,
        }
    }

    /// Window with one bucket per second, the layout used by the breaker config
    pub fn per_second(seconds: usize, minimum_calls: usize, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Duration::from_secs(seconds as u64),
            seconds,
            minimum_calls,
            clock,
        )
    }

    fn roll(&self, state: &mut TimeState) -> usize {
        let tick = self.clock.now().as_nanos() / self.bucket_nanos;
        let len = state.buckets.len() as u128;

        if tick > state.head_tick {
            // Only the last `len` ticks can still be inside the window.
            let first = (state.head_tick + 1).max(tick.saturating_sub(len - 1));
            for t in first..=tick {
                let idx = (t % len) as usize;
                let evicted = std::mem::take(&mut state.buckets[idx]);
                state.totals.subtract(&evicted);
            }
            state.head_tick = tick;
        }

        (state.head_tick % len) as usize
    }
}

impl SlidingWindow for TimeWindow {
    fn record(&self, outcome: &Outcome) -> WindowSnapshot {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = self.roll(&mut state);

        state.buckets[idx].add(outcome.kind);
        state.totals.add(outcome.kind);

        WindowSnapshot::new(state.totals, self.minimum_calls)
    }

    fn snapshot(&self) -> WindowSnapshot {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.roll(&mut state);
        WindowSnapshot::new(state.totals, self.minimum_calls)
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .buckets
            .iter_mut()
            .for_each(|bucket| *bucket = WindowCounts::default());
        state.totals = WindowCounts::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn outcome(kind: OutcomeKind) -> Outcome {
        Outcome::new(kind, Duration::from_millis(10), Duration::ZERO)
    }

    #[test]
    fn test_count_window_record_and_snapshot() {
        let window = CountWindow::new(10, 1);

        window.record(&outcome(OutcomeKind::Success));
        window.record(&outcome(OutcomeKind::Success));
        let snapshot = window.record(&outcome(OutcomeKind::Failure));

        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(window.snapshot(), snapshot);
    }

    #[test]
    fn test_count_window_evicts_oldest() {
        let window = CountWindow::new(3, 1);

        window.record(&outcome(OutcomeKind::Failure));
        window.record(&outcome(OutcomeKind::Failure));
        window.record(&outcome(OutcomeKind::Success));
        // Overwrites the first failure
        let snapshot = window.record(&outcome(OutcomeKind::Success));

        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.failed_calls, 1);
    }

    #[test]
    fn test_count_window_matches_last_n_outcomes() {
        let size = 7;
        let window = CountWindow::new(size, 1);
        let mut history = Vec::new();

        // Deterministic pseudo-random sequence
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let kind = match seed % 4 {
                0 => OutcomeKind::Success,
                1 => OutcomeKind::Failure,
                2 => OutcomeKind::SlowSuccess,
                _ => OutcomeKind::SlowFailure,
            };
            history.push(kind);

            let snapshot = window.record(&outcome(kind));
            let recent = &history[history.len().saturating_sub(size)..];
            let failures = recent.iter().filter(|k| k.is_failure()).count();
            let slow = recent.iter().filter(|k| k.is_slow()).count();

            assert!(snapshot.failed_calls <= size);
            assert_eq!(snapshot.failed_calls, failures);
            assert_eq!(snapshot.slow_calls, slow);
            assert_eq!(snapshot.total_calls, recent.len());
        }
    }

    #[test]
    fn test_not_enough_data_below_minimum() {
        let window = CountWindow::new(10, 5);

        for _ in 0..4 {
            window.record(&outcome(OutcomeKind::Failure));
        }
        assert_eq!(window.snapshot().failure_rate(), NOT_ENOUGH_DATA);
        assert_eq!(window.snapshot().slow_call_rate(), NOT_ENOUGH_DATA);

        let snapshot = window.record(&outcome(OutcomeKind::Failure));
        assert_eq!(snapshot.failure_rate(), 100.0);
    }

    #[test]
    fn test_minimum_calls_capped_at_size() {
        let window = CountWindow::new(4, 100);
        for _ in 0..4 {
            window.record(&outcome(OutcomeKind::Failure));
        }

        assert_eq!(window.snapshot().failure_rate(), 100.0);
    }

    #[test]
    fn test_slow_success_counts_toward_slow_rate_only() {
        let window = CountWindow::new(4, 1);

        window.record(&outcome(OutcomeKind::SlowSuccess));
        window.record(&outcome(OutcomeKind::SlowFailure));
        window.record(&outcome(OutcomeKind::Success));
        let snapshot = window.record(&outcome(OutcomeKind::Success));

        assert_eq!(snapshot.failure_rate(), 25.0);
        assert_eq!(snapshot.slow_call_rate(), 50.0);
    }

    #[test]
    fn test_count_window_reset() {
        let window = CountWindow::new(5, 1);
        window.record(&outcome(OutcomeKind::Failure));

        window.reset();

        assert_eq!(window.snapshot().total_calls, 0);
        assert_eq!(window.snapshot().failure_rate(), NOT_ENOUGH_DATA);
    }

    #[test]
    #[should_panic(expected = "Sliding window size must be greater than 0")]
    fn test_count_window_zero_size() {
        CountWindow::new(0, 0);
    }

    #[test]
    fn test_time_window_evicts_expired_buckets() {
        let clock = Arc::new(ManualClock::new());
        let window = TimeWindow::per_second(10, 1, clock.clone());

        window.record(&outcome(OutcomeKind::Failure));
        clock.advance(Duration::from_secs(5));
        window.record(&outcome(OutcomeKind::Success));
        assert_eq!(window.snapshot().total_calls, 2);

        // First bucket leaves the window, second one is still inside
        clock.advance(Duration::from_secs(6));
        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.failed_calls, 0);

        clock.advance(Duration::from_secs(60));
        assert_eq!(window.snapshot().total_calls, 0);
    }

    #[test]
    fn test_time_window_same_bucket_accumulates() {
        let clock = Arc::new(ManualClock::new());
        let window = TimeWindow::new(Duration::from_secs(1), 4, 1, clock.clone());

        for _ in 0..3 {
            window.record(&outcome(OutcomeKind::SlowFailure));
        }
        clock.advance(Duration::from_millis(100));
        let snapshot = window.record(&outcome(OutcomeKind::Success));

        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.failed_calls, 3);
        assert_eq!(snapshot.slow_calls, 3);
        assert_eq!(snapshot.failure_rate(), 75.0);
    }

    #[test]
    fn test_time_window_reset() {
        let clock = Arc::new(ManualClock::new());
        let window = TimeWindow::per_second(5, 1, clock);

        window.record(&outcome(OutcomeKind::Failure));
        window.reset();

        assert_eq!(window.snapshot().total_calls, 0);
    }
}
