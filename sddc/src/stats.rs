//! Streaming throughput counters.
//!
//! The producer and consumer threads bump the [`SessionStats`] counters as
//! they go. A ticker thread calls [`SessionStats::tick`] periodically, which
//! turns the counters into rates over a rolling window. Readers only ever see
//! [`StatsSnapshot`] copies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Point-in-time copy of a session's statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Raw bytes received from the transport.
    pub bytes: u64,
    /// Baseband samples handed to the callback.
    pub samples: u64,
    /// Transport reads that failed and were skipped.
    pub read_failures: u64,
    /// Raw blocks dropped because the processing side fell behind.
    pub overruns: u64,
    /// Raw byte rate over the rolling window.
    pub bytes_per_sec: f64,
    /// Baseband sample rate over the rolling window.
    pub samples_per_sec: f64,
}

/// Rolling-window rate estimator.
///
/// Fed with cumulative totals, it reports the average rate between the oldest
/// and newest points still inside the window.
#[derive(Clone, Debug)]
pub struct RateWindow {
    window: Duration,
    points: VecDeque<(Instant, u64, u64)>,
}

impl RateWindow {
    /// Average over the last `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            points: VecDeque::new(),
        }
    }

    /// Forget every point.
    pub fn reset(&mut self) {
        self.points.clear();
    }

    /// Record cumulative `bytes` and `samples` at `now`, returning the bytes
    /// and samples per second over the window.
    pub fn update(&mut self, now: Instant, bytes: u64, samples: u64) -> (f64, f64) {
        self.points.push_back((now, bytes, samples));
        while let Some(&(t, _, _)) = self.points.front() {
            if now.duration_since(t) > self.window && self.points.len() > 2 {
                self.points.pop_front();
            } else {
                break;
            }
        }
        let (Some(&(t0, b0, s0)), Some(&(t1, b1, s1))) = (self.points.front(), self.points.back())
        else {
            return (0.0, 0.0);
        };
        let dt = t1.duration_since(t0).as_secs_f64();
        if dt <= 0.0 {
            return (0.0, 0.0);
        }
        (
            b1.saturating_sub(b0) as f64 / dt,
            s1.saturating_sub(s0) as f64 / dt,
        )
    }
}

#[derive(Default)]
struct Rates {
    bytes_per_sec: f64,
    samples_per_sec: f64,
}

/// Counters for one streaming session, shared between its threads.
pub struct SessionStats {
    bytes: AtomicU64,
    samples: AtomicU64,
    read_failures: AtomicU64,
    overruns: AtomicU64,
    window: Mutex<RateWindow>,
    rates: Mutex<Rates>,
}

impl SessionStats {
    /// Zeroed counters with a rolling window of `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            bytes: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            window: Mutex::new(RateWindow::new(window)),
            rates: Mutex::new(Rates::default()),
        }
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_samples(&self, n: u64) {
        self.samples.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_read_failure(&self) -> u64 {
        self.read_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn add_overrun(&self) -> u64 {
        self.overruns.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Zero every counter and forget the rate history.
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
        self.read_failures.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        *self.rates.lock().unwrap_or_else(PoisonError::into_inner) = Rates::default();
    }

    /// Recompute the rates from the counters as of `now`.
    pub fn tick(&self, now: Instant) {
        let bytes = self.bytes.load(Ordering::Relaxed);
        let samples = self.samples.load(Ordering::Relaxed);
        let (bytes_per_sec, samples_per_sec) = self
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(now, bytes, samples);
        *self.rates.lock().unwrap_or_else(PoisonError::into_inner) = Rates {
            bytes_per_sec,
            samples_per_sec,
        };
    }

    /// Current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        let rates = self.rates.lock().unwrap_or_else(PoisonError::into_inner);
        StatsSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            bytes_per_sec: rates.bytes_per_sec,
            samples_per_sec: rates.samples_per_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_converges_to_steady_throughput() {
        let mut w = RateWindow::new(Duration::from_secs(2));
        let t0 = Instant::now();
        let tick = Duration::from_millis(250);
        let mut rate = (0.0, 0.0);
        // 1 MB and 0.25 MS per tick: 4 MB/s and 1 MS/s.
        for i in 0..40u32 {
            rate = w.update(t0 + tick * i, 1_000_000 * i as u64, 250_000 * i as u64);
        }
        assert!((rate.0 - 4_000_000.0).abs() < 1.0);
        assert!((rate.1 - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn window_forgets_old_throughput() {
        let mut w = RateWindow::new(Duration::from_secs(2));
        let t0 = Instant::now();
        let tick = Duration::from_millis(250);
        let mut total = 0;
        for i in 0..40u32 {
            // Fast for the first 5 s, then stalled.
            if i < 20 {
                total += 1000;
            }
            w.update(t0 + tick * i, total, 0);
        }
        let (bps, _) = w.update(t0 + tick * 40, total, 0);
        assert_eq!(bps, 0.0);
    }

    #[test]
    fn single_point_has_no_rate() {
        let mut w = RateWindow::new(Duration::from_secs(2));
        assert_eq!(w.update(Instant::now(), 100, 100), (0.0, 0.0));
    }

    #[test]
    fn counters_and_reset() {
        let stats = SessionStats::new(Duration::from_secs(2));
        let t0 = Instant::now();
        stats.tick(t0);
        stats.add_bytes(4096);
        stats.add_samples(1024);
        assert_eq!(stats.add_read_failure(), 1);
        assert_eq!(stats.add_overrun(), 1);
        stats.tick(t0 + Duration::from_secs(1));
        let snap = stats.snapshot();
        assert_eq!(snap.bytes, 4096);
        assert_eq!(snap.samples, 1024);
        assert_eq!(snap.read_failures, 1);
        assert_eq!(snap.overruns, 1);
        assert!((snap.bytes_per_sec - 4096.0).abs() < 1e-6);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
