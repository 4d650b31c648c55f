//! Sliding-window throughput tracking.
//!
//! Every client and server session owns one `RateWindow` fed with
//! `(byte_count, timestamp)` samples. The rate is the sum of the byte counts
//! divided by the span between the oldest and newest sample, so it reflects
//! only the most recent `capacity` operations.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Number of samples kept per window.
pub const DEFAULT_WINDOW_CAPACITY: usize = 500;

const MIB: u64 = 1024 * 1024;

/// The window cannot produce a rate yet.
///
/// Returned when fewer than two samples are held, or when every sample
/// carries the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsufficientSamples;

impl fmt::Display for InsufficientSamples {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not enough samples to compute a rate")
    }
}

impl std::error::Error for InsufficientSamples {}

/// Bounded ring of `(byte_count, timestamp)` samples.
#[derive(Debug, Clone)]
pub struct RateWindow {
    samples: VecDeque<(u64, Instant)>,
    capacity: usize,
    /// Running sum of byte counts held in `samples`.
    total: u64,
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl RateWindow {
    /// Create an empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    /// Append a sample, discarding the oldest once capacity is exceeded.
    ///
    /// Timestamps earlier than the newest held sample are clamped to it so
    /// the window stays non-decreasing.
    pub fn record(&mut self, byte_count: usize, timestamp: Instant) {
        let timestamp = match self.samples.back() {
            Some(&(_, newest)) if timestamp < newest => newest,
            _ => timestamp,
        };

        if self.samples.len() == self.capacity {
            if let Some((dropped, _)) = self.samples.pop_front() {
                self.total -= dropped;
            }
        }

        self.samples.push_back((byte_count as u64, timestamp));
        self.total += byte_count as u64;
    }

    /// Bytes per second across the held samples.
    pub fn current_rate(&self) -> Result<f64, InsufficientSamples> {
        let (Some(&(_, oldest)), Some(&(_, newest))) = (self.samples.front(), self.samples.back())
        else {
            return Err(InsufficientSamples);
        };

        if self.samples.len() < 2 {
            return Err(InsufficientSamples);
        }

        let span = newest.duration_since(oldest).as_secs_f64();
        if span <= 0.0 {
            return Err(InsufficientSamples);
        }

        Ok(self.total as f64 / span)
    }

    /// Timestamp of the newest sample.
    pub fn last_sample(&self) -> Option<Instant> {
        self.samples.back().map(|&(_, t)| t)
    }

    /// Drop every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.total = 0;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Tracks when a session last emitted a rate report.
#[derive(Debug, Clone, Copy)]
pub struct ReportClock {
    last_report: Instant,
    interval: Duration,
}

impl ReportClock {
    pub fn new(start: Instant, interval: Duration) -> Self {
        Self {
            last_report: start,
            interval,
        }
    }

    /// True once strictly more than `interval` has passed since the last report.
    pub fn should_report(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_report) > self.interval
    }

    pub fn mark_reported(&mut self, now: Instant) {
        self.last_report = now;
    }

    /// Check the clock and, when due, compute the window's rate.
    ///
    /// The clock is reset whenever a report is due, even if the window cannot
    /// yet produce a rate; in that case the report is skipped.
    pub fn poll(&mut self, window: &RateWindow, now: Instant) -> Option<f64> {
        if !self.should_report(now) {
            return None;
        }
        self.mark_reported(now);
        window.current_rate().ok()
    }
}

/// Fires once each time a cumulative byte count crosses a new MiB boundary.
#[derive(Debug, Default, Clone, Copy)]
pub struct MibMilestone {
    last_reported: u64,
}

impl MibMilestone {
    /// Returns the new whole-MiB total when `total_bytes` crossed a boundary.
    pub fn advance(&mut self, total_bytes: u64) -> Option<u64> {
        let mib = total_bytes / MIB;
        if mib > self.last_reported {
            self.last_reported = mib;
            Some(mib)
        } else {
            None
        }
    }
}

/// Format a bytes-per-second rate as kB/s for log lines.
pub fn kb_per_sec(rate: f64) -> String {
    format!("{:.1}", rate / 1000.0)
}
