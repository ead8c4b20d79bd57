//! Latency tracking for progress and ETA reporting

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Running average of per-block latency
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    total: Duration,
    count: u64,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self {
            total: Duration::ZERO,
            count: 0,
        }
    }

    /// Record one completed call
    pub fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Average latency, `None` before the first sample
    pub fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        Some(self.total / self.count.min(u32::MAX as u64) as u32)
    }

    /// Time left for `remaining` more calls at the current average
    pub fn eta(&self, remaining: u64) -> Duration {
        match self.average() {
            Some(avg) => avg.saturating_mul(remaining.min(u32::MAX as u64) as u32),
            None => Duration::ZERO,
        }
    }

    /// Wall-clock finish time for `remaining` more calls
    pub fn finish_at(&self, remaining: u64) -> DateTime<Utc> {
        let eta = chrono::Duration::from_std(self.eta(remaining))
            .unwrap_or(chrono::Duration::zero());
        Utc::now() + eta
    }

    /// Projected total: calls done so far plus how many more fit in `remaining_time`
    pub fn projected_total(&self, remaining_time: Duration) -> u64 {
        match self.average() {
            Some(avg) if !avg.is_zero() => {
                self.count + (remaining_time.as_nanos() / avg.as_nanos()) as u64
            }
            _ => self.count,
        }
    }
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new()
    }
}
