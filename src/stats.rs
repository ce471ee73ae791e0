//! Statistics history tracking for the gateway.
//!
//! This module provides structures and methods to track and aggregate
//! ingest/publish throughput over time windows for the periodic stats
//! reporter.

use std::collections::VecDeque;

/// One throughput sample.
#[derive(Debug, Clone, Copy)]
pub struct GatewaySample {
    /// Frames received so far (monotonic).
    pub messages_received: u64,
    /// Records published so far (monotonic).
    pub messages_published: u64,
    /// Counted drops so far (monotonic).
    pub messages_failed: u64,
    /// Active TCP sessions at sample time.
    pub active_sessions: usize,
    /// Sample time, seconds since the UNIX epoch.
    pub timestamp: u64,
}

/// Simple stats buffer history
pub struct StatsHistory {
    /// Recent N seconds samples
    pub samples: VecDeque<GatewaySample>,
    /// Max retention time in seconds
    pub max_age_secs: u64,
}

impl StatsHistory {
    /// Creates a new `StatsHistory` with the specified maximum retention time.
    pub fn new(max_age_secs: u64) -> Self {
        let capacity = max_age_secs.min(86_400) as usize;
        Self {
            samples: VecDeque::with_capacity(capacity),
            max_age_secs,
        }
    }

    /// Add sample and clean up old data.
    pub fn push(&mut self, sample: GatewaySample) {
        self.samples.push_back(sample);

        if let Some(latest) = self.samples.back() {
            let cutoff = latest.timestamp.saturating_sub(self.max_age_secs);
            while let Some(oldest) = self.samples.front() {
                if oldest.timestamp < cutoff {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Calculate aggregated throughput for a specified time window.
    ///
    /// Uses binary search to efficiently find the start of the time window;
    /// timestamps are strictly monotonically increasing.
    pub fn aggregate(&self, window_secs: u64) -> Option<AggregatedStats> {
        if self.samples.is_empty() {
            return None;
        }

        let latest = self.samples.back()?;
        let cutoff = latest.timestamp.saturating_sub(window_secs);

        // partition_point finds the first sample with timestamp >= cutoff
        let start_idx = self.samples.partition_point(|s| s.timestamp < cutoff);
        if start_idx >= self.samples.len() {
            return None;
        }

        let first = self.samples[start_idx];
        let span_secs = latest.timestamp.saturating_sub(first.timestamp).max(1);
        let received = latest
            .messages_received
            .saturating_sub(first.messages_received);
        let published = latest
            .messages_published
            .saturating_sub(first.messages_published);
        let failed = latest.messages_failed.saturating_sub(first.messages_failed);

        let sessions = self.samples.range(start_idx..);
        let max_sessions = sessions.clone().map(|s| s.active_sessions).max()?;

        Some(AggregatedStats {
            received_per_sec: received as f64 / span_secs as f64,
            published_per_sec: published as f64 / span_secs as f64,
            failed,
            max_sessions,
            sample_count: self.samples.len() - start_idx,
        })
    }
}

/// Aggregated throughput over one window.
#[derive(Debug)]
pub struct AggregatedStats {
    /// Average frames received per second.
    pub received_per_sec: f64,
    /// Average records published per second.
    pub published_per_sec: f64,
    /// Drops counted inside the window.
    pub failed: u64,
    /// Peak concurrent TCP sessions in the window.
    pub max_sessions: usize,
    /// Number of samples in the window.
    pub sample_count: usize,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn sample(received: u64, published: u64, failed: u64, sessions: usize, ts: u64) -> GatewaySample {
        GatewaySample {
            messages_received: received,
            messages_published: published,
            messages_failed: failed,
            active_sessions: sessions,
            timestamp: ts,
        }
    }

    #[test]
    fn test_retention_prunes_old_samples() {
        let mut history = StatsHistory::new(60);

        for i in 0..70u64 {
            history.push(sample(i, i, 0, 1, i));
        }
        // Samples 0-8 fall outside the 60s window behind t=69
        assert_eq!(history.samples.len(), 61);
        assert_eq!(
            history
                .samples
                .front()
                .expect("history not empty")
                .timestamp,
            9
        );
    }

    #[test]
    fn test_aggregate_rates() {
        let mut history = StatsHistory::new(100);

        // 100 msgs/sec received, 90/sec published, 10 failures over 10s
        for i in 0..=10u64 {
            history.push(sample(i * 100, i * 90, i, 5, i));
        }

        let agg = history.aggregate(10).expect("aggregation");
        assert!((agg.received_per_sec - 100.0).abs() < 1e-9);
        assert!((agg.published_per_sec - 90.0).abs() < 1e-9);
        assert_eq!(agg.failed, 10);
        assert_eq!(agg.max_sessions, 5);
        assert_eq!(agg.sample_count, 11);
    }

    #[test]
    fn test_aggregate_window_subset() {
        let mut history = StatsHistory::new(100);
        for i in 0..=10u64 {
            history.push(sample(i * 10, i * 10, 0, i as usize, i));
        }

        // Window of 3s behind t=10 covers t=7..=10
        let agg = history.aggregate(3).expect("aggregation");
        assert_eq!(agg.sample_count, 4);
        assert_eq!(agg.max_sessions, 10);
    }

    #[test]
    fn test_empty_history() {
        let history = StatsHistory::new(60);
        assert!(history.aggregate(60).is_none());
    }

    #[test]
    fn test_counter_reset_is_clamped() {
        let mut history = StatsHistory::new(100);
        history.push(sample(1000, 1000, 5, 1, 0));
        // A restart would reset counters; rates must not underflow
        history.push(sample(10, 10, 0, 1, 1));
        let agg = history.aggregate(10).expect("aggregation");
        assert_eq!(agg.received_per_sec, 0.0);
        assert_eq!(agg.failed, 0);
    }
}
