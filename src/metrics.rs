use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{BreakerSnapshot, CircuitState, RetryPolicy};

/// Number of response-time samples kept per client.
pub const RESPONSE_TIME_SAMPLES: usize = 100;

/// Running request counters for one client.
#[derive(Debug, Default)]
pub(crate) struct HealthMetrics {
    active: u64,
    total: u64,
    success: u64,
    errors: u64,
    response_times: VecDeque<Duration>,
    last_error_at: Option<DateTime<Utc>>,
}

impl HealthMetrics {
    pub fn begin(&mut self) {
        self.active += 1;
        self.total += 1;
    }

    pub fn end(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn record_success(&mut self, elapsed: Duration) {
        self.success += 1;
        if self.response_times.len() == RESPONSE_TIME_SAMPLES {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
        self.last_error_at = Some(Utc::now());
    }

    pub fn clear_samples(&mut self) {
        self.response_times.clear();
        self.last_error_at = None;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let error_rate = if self.total == 0 {
            0.0
        } else {
            self.errors as f64 / self.total as f64
        };
        let average_response_time = if self.response_times.is_empty() {
            None
        } else {
            let sum: Duration = self.response_times.iter().sum();
            Some(sum / self.response_times.len() as u32)
        };

        MetricsSnapshot {
            active_requests: self.active,
            total_requests: self.total,
            success_count: self.success,
            error_count: self.errors,
            error_rate,
            average_response_time,
            samples: self.response_times.len(),
            last_error_at: self.last_error_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricsSnapshot {
    pub active_requests: u64,
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// `error_count / total_requests`, zero before the first request.
    pub error_rate: f64,
    pub average_response_time: Option<Duration>,
    /// Response-time samples currently retained.
    pub samples: usize,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Result of [`crate::BaseClient::health`].
#[derive(Clone, Debug, PartialEq)]
pub struct HealthReport {
    /// Circuit not open and the connectivity probe got an answer.
    pub healthy: bool,
    pub reachable: bool,
    pub circuit_state: CircuitState,
    pub error_rate: f64,
    pub average_response_time: Option<Duration>,
    pub active_requests: u64,
    pub total_requests: u64,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Synchronous snapshot of a client's internals.
#[derive(Clone, Debug)]
pub struct Diagnostics {
    pub base_url: String,
    pub retry: RetryPolicy,
    pub circuit: BreakerSnapshot,
    pub metrics: MetricsSnapshot,
    pub active_request_ids: Vec<String>,
    pub progress_listeners: usize,
    pub disposed: bool,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{HealthMetrics, RESPONSE_TIME_SAMPLES};

    #[test]
    fn ring_keeps_latest_samples() {
        let mut metrics = HealthMetrics::default();
        for ms in 0..(RESPONSE_TIME_SAMPLES as u64 + 20) {
            metrics.begin();
            metrics.record_success(Duration::from_millis(ms));
            metrics.end();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.samples, RESPONSE_TIME_SAMPLES);
        // Samples 20..=119 remain; their mean is 69.5 ms.
        assert_eq!(
            snapshot.average_response_time,
            Some(Duration::from_micros(69_500))
        );
        assert_eq!(snapshot.active_requests, 0);
    }

    #[test]
    fn error_rate_and_clear() {
        let mut metrics = HealthMetrics::default();
        assert_eq!(metrics.snapshot().error_rate, 0.0);

        for _ in 0..4 {
            metrics.begin();
        }
        metrics.record_error();
        metrics.record_success(Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_requests, 4);
        assert_eq!(snapshot.error_rate, 0.25);
        assert!(snapshot.last_error_at.is_some());

        metrics.clear_samples();
        let cleared = metrics.snapshot();
        assert_eq!(cleared.samples, 0);
        assert_eq!(cleared.average_response_time, None);
        assert_eq!(cleared.last_error_at, None);
        assert_eq!(cleared.total_requests, 4);
    }

    #[test]
    fn end_never_underflows() {
        let mut metrics = HealthMetrics::default();
        metrics.end();
        assert_eq!(metrics.snapshot().active_requests, 0);
    }
}
