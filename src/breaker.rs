//! Per-client circuit breaker.
//!
//! ```text
//! Closed   --failure_count >= threshold-->  Open
//! Open     --recovery_timeout elapsed-->    HalfOpen (one probe admitted)
//! HalfOpen --probe succeeds-->              Closed
//! HalfOpen --probe fails-->                 Open
//! ```

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is admitted.
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
    /// A failure arriving this long after the previous one starts a new
    /// streak. Zero keeps streaks forever.
    #[serde(with = "duration_ms")]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that admits every request and records nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets how many consecutive failures open the circuit.
    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    /// Sets how long an open circuit waits before admitting a probe.
    pub fn with_recovery_timeout(mut self, recovery_timeout: Duration) -> Self {
        self.recovery_timeout = recovery_timeout;
        self
    }

    /// Sets the gap after which a new failure starts a fresh streak.
    pub fn with_monitoring_period(mut self, monitoring_period: Duration) -> Self {
        self.monitoring_period = monitoring_period;
        self
    }
}

/// Point-in-time view of a breaker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Time left before an open circuit admits a probe.
    pub retry_after: Option<Duration>,
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                opened_at: None,
                probe_started: None,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decides whether a request may go out now.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// and admits exactly one probe.
    pub fn can_make_request(&self) -> bool {
        self.can_make_request_at(Instant::now())
    }

    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(previous = %inner.state, "circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_started = None;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn can_make_request_at(&self, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovery = self.config.recovery_timeout;
                if inner
                    .opened_at
                    .is_some_and(|opened| now.saturating_duration_since(opened) < recovery)
                {
                    return false;
                }
                tracing::debug!(failures = inner.failure_count, "circuit breaker half-open");
                inner.state = CircuitState::HalfOpen;
                inner.probe_started = Some(now);
                true
            }
            CircuitState::HalfOpen => {
                // A probe that never reported back is treated as lost.
                let lost = inner
                    .probe_started
                    .map_or(true, |started| {
                        now.saturating_duration_since(started) >= self.config.recovery_timeout
                    });
                if lost {
                    inner.probe_started = Some(now);
                }
                lost
            }
        }
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.lock();

        let period = self.config.monitoring_period;
        let stale = inner
            .last_failure
            .is_some_and(|last| !period.is_zero() && now.saturating_duration_since(last) > period);
        if inner.state == CircuitState::Closed && stale {
            inner.failure_count = 0;
        }

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(now);

        let tripped = inner.failure_count >= self.config.failure_threshold;
        if tripped || inner.state == CircuitState::HalfOpen {
            if inner.state != CircuitState::Open {
                tracing::warn!(
                    failures = inner.failure_count,
                    recovery_ms = self.config.recovery_timeout.as_millis() as u64,
                    "circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.probe_started = None;
        }
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> BreakerSnapshot {
        let inner = self.lock();
        let retry_after = match inner.state {
            CircuitState::Open => inner.opened_at.map(|opened| {
                self.config
                    .recovery_timeout
                    .saturating_sub(now.saturating_duration_since(opened))
            }),
            _ => None,
        };
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            retry_after,
            since_last_failure: inner.last_failure.map(|last| now.saturating_duration_since(last)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
