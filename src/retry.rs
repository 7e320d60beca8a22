use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// Transport-level failure classes the retry policy can opt into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    /// Connection could not be established (DNS, refused, unreachable).
    Connect,
    /// The transport gave up waiting on the peer.
    Timeout,
    /// The request could not be written.
    Request,
    /// The response body could not be read to completion.
    Body,
    /// Redirect loop or redirect policy violation.
    Redirect,
    /// Anything reqwest does not classify more precisely.
    Other,
}

impl NetworkErrorKind {
    pub(crate) fn classify(err: &reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Connect
        } else if err.is_timeout() {
            Self::Timeout
        } else if err.is_redirect() {
            Self::Redirect
        } else if err.is_body() || err.is_decode() {
            Self::Body
        } else if err.is_request() {
            Self::Request
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Request => "request",
            Self::Body => "body",
            Self::Redirect => "redirect",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Retry and backoff behavior for one logical request.
///
/// The delay before attempt `k + 1` is
/// `min(initial_delay * backoff_factor^(k - 1), max_delay)`, scaled by a
/// uniform factor in `[0.5, 1.0)` when `jitter` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 behave as 1.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub retryable_status_codes: BTreeSet<u16>,
    pub retryable_network_errors: BTreeSet<NetworkErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            jitter: true,
            retryable_status_codes: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            retryable_network_errors: [
                NetworkErrorKind::Connect,
                NetworkErrorKind::Timeout,
                NetworkErrorKind::Request,
                NetworkErrorKind::Body,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the total number of attempts, the first one included.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the first backoff delay and the cap on later ones.
    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    /// Sets the multiplier applied to the delay after each failed attempt.
    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    /// Enables or disables scaling each delay into `[0.5, 1.0)` of its base.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the set of HTTP statuses that may be retried.
    pub fn with_retryable_status_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Replaces the set of transport failure classes that may be retried.
    /// An empty set makes every transport failure final.
    pub fn with_retryable_network_errors<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = NetworkErrorKind>,
    {
        self.retryable_network_errors = kinds.into_iter().collect();
        self
    }

    /// Effective number of attempts.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Client errors other than 408 and 429 are never retried, whatever the
    /// configured set says.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        if (400..500).contains(&status) && status != 408 && status != 429 {
            return false;
        }
        self.retryable_status_codes.contains(&status)
    }

    /// Whether a transport failure of class `kind` may be retried.
    pub fn is_retryable_network(&self, kind: NetworkErrorKind) -> bool {
        self.retryable_network_errors.contains(&kind)
    }

    /// Un-jittered delay after the failed attempt number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }

    /// Delay to sleep after the failed attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, fastrand::f64())
    }

    /// `unit` is a sample from `[0, 1)`; it is mapped onto `[0.5, 1.0)`.
    pub(crate) fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let scale = 0.5 + 0.5 * unit.clamp(0.0, 1.0 - f64::EPSILON);
        delay.mul_f64(scale)
    }
}
