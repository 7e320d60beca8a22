//! Client configuration and pure override merging.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{ApiError, CircuitBreakerConfig, Middleware, Result, RetryPolicy};

/// Header carrying the API key when no middleware supplies one.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Configures one [`crate::BaseClient`].
///
/// A client never mutates its configuration; [`ClientConfig::merge`] produces
/// a new value and [`crate::BaseClient::create`] builds a fresh client from it.
///
/// The `Debug` implementation redacts the API key.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL every request path is joined onto.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Default per-attempt timeout. Zero disables the deadline.
    pub timeout: Duration,
    /// Keep cookies returned by the platform and send them back.
    pub with_credentials: bool,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Interceptors, run in order.
    pub middleware: Vec<Arc<dyn Middleware>>,
    /// Log every attempt at `debug` level instead of `trace`.
    pub debug: bool,
    pub user_agent: String,
    /// Path probed by [`crate::BaseClient::health`].
    pub health_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_owned(),
            api_key: None,
            timeout: Duration::from_secs(30),
            with_credentials: false,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            middleware: Vec::new(),
            debug: false,
            user_agent: format!("admin-http/{}", env!("CARGO_PKG_VERSION")),
            health_path: "/".to_owned(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let middleware: Vec<&str> = self.middleware.iter().map(|m| m.name()).collect();
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("with_credentials", &self.with_credentials)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("middleware", &middleware)
            .field("debug", &self.debug)
            .field("user_agent", &self.user_agent)
            .field("health_path", &self.health_path)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.with_credentials = with_credentials;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Appends an interceptor after the ones already configured.
    pub fn with_middleware<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_health_path(mut self, health_path: impl Into<String>) -> Self {
        self.health_path = health_path.into();
        self
    }

    /// Returns a new configuration with every `Some` override applied.
    pub fn merge(&self, overrides: ClientOverrides) -> Self {
        let base = self.clone();
        Self {
            base_url: overrides.base_url.unwrap_or(base.base_url),
            api_key: overrides.api_key.or(base.api_key),
            timeout: overrides.timeout.unwrap_or(base.timeout),
            with_credentials: overrides.with_credentials.unwrap_or(base.with_credentials),
            retry: overrides.retry.unwrap_or(base.retry),
            circuit_breaker: overrides.circuit_breaker.unwrap_or(base.circuit_breaker),
            middleware: overrides.middleware.unwrap_or(base.middleware),
            debug: overrides.debug.unwrap_or(base.debug),
            user_agent: overrides.user_agent.unwrap_or(base.user_agent),
            health_path: overrides.health_path.unwrap_or(base.health_path),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(ApiError::config("base_url cannot be empty"));
        }
        let url = reqwest::Url::parse(&self.base_url)
            .map_err(|err| ApiError::config(format!("invalid base_url '{}': {err}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ApiError::config(format!(
                "unsupported base_url scheme '{}'",
                url.scheme()
            )));
        }

        let retry = &self.retry;
        if retry.initial_delay > retry.max_delay {
            return Err(ApiError::config(format!(
                "retry initial_delay ({:?}) must be <= max_delay ({:?})",
                retry.initial_delay, retry.max_delay
            )));
        }
        if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
            return Err(ApiError::config(format!(
                "retry backoff_factor must be a finite value >= 1.0, got {}",
                retry.backoff_factor
            )));
        }

        let breaker = &self.circuit_breaker;
        if breaker.enabled && breaker.failure_threshold == 0 {
            return Err(ApiError::config(
                "circuit breaker failure_threshold must be > 0",
            ));
        }
        if breaker.enabled && breaker.recovery_timeout.is_zero() {
            return Err(ApiError::config(
                "circuit breaker recovery_timeout must be > 0",
            ));
        }

        Ok(())
    }
}

/// Field-by-field overrides for [`ClientConfig::merge`]. `None` keeps the
/// existing value.
#[derive(Clone, Default)]
pub struct ClientOverrides {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Option<Duration>,
    pub with_credentials: Option<bool>,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Replaces the whole interceptor list.
    pub middleware: Option<Vec<Arc<dyn Middleware>>>,
    pub debug: Option<bool>,
    pub user_agent: Option<String>,
    pub health_path: Option<String>,
}

impl fmt::Debug for ClientOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOverrides")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("middleware", &self.middleware.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{ClientConfig, ClientOverrides, CircuitBreakerConfig, ErrorKind, RetryPolicy};

    #[test]
    fn merge_replaces_only_supplied_fields() {
        let base = ClientConfig::new("https://admin.example.com/api/v2")
            .with_api_key("key-1")
            .with_timeout(Duration::from_secs(5));

        let merged = base.merge(ClientOverrides {
            timeout: Some(Duration::from_secs(1)),
            retry: Some(RetryPolicy::no_retry()),
            ..ClientOverrides::default()
        });

        assert_eq!(merged.base_url, "https://admin.example.com/api/v2");
        assert_eq!(merged.api_key.as_deref(), Some("key-1"));
        assert_eq!(merged.timeout, Duration::from_secs(1));
        assert_eq!(merged.retry.max_attempts, 1);
        assert_eq!(base.timeout, Duration::from_secs(5));
        assert_eq!(base.retry.max_attempts, 3);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad_url = ClientConfig::new("not a url").validate().expect_err("must fail");
        assert!(matches!(bad_url.kind(), ErrorKind::Config { .. }));

        let bad_delays = ClientConfig::new("https://admin.example.com")
            .with_retry(RetryPolicy::default().with_delays(Duration::from_secs(10), Duration::from_secs(1)))
            .validate();
        assert!(bad_delays.is_err());

        let bad_breaker = ClientConfig::new("https://admin.example.com")
            .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(0))
            .validate();
        assert!(bad_breaker.is_err());

        let disabled_breaker = ClientConfig::new("https://admin.example.com")
            .with_circuit_breaker(CircuitBreakerConfig::disabled().with_failure_threshold(0))
            .validate();
        assert!(disabled_breaker.is_ok());
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = ClientConfig::new("https://admin.example.com").with_api_key("secret-key");
        let debug = format!("{config:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-key"));
    }

    #[test]
    fn default_user_agent_is_stable() {
        let config = ClientConfig::default();
        assert!(config.user_agent.starts_with("admin-http/"));
    }
}
