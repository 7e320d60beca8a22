use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Method;

use crate::{
    executor::Executor,
    metrics::HealthMetrics,
    middleware::{self, ErrorOutcome},
    request::{build_headers, build_url},
    ApiError, CancelReason, CancelSignal, CircuitBreaker, CircuitState, ClientConfig,
    ClientOverrides, Diagnostics, ErrorContext, ErrorKind, HealthReport, ProgressTracker,
    QueryParams, RequestBody, RequestConfig, ResponseEnvelope, Result,
};

/// Deadline for the connectivity probe in [`BaseClient::health`].
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
/// HTTP client for the platform API.
///
/// Every request goes through the circuit breaker, the middleware chain and
/// the retrying executor, and is reflected in the client's health metrics.
/// Clones share all of that state.
pub struct BaseClient {
    shared: Arc<Shared>,
}

struct Shared {
    config: ClientConfig,
    http: reqwest::Client,
    breaker: CircuitBreaker,
    metrics: Mutex<HealthMetrics>,
    /// Keyed by a per-registration token; several entries may share a
    /// request id.
    registry: Mutex<HashMap<u64, Registered>>,
    next_token: AtomicU64,
    progress: ProgressTracker,
    disposed: AtomicBool,
}

struct Registered {
    request_id: String,
    signal: CancelSignal,
}

impl Shared {
    fn metrics(&self) -> MutexGuard<'_, HealthMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u64, Registered>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for BaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseClient")
            .field("config", &self.shared.config)
            .field("circuit", &self.shared.breaker.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Keeps a request in the active registry and the active counter until
/// dropped.
struct ActiveRequest<'a> {
    shared: &'a Shared,
    token: u64,
}

impl<'a> ActiveRequest<'a> {
    fn register(shared: &'a Shared, request_id: &str, signal: CancelSignal) -> Self {
        let token = shared.next_token.fetch_add(1, Ordering::Relaxed);
        let mut registry = shared.registry();
        // Checked under the registry lock so a concurrent dispose cannot miss
        // this entry.
        if shared.disposed.load(Ordering::SeqCst) {
            signal.cancel(CancelReason::Disposed);
        }
        registry.insert(
            token,
            Registered {
                request_id: request_id.to_owned(),
                signal,
            },
        );
        Self { shared, token }
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.shared.metrics().end();
        self.shared.registry().remove(&self.token);
    }
}

impl BaseClient {
    /// Creates a client after validating `config`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .cookie_store(config.with_credentials)
            .build()
            .map_err(|err| ApiError::config(format!("failed to build http client: {err}")))?;

        Ok(Self {
            shared: Arc::new(Shared {
                breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
                config,
                http,
                metrics: Mutex::new(HealthMetrics::default()),
                registry: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                progress: ProgressTracker::new(),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Creates an independent client from this client's configuration with
    /// `overrides` applied. Breaker, metrics and registry start fresh.
    pub fn create(&self, overrides: ClientOverrides) -> Result<Self> {
        Self::new(self.shared.config.merge(overrides))
    }

    /// The validated configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Upload and download progress subscriptions for this client.
    ///
    /// ```no_run
    /// # fn demo(client: &admin_http::BaseClient) {
    /// client.progress().subscribe(admin_http::ProgressKind::Download, |event| {
    ///     println!("{} bytes", event.loaded);
    /// });
    /// # }
    /// ```
    pub fn progress(&self) -> &ProgressTracker {
        &self.shared.progress
    }

    /// Current breaker state, without moving an open circuit to half-open.
    pub fn circuit_state(&self) -> CircuitState {
        self.shared.breaker.state()
    }

    /// Whether [`BaseClient::dispose`] has been called on any clone.
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Sends a request through the full pipeline.
    pub async fn request(&self, mut request: RequestConfig) -> Result<ResponseEnvelope> {
        let shared = &*self.shared;

        let request_id = request
            .metadata
            .request_id
            .take()
            .unwrap_or_else(new_id);
        let correlation_id = request
            .metadata
            .correlation_id
            .take()
            .unwrap_or_else(new_id);
        request.metadata.request_id = Some(request_id.clone());
        request.metadata.correlation_id = Some(correlation_id.clone());
        request.metadata.started_at = Some(Utc::now());
        let started = Instant::now();

        shared.metrics().begin();
        let client_signal = CancelSignal::new();
        let _active = ActiveRequest::register(shared, &request_id, client_signal.clone());

        if !shared.breaker.can_make_request() {
            let snapshot = shared.breaker.snapshot();
            shared.metrics().record_error();
            tracing::debug!(
                request_id = %request_id,
                state = %snapshot.state,
                failure_count = snapshot.failure_count,
                "request rejected by circuit breaker"
            );
            return Err(ApiError::new(ErrorKind::CircuitOpen {
                state: snapshot.state,
                failure_count: snapshot.failure_count,
                retry_after: snapshot.retry_after,
            })
            .with_correlation_id(correlation_id)
            .with_context(ErrorContext {
                method: Some(request.method.to_string()),
                request_id: Some(request_id),
                ..ErrorContext::default()
            }));
        }

        let outcome = self.run(request, client_signal).await;

        match outcome {
            Ok(envelope) => {
                let envelope = middleware::run_response(&shared.config.middleware, envelope);
                shared.breaker.record_success();
                shared.metrics().record_success(started.elapsed());
                Ok(envelope)
            }
            Err(err) => {
                shared.breaker.record_failure();
                shared.metrics().record_error();
                let err = if err.correlation_id().is_none() {
                    err.with_correlation_id(correlation_id.clone())
                } else {
                    err
                };
                match middleware::run_error(&shared.config.middleware, err) {
                    ErrorOutcome::Propagate(err) => Err(err),
                    ErrorOutcome::Recover(mut envelope) => {
                        if envelope.meta.request_id.is_empty() {
                            envelope.meta.request_id = request_id;
                        }
                        if envelope.meta.correlation_id.is_empty() {
                            envelope.meta.correlation_id = correlation_id;
                        }
                        Ok(envelope)
                    }
                }
            }
        }
    }

    /// Header merge, request middleware and execution.
    async fn run(
        &self,
        mut request: RequestConfig,
        client_signal: CancelSignal,
    ) -> Result<ResponseEnvelope> {
        let shared = &*self.shared;

        request.headers = build_headers(&shared.config, &request)?;
        let request = middleware::run_request(&shared.config.middleware, request);

        let signal = match &request.cancel {
            Some(caller) => CancelSignal::any([client_signal, caller.clone()]),
            None => client_signal,
        };

        Executor {
            http: &shared.http,
            config: &shared.config,
            progress: &shared.progress,
        }
        .execute(&request, &signal)
        .await
    }

    /// `GET` relative to the base URL.
    ///
    /// ```no_run
    /// # async fn demo(client: admin_http::BaseClient) -> admin_http::Result<()> {
    /// let response = client.get("/system/environment").await?;
    /// println!("{}", response.status.code);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get(&self, path: impl Into<String>) -> Result<ResponseEnvelope> {
        self.request(RequestConfig::get(path)).await
    }

    /// `GET` with query parameters, typically for list endpoints.
    pub async fn get_with(
        &self,
        path: impl Into<String>,
        params: impl Into<QueryParams>,
    ) -> Result<ResponseEnvelope> {
        self.request(RequestConfig::get(path).with_params(params))
            .await
    }

    /// `POST` with `body`; JSON values are serialized as JSON.
    pub async fn post(
        &self,
        path: impl Into<String>,
        body: impl Into<RequestBody>,
    ) -> Result<ResponseEnvelope> {
        self.request(RequestConfig::post(path).with_body(body)).await
    }

    /// `PUT` with `body`.
    pub async fn put(
        &self,
        path: impl Into<String>,
        body: impl Into<RequestBody>,
    ) -> Result<ResponseEnvelope> {
        self.request(RequestConfig::new(Method::PUT, path).with_body(body))
            .await
    }

    /// `PATCH` with `body`.
    pub async fn patch(
        &self,
        path: impl Into<String>,
        body: impl Into<RequestBody>,
    ) -> Result<ResponseEnvelope> {
        self.request(RequestConfig::new(Method::PATCH, path).with_body(body))
            .await
    }

    /// `DELETE` without a body.
    pub async fn delete(&self, path: impl Into<String>) -> Result<ResponseEnvelope> {
        self.request(RequestConfig::new(Method::DELETE, path)).await
    }

    /// `HEAD`; the envelope carries headers and an empty body.
    pub async fn head(&self, path: impl Into<String>) -> Result<ResponseEnvelope> {
        self.request(RequestConfig::new(Method::HEAD, path)).await
    }

    /// `OPTIONS`.
    pub async fn options(&self, path: impl Into<String>) -> Result<ResponseEnvelope> {
        self.request(RequestConfig::new(Method::OPTIONS, path))
            .await
    }

    /// Cancels every active request carrying `request_id`. Returns `false`
    /// when none is running or all of them were already cancelled.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        self.shared
            .registry()
            .values()
            .filter(|entry| entry.request_id == request_id)
            .fold(false, |cancelled, entry| {
                entry.signal.cancel(CancelReason::Caller(String::new())) || cancelled
            })
    }

    /// Reports breaker state and metrics, and probes the server with a `HEAD`
    /// to the configured health path.
    ///
    /// The probe bypasses the breaker and the metrics. Any HTTP response,
    /// whatever its status, counts as reachable.
    pub async fn health(&self) -> HealthReport {
        let shared = &*self.shared;
        let reachable = self.probe().await;
        let circuit_state = shared.breaker.state();
        let metrics = shared.metrics().snapshot();

        HealthReport {
            healthy: reachable && circuit_state != CircuitState::Open,
            reachable,
            circuit_state,
            error_rate: metrics.error_rate,
            average_response_time: metrics.average_response_time,
            active_requests: metrics.active_requests,
            total_requests: metrics.total_requests,
            last_error_at: metrics.last_error_at,
        }
    }

    async fn probe(&self) -> bool {
        let shared = &*self.shared;
        let url = match build_url(
            &shared.config.base_url,
            &shared.config.health_path,
            &QueryParams::default(),
        ) {
            Ok(url) => url,
            Err(err) => {
                tracing::debug!("health probe skipped: {err}");
                return false;
            }
        };

        match shared
            .http
            .head(url)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!("health probe failed: {err}");
                false
            }
        }
    }

    /// Synchronous snapshot of configuration, breaker, metrics and active
    /// requests. Ids appear once per active request, so a shared id can show
    /// up more than once.
    pub fn diagnostics(&self) -> Diagnostics {
        let shared = &*self.shared;
        let mut active_request_ids: Vec<String> = shared
            .registry()
            .values()
            .map(|entry| entry.request_id.clone())
            .collect();
        active_request_ids.sort();

        Diagnostics {
            base_url: shared.config.base_url.clone(),
            retry: shared.config.retry.clone(),
            circuit: shared.breaker.snapshot(),
            metrics: shared.metrics().snapshot(),
            active_request_ids,
            progress_listeners: shared.progress.listener_count(),
            disposed: self.is_disposed(),
        }
    }

    /// Cancels every active request, drops progress listeners and clears the
    /// response-time samples. Later requests fail as cancelled.
    ///
    /// Calling it again is a no-op.
    pub fn dispose(&self) {
        let shared = &*self.shared;
        let first = !shared.disposed.swap(true, Ordering::SeqCst);

        let active: Vec<CancelSignal> = shared
            .registry()
            .drain()
            .map(|(_, entry)| entry.signal)
            .collect();
        for signal in &active {
            signal.cancel(CancelReason::Disposed);
        }
        shared.progress.clear();
        shared.metrics().clear_samples();

        if first {
            tracing::debug!(cancelled = active.len(), "client disposed");
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::BaseClient;
    use crate::{
        CircuitBreakerConfig, CircuitState, ClientConfig, ClientOverrides, ErrorKind,
        ProgressKind, RetryPolicy,
    };

    fn unreachable_config() -> ClientConfig {
        // Port 9 on localhost refuses connections quickly.
        ClientConfig::new("http://127.0.0.1:9")
            .with_retry(RetryPolicy::no_retry())
            .with_timeout(Duration::from_secs(2))
    }

    #[test]
    fn new_rejects_invalid_config() {
        let err = BaseClient::new(ClientConfig::new("")).expect_err("must reject");
        assert!(matches!(err.kind(), ErrorKind::Config { .. }));
    }

    #[test]
    fn debug_redacts_api_key() {
        let client = BaseClient::new(ClientConfig::new("https://h/api").with_api_key("secret-key"))
            .expect("valid config");
        let debug = format!("{client:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-key"));
    }

    #[test]
    fn create_applies_overrides_with_fresh_state() {
        let client = BaseClient::new(ClientConfig::new("https://h/api")).expect("valid config");
        let child = client
            .create(ClientOverrides {
                timeout: Some(Duration::from_secs(5)),
                ..ClientOverrides::default()
            })
            .expect("valid overrides");

        assert_eq!(child.config().timeout, Duration::from_secs(5));
        assert_eq!(child.config().base_url, "https://h/api");
        assert_eq!(client.config().timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let client = BaseClient::new(ClientConfig::new("https://h/api")).expect("valid config");
        client.progress().subscribe(ProgressKind::Download, |_| {});

        client.dispose();
        client.dispose();

        let diagnostics = client.diagnostics();
        assert!(diagnostics.disposed);
        assert!(diagnostics.active_request_ids.is_empty());
        assert_eq!(diagnostics.progress_listeners, 0);
    }

    #[tokio::test]
    async fn disposed_client_rejects_requests() {
        let client = BaseClient::new(unreachable_config()).expect("valid config");
        client.dispose();

        let err = client.get("/anything").await.expect_err("must be cancelled");
        assert!(matches!(err.kind(), ErrorKind::Cancelled { .. }));
        assert_eq!(err.code(), "REQUEST_CANCELLED");
        assert!(err.correlation_id().is_some());
    }

    #[tokio::test]
    async fn open_circuit_short_circuits() {
        let client = BaseClient::new(
            unreachable_config().with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(1)
                    .with_recovery_timeout(Duration::from_secs(60)),
            ),
        )
        .expect("valid config");

        let first = client.get("/x").await.expect_err("nothing listens there");
        assert!(!matches!(first.kind(), ErrorKind::CircuitOpen { .. }));
        assert_eq!(client.circuit_state(), CircuitState::Open);

        let second = client.get("/x").await.expect_err("circuit open");
        assert!(matches!(second.kind(), ErrorKind::CircuitOpen { .. }));
        assert!(!second.is_retryable());

        let metrics = client.diagnostics().metrics;
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.error_count, 2);
        assert_eq!(metrics.active_requests, 0);
    }

    #[test]
    fn cancel_unknown_request_is_false() {
        let client = BaseClient::new(ClientConfig::new("https://h/api")).expect("valid config");
        assert!(!client.cancel_request("missing"));
    }
}
