use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};

use crate::{
    decode::{self, cache_info, content_type, derive_pagination, normalize_headers},
    request::build_url,
    ApiError, CancelReason, CancelSignal, ClientConfig, ErrorKind, NetworkErrorKind,
    ProgressEvent, ProgressKind, ProgressTracker, RequestConfig, ResponseBody, ResponseEnvelope,
    ResponseMeta, ResponseStatus, Result, RetryPolicy, Timing, TimeoutController,
};

macro_rules! attempt_log {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            tracing::debug!($($arg)+);
        } else {
            tracing::trace!($($arg)+);
        }
    };
}

/// Status, headers and parsed body of a successful attempt.
struct Received {
    status: u16,
    headers: HeaderMap,
    data: ResponseBody,
}

/// Runs one logical request: attempts, timeouts, backoff and response parsing.
pub(crate) struct Executor<'a> {
    pub http: &'a reqwest::Client,
    pub config: &'a ClientConfig,
    pub progress: &'a ProgressTracker,
}

impl Executor<'_> {
    /// `signal` is the caller/client signal; each attempt combines it with
    /// its own timeout.
    pub async fn execute(
        &self,
        request: &RequestConfig,
        signal: &CancelSignal,
    ) -> Result<ResponseEnvelope> {
        let policy = request.retry.as_ref().unwrap_or(&self.config.retry);
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let max_attempts = policy.attempts();
        let started = Instant::now();
        let mut timing = Timing {
            started_at: request.metadata.started_at.unwrap_or_else(Utc::now),
            ..Timing::default()
        };

        let url = match build_url(&self.config.base_url, &request.path, &request.params) {
            Ok(url) => url,
            Err(err) => return Err(self.fail(err, request, None, 0)),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            timing.attempts = attempt;
            attempt_log!(
                self.config.debug,
                request_id = request.request_id(),
                method = %request.method,
                %url,
                attempt,
                max_attempts,
                "sending request"
            );

            let err = match self.attempt(request, &url, policy, timeout, signal).await {
                Ok(received) => {
                    timing.duration = started.elapsed();
                    let pagination = derive_pagination(&received.data, &request.params);
                    return Ok(ResponseEnvelope {
                        status: ResponseStatus::new(received.status),
                        headers: normalize_headers(&received.headers),
                        meta: ResponseMeta {
                            request_id: request.request_id().to_owned(),
                            correlation_id: request.correlation_id().to_owned(),
                            timing,
                            pagination,
                            cache: cache_info(&received.headers),
                        },
                        data: received.data,
                    });
                }
                Err(err) => err,
            };

            if attempt < max_attempts && should_retry(&err) {
                let delay = policy.delay(attempt);
                attempt_log!(
                    self.config.debug,
                    request_id = request.request_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after {}",
                    err.code()
                );
                tokio::time::sleep(delay).await;
                timing.retry_delays.push(delay);
                continue;
            }

            return Err(self.fail(err, request, Some(&url), attempt));
        }
    }

    async fn attempt(
        &self,
        request: &RequestConfig,
        url: &Url,
        policy: &RetryPolicy,
        timeout: Duration,
        signal: &CancelSignal,
    ) -> Result<Received> {
        if let Some(reason) = signal.reason() {
            return Err(ApiError::cancelled(reason));
        }

        let mut controller = TimeoutController::new(timeout);
        let combined = CancelSignal::any([signal.clone(), controller.signal().clone()]);

        let outcome = tokio::select! {
            biased;
            reason = combined.cancelled() => Err(match reason {
                CancelReason::Timeout => ApiError::timeout(timeout),
                other => ApiError::cancelled(other),
            }),
            outcome = self.send(request, url, policy) => outcome,
        };
        controller.cleanup();
        outcome
    }

    async fn send(&self, request: &RequestConfig, url: &Url, policy: &RetryPolicy) -> Result<Received> {
        let mut builder = self
            .http
            .request(request.method.clone(), url.clone())
            .headers(request.headers.clone());

        let upload_total = match &request.body {
            Some(body) if carries_body(&request.method) => {
                builder = body.apply(builder)?;
                Some(body.len())
            }
            _ => None,
        };
        if let Some(total) = upload_total {
            self.emit(ProgressKind::Upload, request, 0, Some(total));
        }

        let response = builder
            .send()
            .await
            .map_err(|err| network_error(&err, policy))?;

        if let Some(total) = upload_total {
            self.emit(ProgressKind::Upload, request, total, Some(total));
        }

        let status = response.status();
        let headers = response.headers().clone();

        if !status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| network_error(&err, policy))?;
            let detail = decode::error_detail(content_type(&headers), &bytes);
            let mut err = ApiError::from_status(
                status.as_u16(),
                detail.message,
                detail.code,
                decode::retry_after(&headers),
                policy.is_retryable_status(status.as_u16()),
            );
            err.context_mut().detail = detail.body;
            return Err(err);
        }

        let total = response.content_length();
        let mut stream = std::pin::pin!(response.bytes_stream());
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| network_error(&err, policy))?;
            bytes.extend_from_slice(&chunk);
            self.emit(ProgressKind::Download, request, bytes.len() as u64, total);
        }

        let data = decode::parse_body(content_type(&headers), bytes)?;
        Ok(Received {
            status: status.as_u16(),
            headers,
            data,
        })
    }

    fn emit(&self, kind: ProgressKind, request: &RequestConfig, loaded: u64, total: Option<u64>) {
        self.progress.emit(&ProgressEvent {
            kind,
            request_id: request.request_id().to_owned(),
            loaded,
            total,
        });
    }

    fn fail(&self, mut err: ApiError, request: &RequestConfig, url: Option<&Url>, attempts: u32) -> ApiError {
        let context = err.context_mut();
        context.method = Some(request.method.to_string());
        context.url = url.map(Url::to_string);
        context.request_id = Some(request.request_id().to_owned());
        context.attempts = attempts;

        attempt_log!(
            self.config.debug,
            request_id = request.request_id(),
            attempts,
            code = %err.code(),
            "request failed: {err}"
        );
        err.with_correlation_id(request.correlation_id())
    }
}

fn carries_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

fn network_error(err: &reqwest::Error, policy: &RetryPolicy) -> ApiError {
    let kind = NetworkErrorKind::classify(err);
    ApiError::network(err, kind, policy.is_retryable_network(kind))
}

/// Whether another attempt may follow `err`. Status and transport errors
/// carry the policy's verdict from when they were built.
fn should_retry(err: &ApiError) -> bool {
    match err.kind() {
        ErrorKind::Network { retryable, .. }
        | ErrorKind::Client { retryable, .. }
        | ErrorKind::RateLimited { retryable, .. }
        | ErrorKind::Server { retryable, .. } => *retryable,
        ErrorKind::Timeout { .. } => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Method;

    use super::{carries_body, should_retry};
    use crate::{ApiError, CancelReason, RetryPolicy};

    #[test]
    fn get_and_head_never_carry_a_body() {
        assert!(!carries_body(&Method::GET));
        assert!(!carries_body(&Method::HEAD));
        assert!(carries_body(&Method::POST));
        assert!(carries_body(&Method::DELETE));
    }

    #[test]
    fn retry_decisions_follow_policy() {
        let status = |policy: &RetryPolicy, code| {
            ApiError::from_status(code, String::new(), None, None, policy.is_retryable_status(code))
        };

        let policy = RetryPolicy::default();
        assert!(should_retry(&status(&policy, 503)));
        assert!(should_retry(&status(&policy, 429)));
        assert!(should_retry(&status(&policy, 408)));
        assert!(!should_retry(&status(&policy, 404)));
        assert!(!should_retry(&status(&policy, 501)));
        assert!(!status(&policy, 501).is_retryable());
        assert!(should_retry(&ApiError::timeout(Duration::from_secs(1))));
        assert!(!should_retry(&ApiError::cancelled(CancelReason::Caller(String::new()))));

        let narrow = RetryPolicy::default().with_retryable_status_codes([502]);
        assert!(!should_retry(&status(&narrow, 503)));
        assert!(should_retry(&status(&narrow, 502)));
    }
}
