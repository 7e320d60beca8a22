//! `admin-http` is the request pipeline behind the admin console's platform
//! API calls.
//!
//! [`BaseClient`] runs every request through:
//! - a [`CircuitBreaker`] that fails fast while the backend is down,
//! - the configured [`Middleware`] chain,
//! - a retrying executor with exponential backoff and per-attempt timeouts,
//! - health metrics exposed by [`BaseClient::health`] and
//!   [`BaseClient::diagnostics`].

mod breaker;
mod cancel;
mod client;
pub mod config;
mod decode;
mod error;
mod executor;
mod metrics;
pub mod middleware;
mod params;
mod progress;
mod request;
mod response;
mod retry;
mod wire;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use cancel::{CancelReason, CancelSignal, TimeoutController};
pub use client::{BaseClient, HEALTH_PROBE_TIMEOUT};
pub use config::{ClientConfig, ClientOverrides};
pub use error::{ApiError, ErrorCategory, ErrorContext, ErrorKind, ErrorReport, ErrorSeverity};
pub use metrics::{Diagnostics, HealthReport, MetricsSnapshot, RESPONSE_TIME_SAMPLES};
pub use middleware::{
    CaseTransformMiddleware, ErrorOutcome, Middleware, SessionTokenMiddleware, TracingMiddleware,
};
pub use params::QueryParams;
pub use progress::{ProgressEvent, ProgressKind, ProgressTracker, SubscriptionId};
pub use request::{
    MultipartPart, RequestBody, RequestConfig, RequestMetadata, CORRELATION_ID_HEADER,
    REQUEST_ID_HEADER,
};
pub use response::{
    CacheInfo, Pagination, ResponseBody, ResponseEnvelope, ResponseMeta, ResponseStatus, Timing,
};
pub use retry::{NetworkErrorKind, RetryPolicy};

pub type Result<T> = std::result::Result<T, ApiError>;
