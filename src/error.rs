use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{CancelReason, CircuitState, NetworkErrorKind};

/// Failure classes surfaced to callers.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ErrorKind {
    /// Connection could not be established or the transport failed mid-flight.
    #[error("network error ({kind}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        /// Whether the active retry policy lists `kind` as retryable.
        retryable: bool,
    },
    /// The attempt exceeded its deadline.
    #[error("request timed out after {} ms", timeout.as_millis())]
    Timeout { timeout: Duration },
    /// The circuit breaker refused the request without touching the network.
    #[error("circuit breaker is {state} after {failure_count} consecutive failures")]
    CircuitOpen {
        state: CircuitState,
        failure_count: u32,
        retry_after: Option<Duration>,
    },
    /// 4xx other than 429.
    #[error("http error {status}: {message}")]
    Client {
        status: u16,
        message: String,
        code: Option<String>,
        /// Whether the active retry policy lists `status` as retryable.
        retryable: bool,
    },
    /// HTTP 429.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
        retryable: bool,
    },
    /// 5xx.
    #[error("http error {status}: {message}")]
    Server {
        status: u16,
        message: String,
        code: Option<String>,
        retryable: bool,
    },
    #[error("request cancelled: {reason}")]
    Cancelled { reason: CancelReason },
    /// Response body could not be decoded.
    #[error("decode error: {message}")]
    Decode { message: String },
    #[error("invalid configuration: {message}")]
    Config { message: String },
    #[error("{message}")]
    Unknown { message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    CircuitOpen,
    Client,
    RateLimited,
    Server,
    Cancelled,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Where a failure happened.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Network attempts made before giving up.
    pub attempts: u32,
    /// Server-provided error payload, when the body was JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Error returned by every request operation.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}")]
pub struct ApiError {
    kind: ErrorKind,
    correlation_id: Option<String>,
    timestamp: DateTime<Utc>,
    context: ErrorContext,
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl ApiError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            correlation_id: None,
            timestamp: Utc::now(),
            context: ErrorContext::default(),
        }
    }

    pub(crate) fn network(err: &reqwest::Error, kind: NetworkErrorKind, retryable: bool) -> Self {
        Self::new(ErrorKind::Network {
            kind,
            message: err.to_string(),
            retryable,
        })
    }

    pub(crate) fn timeout(timeout: Duration) -> Self {
        Self::new(ErrorKind::Timeout { timeout })
    }

    pub(crate) fn cancelled(reason: CancelReason) -> Self {
        Self::new(ErrorKind::Cancelled { reason })
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode {
            message: message.into(),
        })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config {
            message: message.into(),
        })
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown {
            message: message.into(),
        })
    }

    /// Classifies a non-success HTTP status. `retryable` is the retry
    /// policy's verdict for `status`.
    pub(crate) fn from_status(
        status: u16,
        message: String,
        code: Option<String>,
        retry_after: Option<Duration>,
        retryable: bool,
    ) -> Self {
        let kind = match status {
            429 => ErrorKind::RateLimited {
                message,
                retry_after,
                retryable,
            },
            400..=499 => ErrorKind::Client {
                status,
                message,
                code,
                retryable,
            },
            500..=599 => ErrorKind::Server {
                status,
                message,
                code,
                retryable,
            },
            _ => ErrorKind::Unknown {
                message: format!("unexpected http status {status}: {message}"),
            },
        };
        Self::new(kind)
    }

    pub(crate) fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub(crate) fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub(crate) fn context_mut(&mut self) -> &mut ErrorContext {
        &mut self.context
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context.request_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// HTTP status, for errors that came from a response.
    pub fn status(&self) -> Option<u16> {
        match &self.kind {
            ErrorKind::Client { status, .. } | ErrorKind::Server { status, .. } => Some(*status),
            ErrorKind::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match &self.kind {
            ErrorKind::Network { .. } => ErrorCategory::Network,
            ErrorKind::Timeout { .. } => ErrorCategory::Timeout,
            ErrorKind::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            ErrorKind::Client { .. } => ErrorCategory::Client,
            ErrorKind::RateLimited { .. } => ErrorCategory::RateLimited,
            ErrorKind::Server { .. } => ErrorCategory::Server,
            ErrorKind::Cancelled { .. } => ErrorCategory::Cancelled,
            ErrorKind::Decode { .. } | ErrorKind::Config { .. } | ErrorKind::Unknown { .. } => {
                ErrorCategory::Unknown
            }
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match &self.kind {
            ErrorKind::Client { status: 401 | 403, .. } => ErrorSeverity::Medium,
            ErrorKind::Client { .. } | ErrorKind::Cancelled { .. } => ErrorSeverity::Low,
            ErrorKind::Timeout { .. } | ErrorKind::RateLimited { .. } => ErrorSeverity::Medium,
            ErrorKind::Decode { .. } | ErrorKind::Unknown { .. } => ErrorSeverity::Medium,
            ErrorKind::Network { .. } | ErrorKind::CircuitOpen { .. } => ErrorSeverity::High,
            ErrorKind::Server { .. } => ErrorSeverity::High,
            ErrorKind::Config { .. } => ErrorSeverity::Critical,
        }
    }

    /// Whether the retry policy in force treats this failure as retryable.
    ///
    /// Circuit-open errors are not retryable by the executor; the breaker
    /// decides when traffic resumes.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            ErrorKind::Network { retryable, .. }
            | ErrorKind::Client { retryable, .. }
            | ErrorKind::RateLimited { retryable, .. }
            | ErrorKind::Server { retryable, .. } => *retryable,
            ErrorKind::Timeout { .. } => true,
            ErrorKind::CircuitOpen { .. }
            | ErrorKind::Cancelled { .. }
            | ErrorKind::Decode { .. }
            | ErrorKind::Config { .. }
            | ErrorKind::Unknown { .. } => false,
        }
    }

    /// Whether [`ApiError::message`] is fit to show to an operator as-is.
    pub fn user_facing(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::Decode { .. } | ErrorKind::Config { .. } | ErrorKind::Unknown { .. }
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> String {
        match &self.kind {
            ErrorKind::Network { .. } => "NETWORK_ERROR".to_owned(),
            ErrorKind::Timeout { .. } => "REQUEST_TIMEOUT".to_owned(),
            ErrorKind::CircuitOpen { .. } => "CIRCUIT_OPEN".to_owned(),
            ErrorKind::Client { status, .. } | ErrorKind::Server { status, .. } => {
                format!("HTTP_{status}")
            }
            ErrorKind::RateLimited { .. } => "RATE_LIMITED".to_owned(),
            ErrorKind::Cancelled { .. } => "REQUEST_CANCELLED".to_owned(),
            ErrorKind::Decode { .. } => "DECODE_ERROR".to_owned(),
            ErrorKind::Config { .. } => "CONFIG_ERROR".to_owned(),
            ErrorKind::Unknown { .. } => "UNKNOWN_ERROR".to_owned(),
        }
    }

    /// Human-readable message, preferring server-provided detail.
    pub fn message(&self) -> String {
        match &self.kind {
            ErrorKind::Network { .. } => {
                "Unable to reach the server. Check your connection and try again.".to_owned()
            }
            ErrorKind::Timeout { timeout } => {
                format!("The server did not respond within {} ms.", timeout.as_millis())
            }
            ErrorKind::CircuitOpen { retry_after, .. } => match retry_after {
                Some(wait) => format!(
                    "The service is temporarily unavailable. Retry in {} s.",
                    wait.as_secs().max(1)
                ),
                None => "The service is temporarily unavailable.".to_owned(),
            },
            ErrorKind::Client { message, .. }
            | ErrorKind::Server { message, .. }
            | ErrorKind::RateLimited { message, .. }
                if !message.is_empty() =>
            {
                message.clone()
            }
            ErrorKind::Client { status, .. } => client_status_message(*status).to_owned(),
            ErrorKind::RateLimited { .. } => "Too many requests. Please slow down.".to_owned(),
            ErrorKind::Server { .. } => "The server encountered an error.".to_owned(),
            ErrorKind::Cancelled { reason } => reason.to_string(),
            ErrorKind::Decode { .. } | ErrorKind::Unknown { .. } => {
                "An unexpected error occurred.".to_owned()
            }
            ErrorKind::Config { message } => message.clone(),
        }
    }

    /// Serializable shape handed to UI layers and logs.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            error_type: error_type(self.category()),
            severity: self.severity(),
            category: self.category(),
            code: self.code(),
            message: self.message(),
            is_retryable: self.is_retryable(),
            timestamp: self.timestamp,
            correlation_id: self.correlation_id.clone(),
            user_facing: self.user_facing(),
            context: self.context.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub is_retryable: bool,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub user_facing: bool,
    pub context: ErrorContext,
}

fn error_type(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Network => "network_error",
        ErrorCategory::Timeout => "timeout_error",
        ErrorCategory::CircuitOpen => "circuit_breaker_error",
        ErrorCategory::Client => "client_error",
        ErrorCategory::RateLimited => "rate_limit_error",
        ErrorCategory::Server => "server_error",
        ErrorCategory::Cancelled => "cancellation_error",
        ErrorCategory::Unknown => "unknown_error",
    }
}

fn client_status_message(status: u16) -> &'static str {
    match status {
        400 => "The request was invalid.",
        401 => "Authentication is required.",
        403 => "You do not have permission to perform this action.",
        404 => "The requested resource was not found.",
        408 => "The request timed out.",
        409 => "The request conflicts with the current state of the resource.",
        422 => "The request could not be processed.",
        _ => "The request failed.",
    }
}
