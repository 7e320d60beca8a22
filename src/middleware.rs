//! Request, response and error interceptors.
//!
//! The client runs every configured [`Middleware`] in order at three points:
//! after headers are merged ([`Middleware::on_request`]), after a successful
//! response ([`Middleware::on_response`]) and after a failure
//! ([`Middleware::on_error`]). The list is fixed for the lifetime of a client.

use std::sync::Arc;

use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{Map, Value as JsonValue};

use crate::config::API_KEY_HEADER;
use crate::{ApiError, RequestBody, RequestConfig, ResponseBody, ResponseEnvelope};

pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Result of the error stage.
#[derive(Debug)]
pub enum ErrorOutcome {
    /// Keep failing, possibly with a transformed error.
    Propagate(ApiError),
    /// Resolve the request with this envelope instead.
    Recover(ResponseEnvelope),
}

pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn on_request(&self, request: RequestConfig) -> RequestConfig {
        request
    }

    fn on_response(&self, response: ResponseEnvelope) -> ResponseEnvelope {
        response
    }

    fn on_error(&self, error: ApiError) -> ErrorOutcome {
        ErrorOutcome::Propagate(error)
    }
}

pub(crate) fn run_request(chain: &[Arc<dyn Middleware>], request: RequestConfig) -> RequestConfig {
    chain
        .iter()
        .fold(request, |request, middleware| middleware.on_request(request))
}

pub(crate) fn run_response(
    chain: &[Arc<dyn Middleware>],
    response: ResponseEnvelope,
) -> ResponseEnvelope {
    chain
        .iter()
        .fold(response, |response, middleware| middleware.on_response(response))
}

/// The first middleware that recovers ends the stage.
pub(crate) fn run_error(chain: &[Arc<dyn Middleware>], mut error: ApiError) -> ErrorOutcome {
    for middleware in chain {
        match middleware.on_error(error) {
            ErrorOutcome::Propagate(next) => error = next,
            recovered @ ErrorOutcome::Recover(_) => {
                tracing::debug!(middleware = middleware.name(), "error recovered by middleware");
                return recovered;
            }
        }
    }
    ErrorOutcome::Propagate(error)
}

/// Injects the operator's session token and, optionally, an API key that
/// replaces the client default.
#[derive(Clone)]
pub struct SessionTokenMiddleware {
    session_token: HeaderValue,
    api_key: Option<HeaderValue>,
}

impl std::fmt::Debug for SessionTokenMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokenMiddleware")
            .field("session_token", &"<redacted>")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SessionTokenMiddleware {
    /// Fails when the token is not a valid header value.
    pub fn new(session_token: impl AsRef<str>) -> crate::Result<Self> {
        Ok(Self {
            session_token: sensitive(session_token.as_ref())?,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl AsRef<str>) -> crate::Result<Self> {
        self.api_key = Some(sensitive(api_key.as_ref())?);
        Ok(self)
    }
}

impl Middleware for SessionTokenMiddleware {
    fn name(&self) -> &str {
        "session-token"
    }

    fn on_request(&self, mut request: RequestConfig) -> RequestConfig {
        request.headers.insert(
            HeaderName::from_static(SESSION_TOKEN_HEADER),
            self.session_token.clone(),
        );
        if let Some(api_key) = &self.api_key {
            request
                .headers
                .insert(HeaderName::from_static(API_KEY_HEADER), api_key.clone());
        }
        request
    }
}

fn sensitive(value: &str) -> crate::Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value.trim())
        .map_err(|err| ApiError::config(format!("invalid credential header value: {err}")))?;
    header.set_sensitive(true);
    Ok(header)
}

/// Converts JSON keys between the UI's camelCase and the platform's
/// snake_case: outgoing bodies become snake_case, incoming become camelCase.
#[derive(Clone, Copy, Debug, Default)]
pub struct CaseTransformMiddleware;

impl Middleware for CaseTransformMiddleware {
    fn name(&self) -> &str {
        "case-transform"
    }

    fn on_request(&self, mut request: RequestConfig) -> RequestConfig {
        request.body = request.body.map(|body| match body {
            RequestBody::Json(value) => RequestBody::Json(rename_keys(value, &to_snake_case)),
            other => other,
        });
        request
    }

    fn on_response(&self, mut response: ResponseEnvelope) -> ResponseEnvelope {
        if let ResponseBody::Json(value) = response.data {
            response.data = ResponseBody::Json(rename_keys(value, &to_camel_case));
        }
        response
    }
}

fn rename_keys(value: JsonValue, rename: &dyn Fn(&str) -> String) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter()
                .map(|(key, value)| (rename(&key), rename_keys(value, rename)))
                .collect::<Map<_, _>>(),
        ),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .map(|item| rename_keys(item, rename))
                .collect(),
        ),
        other => other,
    }
}

pub(crate) fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (index, ch) in key.char_indices() {
        if ch.is_ascii_uppercase() {
            if index > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

pub(crate) fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for ch in key.chars() {
        if ch == '_' && !out.is_empty() {
            upper_next = true;
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Logs every stage through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMiddleware;

impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_request(&self, request: RequestConfig) -> RequestConfig {
        tracing::info!(
            method = %request.method,
            path = %request.path,
            request_id = request.request_id(),
            "request started"
        );
        request
    }

    fn on_response(&self, response: ResponseEnvelope) -> ResponseEnvelope {
        tracing::info!(
            status = response.status.code,
            request_id = %response.meta.request_id,
            attempts = response.meta.timing.attempts,
            elapsed_ms = response.meta.timing.duration.as_millis() as u64,
            "request completed"
        );
        response
    }

    fn on_error(&self, error: ApiError) -> ErrorOutcome {
        tracing::warn!(
            code = %error.code(),
            category = ?error.category(),
            correlation_id = error.correlation_id().unwrap_or_default(),
            "request failed: {error}"
        );
        ErrorOutcome::Propagate(error)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{
        run_error, run_request, to_camel_case, to_snake_case, CaseTransformMiddleware,
        ErrorOutcome, Middleware, SessionTokenMiddleware,
    };
    use crate::{ApiError, RequestBody, RequestConfig, ResponseBody, ResponseEnvelope};

    struct Recovering;

    impl Middleware for Recovering {
        fn name(&self) -> &str {
            "recovering"
        }

        fn on_error(&self, _error: ApiError) -> ErrorOutcome {
            ErrorOutcome::Recover(ResponseEnvelope::new(200, ResponseBody::Empty))
        }
    }

    struct Never;

    impl Middleware for Never {
        fn name(&self) -> &str {
            "never"
        }

        fn on_error(&self, _error: ApiError) -> ErrorOutcome {
            panic!("must not run after a recovery");
        }
    }

    #[test]
    fn case_conversion() {
        assert_eq!(to_snake_case("isActive"), "is_active");
        assert_eq!(to_snake_case("roleServiceAccess"), "role_service_access");
        assert_eq!(to_snake_case("id"), "id");
        assert_eq!(to_camel_case("is_active"), "isActive");
        assert_eq!(to_camel_case("_private"), "_private");
    }

    #[test]
    fn case_transform_rewrites_nested_keys() {
        let request = RequestConfig::post("/system/role").with_body(json!({
            "roleName": "ops",
            "serviceAccess": [{"serviceId": 1}]
        }));
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(CaseTransformMiddleware)];

        let transformed = run_request(&chain, request);
        assert_eq!(
            transformed.body,
            Some(RequestBody::Json(json!({
                "role_name": "ops",
                "service_access": [{"service_id": 1}]
            })))
        );

        let response = CaseTransformMiddleware.on_response(ResponseEnvelope::new(
            200,
            ResponseBody::Json(json!({"resource": [{"is_active": true}]})),
        ));
        assert_eq!(
            response.data,
            ResponseBody::Json(json!({"resource": [{"isActive": true}]}))
        );
    }

    #[test]
    fn session_token_sets_headers() {
        let middleware = SessionTokenMiddleware::new("session-abc")
            .and_then(|m| m.with_api_key("app-key"))
            .expect("valid tokens");
        let request = middleware.on_request(RequestConfig::get("/system/user"));
        assert_eq!(request.headers["x-session-token"], "session-abc");
        assert_eq!(request.headers["x-api-key"], "app-key");
        assert!(!format!("{middleware:?}").contains("session-abc"));
    }

    #[test]
    fn first_recovery_stops_error_stage() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Recovering), Arc::new(Never)];
        let outcome = run_error(&chain, ApiError::unknown("boom"));
        assert!(matches!(outcome, ErrorOutcome::Recover(_)));
    }
}
