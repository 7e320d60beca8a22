use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::Serialize;

use crate::config::API_KEY_HEADER;
use crate::{ApiError, CancelSignal, ClientConfig, QueryParams, Result, RetryPolicy};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Payload of a request.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Text(String),
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    /// Sent as `multipart/form-data`; the boundary header is set by the
    /// transport, so no explicit `Content-Type` is emitted.
    Multipart(Vec<MultipartPart>),
}

impl RequestBody {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|err| ApiError::decode(format!("request body is not valid JSON: {err}")))
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            Self::Json(_) => Some("application/json"),
            Self::Text(_) => Some("text/plain; charset=utf-8"),
            Self::Bytes { content_type, .. } => {
                Some(content_type.as_deref().unwrap_or("application/octet-stream"))
            }
            Self::Multipart(_) => None,
        }
    }

    /// Payload size in bytes, used for upload progress.
    pub fn len(&self) -> u64 {
        match self {
            Self::Json(value) => serde_json::to_vec(value).map_or(0, |bytes| bytes.len() as u64),
            Self::Text(text) => text.len() as u64,
            Self::Bytes { data, .. } => data.len() as u64,
            Self::Multipart(parts) => parts.iter().map(|part| part.data.len() as u64).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attaches the body to a reqwest builder. Called once per attempt.
    pub(crate) fn apply(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        match self {
            Self::Json(value) => {
                let bytes = serde_json::to_vec(value)
                    .map_err(|err| ApiError::decode(format!("request body is not valid JSON: {err}")))?;
                Ok(builder.body(bytes))
            }
            Self::Text(text) => Ok(builder.body(text.clone())),
            Self::Bytes { data, .. } => Ok(builder.body(data.clone())),
            Self::Multipart(parts) => {
                let mut form = reqwest::multipart::Form::new();
                for part in parts {
                    form = form.part(part.name.clone(), part.to_reqwest()?);
                }
                Ok(builder.multipart(form))
            }
        }
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for RequestBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// One field of a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl MultipartPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: value.into().into_bytes(),
        }
    }

    pub fn file(name: impl Into<String>, file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            file_name: Some(file_name.into()),
            content_type: None,
            data,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    fn to_reqwest(&self) -> Result<reqwest::multipart::Part> {
        let mut part = reqwest::multipart::Part::bytes(self.data.clone());
        if let Some(file_name) = &self.file_name {
            part = part.file_name(file_name.clone());
        }
        if let Some(content_type) = &self.content_type {
            part = part.mime_str(content_type).map_err(|err| {
                ApiError::config(format!(
                    "invalid content type '{content_type}' for part '{}': {err}",
                    self.name
                ))
            })?;
        }
        Ok(part)
    }
}

/// Tracing data attached to a request. Missing ids are generated by the
/// client before the request goes out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Everything needed to issue one logical request.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    pub method: Method,
    /// Path relative to the client's base URL, or an absolute URL.
    pub path: String,
    pub params: QueryParams,
    pub body: Option<RequestBody>,
    /// Caller headers; they override defaults and the API key.
    pub headers: HeaderMap,
    /// Overrides the client's default timeout for every attempt.
    pub timeout: Option<Duration>,
    /// Overrides the client's retry policy.
    pub retry: Option<RetryPolicy>,
    /// Caller cancellation.
    pub cancel: Option<CancelSignal>,
    pub metadata: RequestMetadata,
}

impl RequestConfig {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: QueryParams::default(),
            body: None,
            headers: HeaderMap::new(),
            timeout: None,
            retry: None,
            cancel: None,
            metadata: RequestMetadata::default(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_params(mut self, params: impl Into<QueryParams>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.metadata.request_id = Some(request_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    pub(crate) fn request_id(&self) -> &str {
        self.metadata.request_id.as_deref().unwrap_or_default()
    }

    pub(crate) fn correlation_id(&self) -> &str {
        self.metadata.correlation_id.as_deref().unwrap_or_default()
    }
}

/// Joins `path` onto `base_url` and appends the query parameters.
///
/// Absolute `http(s)` paths bypass the base URL.
pub(crate) fn build_url(base_url: &str, path: &str, params: &QueryParams) -> Result<Url> {
    let raw = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_owned()
    } else if path.trim_matches('/').is_empty() {
        base_url.to_owned()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };

    let mut url = Url::parse(&raw)
        .map_err(|err| ApiError::config(format!("invalid request url '{raw}': {err}")))?;

    let pairs = params.to_pairs();
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(url)
}

/// Merges headers: defaults < API key < caller headers < tracing headers.
pub(crate) fn build_headers(config: &ClientConfig, request: &RequestConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

    let content_type = match &request.body {
        Some(body) => body.content_type(),
        None => Some("application/json"),
    };
    if let Some(content_type) = content_type {
        headers.insert(header::CONTENT_TYPE, header_value("content type", content_type)?);
    }
    headers.insert(
        header::USER_AGENT,
        header_value("user agent", &config.user_agent)?,
    );

    if let Some(api_key) = &config.api_key {
        let mut value = header_value("api key", api_key)?;
        value.set_sensitive(true);
        headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
    }

    for name in request.headers.keys() {
        headers.remove(name);
    }
    for (name, value) in &request.headers {
        headers.append(name.clone(), value.clone());
    }
    if matches!(request.body, Some(RequestBody::Multipart(_))) {
        headers.remove(header::CONTENT_TYPE);
    }

    headers.insert(
        HeaderName::from_static(REQUEST_ID_HEADER),
        header_value("request id", request.request_id())?,
    );
    headers.insert(
        HeaderName::from_static(CORRELATION_ID_HEADER),
        header_value("correlation id", request.correlation_id())?,
    );
    Ok(headers)
}

fn header_value(what: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| ApiError::config(format!("invalid {what} header value: {err}")))
}

#[cfg(test)]
mod tests {
    use reqwest::header::{self, HeaderValue};
    use serde_json::json;

    use super::{build_headers, build_url, MultipartPart, RequestBody, RequestConfig};
    use crate::{ClientConfig, QueryParams};

    #[test]
    fn url_join_tolerates_slashes() {
        let params = QueryParams::new();
        let joined = |base: &str, path: &str| {
            build_url(base, path, &params)
                .expect("url must build")
                .to_string()
        };

        assert_eq!(joined("https://h/api/v2", "system/role"), "https://h/api/v2/system/role");
        assert_eq!(joined("https://h/api/v2/", "/system/role"), "https://h/api/v2/system/role");
        assert_eq!(joined("https://h/api/v2", ""), "https://h/api/v2");
        assert_eq!(joined("https://h/api/v2", "https://other/x"), "https://other/x");
    }

    #[test]
    fn url_carries_encoded_query() {
        let params = QueryParams::new().filter("name like 'a%'").limit(10);
        let url = build_url("https://h/api", "/db/_table/users", &params).expect("url must build");
        assert_eq!(url.path(), "/api/db/_table/users");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("filter".to_owned(), "name like 'a%'".to_owned()),
                ("limit".to_owned(), "10".to_owned()),
            ]
        );
    }

    #[test]
    fn header_precedence() {
        let config = ClientConfig::new("https://h").with_api_key("client-key");
        let request = RequestConfig::get("/x")
            .with_request_id("req-1")
            .with_correlation_id("corr-1")
            .with_header(
                header::HeaderName::from_static("x-api-key"),
                HeaderValue::from_static("caller-key"),
            )
            .with_header(
                header::HeaderName::from_static("x-request-id"),
                HeaderValue::from_static("spoofed"),
            );

        let headers = build_headers(&config, &request).expect("headers must build");
        assert_eq!(headers["x-api-key"], "caller-key");
        assert_eq!(headers["x-request-id"], "req-1");
        assert_eq!(headers["x-correlation-id"], "corr-1");
        assert_eq!(headers[header::ACCEPT], "application/json");
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert!(headers[header::USER_AGENT]
            .to_str()
            .expect("ascii")
            .starts_with("admin-http/"));
    }

    #[test]
    fn multipart_omits_content_type() {
        let config = ClientConfig::new("https://h");
        let request = RequestConfig::post("/files/logo.png")
            .with_body(RequestBody::Multipart(vec![MultipartPart::file(
                "files",
                "logo.png",
                vec![1, 2, 3],
            )
            .with_content_type("image/png")]));

        let headers = build_headers(&config, &request).expect("headers must build");
        assert!(!headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn body_sizes() {
        assert_eq!(RequestBody::from("abc").len(), 3);
        assert_eq!(RequestBody::from(json!({"a": 1})).len(), 7);
        assert_eq!(
            RequestBody::Multipart(vec![
                MultipartPart::text("name", "ab"),
                MultipartPart::file("f", "f.bin", vec![0; 4]),
            ])
            .len(),
            6
        );
    }
}
