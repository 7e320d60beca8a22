use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{self, HeaderMap};
use serde::Deserialize;

use crate::{
    wire::{ErrorBody, ListEnvelope},
    ApiError, CacheInfo, Pagination, QueryParams, ResponseBody, Result,
};

/// Server-provided detail extracted from an error response.
#[derive(Debug, Default)]
pub(crate) struct ErrorDetail {
    pub message: String,
    pub code: Option<String>,
    pub body: Option<serde_json::Value>,
}

pub(crate) fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
}

/// Parses a body according to its `Content-Type`.
pub(crate) fn parse_body(content_type: Option<&str>, bytes: Vec<u8>) -> Result<ResponseBody> {
    if bytes.is_empty() {
        return Ok(ResponseBody::Empty);
    }

    let essence = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase());

    match essence.as_deref() {
        Some(mime) if is_json(mime) => serde_json::from_slice(&bytes)
            .map(ResponseBody::Json)
            .map_err(|err| {
                ApiError::decode(format!(
                    "invalid JSON response: {err}; body: {}",
                    snippet(&bytes)
                ))
            }),
        Some(mime) if is_textual(mime) => Ok(ResponseBody::Text(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
        Some(_) => Ok(ResponseBody::Binary(bytes)),
        None => Ok(sniff(bytes)),
    }
}

/// Pagination is only derived when the body exposes `meta.count`.
pub(crate) fn derive_pagination(body: &ResponseBody, params: &QueryParams) -> Option<Pagination> {
    let value = body.as_json()?;
    let envelope = ListEnvelope::deserialize(value).ok()?;
    let total = envelope.meta?.count?;

    let returned = envelope.resource.map_or(0, |records| records.len() as u64);
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(returned);
    let has_more = offset.saturating_add(returned) < total;

    Some(Pagination {
        total,
        limit,
        offset,
        has_more,
        next_offset: has_more.then(|| offset + returned),
    })
}

pub(crate) fn cache_info(headers: &HeaderMap) -> CacheInfo {
    let text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    let cache_control = text(header::CACHE_CONTROL);
    let cacheable = !cache_control
        .as_deref()
        .is_some_and(|value| value.to_ascii_lowercase().contains("no-store"));

    CacheInfo {
        etag: text(header::ETAG),
        last_modified: text(header::LAST_MODIFIED),
        age: text(header::AGE).and_then(|value| value.trim().parse().ok()),
        cache_control,
        cacheable,
    }
}

pub(crate) fn normalize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut normalized: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        normalized
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    normalized
}

/// `Retry-After` in delta-seconds form.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub(crate) fn error_detail(content_type: Option<&str>, bytes: &[u8]) -> ErrorDetail {
    let parsed = match parse_body(content_type, bytes.to_vec()) {
        Ok(ResponseBody::Json(value)) => value,
        Ok(ResponseBody::Text(text)) => {
            return ErrorDetail {
                message: text.trim().to_owned(),
                ..ErrorDetail::default()
            }
        }
        _ => return ErrorDetail::default(),
    };

    let payload = ErrorBody::deserialize(&parsed)
        .map(ErrorBody::into_payload)
        .unwrap_or_default();
    let code = payload.code.map(|code| match code {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    });

    ErrorDetail {
        message: payload.message.unwrap_or_default(),
        code,
        body: Some(parsed),
    }
}

fn is_json(mime: &str) -> bool {
    mime == "application/json" || mime.ends_with("+json")
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.ends_with("+xml")
        || matches!(
            mime,
            "application/xml" | "application/javascript" | "application/x-www-form-urlencoded"
        )
}

fn sniff(bytes: Vec<u8>) -> ResponseBody {
    if let Ok(value) = serde_json::from_slice(&bytes) {
        return ResponseBody::Json(value);
    }
    match String::from_utf8(bytes) {
        Ok(text) => ResponseBody::Text(text),
        Err(err) => ResponseBody::Binary(err.into_bytes()),
    }
}

fn snippet(bytes: &[u8]) -> String {
    const MAX: usize = 200;
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX)]).into_owned();
    if bytes.len() > MAX {
        format!("{text}…")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::{self, HeaderMap, HeaderValue};
    use serde_json::json;

    use crate::{decode, ErrorKind, QueryParams, ResponseBody};

    #[test]
    fn parses_by_content_type() {
        let json = decode::parse_body(Some("application/json; charset=utf-8"), br#"{"a":1}"#.to_vec())
            .expect("must parse");
        assert_eq!(json, ResponseBody::Json(json!({"a": 1})));

        let problem = decode::parse_body(Some("application/problem+json"), b"{}".to_vec())
            .expect("must parse");
        assert!(problem.as_json().is_some());

        let text = decode::parse_body(Some("text/plain"), b"hello".to_vec()).expect("must parse");
        assert_eq!(text.as_text(), Some("hello"));

        let binary = decode::parse_body(Some("image/png"), vec![0x89, 0x50]).expect("must parse");
        assert_eq!(binary.as_bytes(), Some(&[0x89, 0x50][..]));

        let empty = decode::parse_body(Some("application/json"), Vec::new()).expect("must parse");
        assert!(empty.is_empty());
    }

    #[test]
    fn invalid_json_is_decode_error() {
        let err = decode::parse_body(Some("application/json"), b"{oops".to_vec())
            .expect_err("must fail");
        assert!(matches!(err.kind(), ErrorKind::Decode { .. }));
    }

    #[test]
    fn pagination_from_meta_count() {
        let body = ResponseBody::Json(json!({"resource": [{"id": 1}], "meta": {"count": 1}}));
        let page = decode::derive_pagination(&body, &QueryParams::new()).expect("must derive");
        assert_eq!(page.total, 1);
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, 1);
        assert!(!page.has_more);
        assert_eq!(page.next_offset, None);

        let body = ResponseBody::Json(json!({
            "resource": [{"id": 1}, {"id": 2}],
            "meta": {"count": 10}
        }));
        let params = QueryParams::new().limit(2).offset(4);
        let page = decode::derive_pagination(&body, &params).expect("must derive");
        assert!(page.has_more);
        assert_eq!(page.next_offset, Some(6));
    }

    #[test]
    fn pagination_omitted_without_count() {
        let body = ResponseBody::Json(json!({"resource": []}));
        assert!(decode::derive_pagination(&body, &QueryParams::new()).is_none());
        let text = ResponseBody::Text("x".to_owned());
        assert!(decode::derive_pagination(&text, &QueryParams::new()).is_none());
    }

    #[test]
    fn error_detail_shapes() {
        let wrapped = decode::error_detail(
            Some("application/json"),
            br#"{"error":{"code":404,"message":"Record not found.","context":null}}"#,
        );
        assert_eq!(wrapped.message, "Record not found.");
        assert_eq!(wrapped.code.as_deref(), Some("404"));
        assert!(wrapped.body.is_some());

        let text_error = decode::error_detail(Some("application/json"), br#"{"error":"boom"}"#);
        assert_eq!(text_error.message, "boom");

        let flat = decode::error_detail(
            Some("application/json"),
            br#"{"message":"Invalid filter","code":"BAD_FILTER"}"#,
        );
        assert_eq!(flat.message, "Invalid filter");
        assert_eq!(flat.code.as_deref(), Some("BAD_FILTER"));

        let plain = decode::error_detail(Some("text/html"), b"  Bad Gateway \n");
        assert_eq!(plain.message, "Bad Gateway");
    }

    #[test]
    fn cache_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, no-store"));
        headers.insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        headers.insert(header::AGE, HeaderValue::from_static("12"));

        let info = decode::cache_info(&headers);
        assert!(!info.cacheable);
        assert_eq!(info.etag.as_deref(), Some("\"v1\""));
        assert_eq!(info.age, Some(12));
        assert!(decode::cache_info(&HeaderMap::new()).cacheable);
    }

    #[test]
    fn repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append(header::VARY, HeaderValue::from_static("Accept"));
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
        let normalized = decode::normalize_headers(&headers);
        assert_eq!(normalized["vary"], "Accept, Origin");
    }
}
