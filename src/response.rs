use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::{ApiError, Result};

/// Parsed response payload.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
    Empty,
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseStatus {
    pub code: u16,
    pub text: String,
    pub success: bool,
}

impl ResponseStatus {
    pub fn new(code: u16) -> Self {
        let text = reqwest::StatusCode::from_u16(code)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or_default()
            .to_owned();
        Self {
            code,
            text,
            success: (200..300).contains(&code),
        }
    }
}

/// Derived from `meta.count`; absent when the body carries no count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pagination {
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    pub has_more: bool,
    pub next_offset: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub cache_control: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Seconds the response spent in a shared cache.
    pub age: Option<u64>,
    /// `false` when the server sent `Cache-Control: no-store`.
    pub cacheable: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    /// Wall time from the first attempt to the parsed body.
    pub duration: Duration,
    pub attempts: u32,
    /// Backoff actually slept between attempts, in order.
    pub retry_delays: Vec<Duration>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            duration: Duration::ZERO,
            attempts: 0,
            retry_delays: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseMeta {
    pub request_id: String,
    pub correlation_id: String,
    pub timing: Timing,
    pub pagination: Option<Pagination>,
    pub cache: CacheInfo,
}

/// A completed response.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseEnvelope {
    pub data: ResponseBody,
    pub status: ResponseStatus,
    /// Lower-cased header names; repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub meta: ResponseMeta,
}

impl ResponseEnvelope {
    /// Builds an envelope that did not come from the network, e.g. a fallback
    /// produced by middleware.
    pub fn new(status: u16, data: ResponseBody) -> Self {
        Self {
            data,
            status: ResponseStatus::new(status),
            headers: BTreeMap::new(),
            meta: ResponseMeta::default(),
        }
    }

    /// Deserializes the JSON body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.data {
            ResponseBody::Json(value) => serde_json::from_value(value.clone())
                .map_err(|err| ApiError::decode(format!("unexpected response shape: {err}"))),
            ResponseBody::Empty => Err(ApiError::decode("response body is empty")),
            _ => Err(ApiError::decode("response body is not JSON")),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::{ResponseBody, ResponseEnvelope, ResponseStatus};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Role {
        id: u64,
        name: String,
    }

    #[test]
    fn typed_json_access() {
        let envelope = ResponseEnvelope::new(200, ResponseBody::Json(json!({"id": 3, "name": "ops"})));
        let role: Role = envelope.json().expect("must decode");
        assert_eq!(
            role,
            Role {
                id: 3,
                name: "ops".to_owned()
            }
        );
    }

    #[test]
    fn json_on_text_body_is_decode_error() {
        let envelope = ResponseEnvelope::new(200, ResponseBody::Text("hello".to_owned()));
        assert!(envelope.json::<Role>().is_err());
    }

    #[test]
    fn status_text_and_success() {
        let ok = ResponseStatus::new(204);
        assert!(ok.success);
        assert_eq!(ok.text, "No Content");
        assert!(!ResponseStatus::new(404).success);
    }
}
