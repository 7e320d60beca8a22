use serde::de::IgnoredAny;
use serde::Deserialize;

/// Error payloads the platform returns on non-success statuses.
///
/// Handles `{"error": {"message": ..., "code": ...}}`, `{"error": "text"}`
/// and flat `{"message": ..., "code": ...}` bodies.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ErrorBody {
    Wrapped { error: ErrorField },
    Flat(ErrorPayload),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ErrorField {
    Text(String),
    Payload(ErrorPayload),
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: Option<String>,
    /// Numeric or string code, depending on the service.
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn into_payload(self) -> ErrorPayload {
        match self {
            Self::Wrapped {
                error: ErrorField::Text(message),
            } => ErrorPayload {
                message: Some(message),
                ..ErrorPayload::default()
            },
            Self::Wrapped {
                error: ErrorField::Payload(payload),
            }
            | Self::Flat(payload) => payload,
        }
    }
}

/// Shape of list responses: `{"resource": [...], "meta": {"count": N}}`.
#[derive(Debug, Deserialize)]
pub struct ListEnvelope {
    #[serde(default)]
    pub resource: Option<Vec<IgnoredAny>>,
    #[serde(default)]
    pub meta: Option<ListMeta>,
}

#[derive(Debug, Deserialize)]
pub struct ListMeta {
    #[serde(default)]
    pub count: Option<u64>,
}
