use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Error, Debug)]
pub enum PeriscopeError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("No credential available: {0}")]
    NoCredential(String),

    #[error("Invalid harvest payload: {0}")]
    InvalidHarvest(String),
}

/// Error wrapper that captures the span trace at the point of conversion, so
/// logs from deep inside the pipeline carry their request context.
#[derive(Debug)]
pub struct ObservedError {
    pub inner: PeriscopeError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<PeriscopeError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            PeriscopeError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            PeriscopeError::Authentication(m) => (
                axum::http::StatusCode::BAD_GATEWAY,
                m.clone(),
                "AUTHENTICATION_ERROR",
            ),
            PeriscopeError::NoCredential(m) => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                m.clone(),
                "NO_CREDENTIAL",
            ),
            PeriscopeError::InvalidHarvest(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_HARVEST",
            ),
            PeriscopeError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            PeriscopeError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            PeriscopeError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({ "error": msg, "code": code })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- CLIENT INGRESS TYPES ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub max_tokens: Option<i64>,
    pub stop: Option<StopSequences>,
    pub tools: Option<Vec<ToolDefinition>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::One(s) => vec![s],
            StopSequences::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    #[default]
    Null,
}

impl MessageContent {
    /// Flattens the message to plain text, joining text parts.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
            MessageContent::Null => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(default)]
    pub function: ToolFunction,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolFunction {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// --- BACKEND WIRE TYPES ---
///
/// The backend emits line-delimited JSON envelopes. Everything is optional:
/// the shapes below are tolerant of the fields the web app omits per chunk.

#[derive(Deserialize, Debug)]
pub struct UpstreamEnvelope {
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub results: Vec<UpstreamResult>,
}

#[derive(Deserialize, Debug)]
pub struct UpstreamResult {
    #[serde(default)]
    pub path: Vec<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<UpstreamErrorEntry>,
    pub data: Option<UpstreamData>,
}

impl UpstreamResult {
    /// The channel identifier is element 2 of `path`; -1 when absent.
    pub fn path_index(&self) -> i64 {
        if self.path.len() >= 3 {
            self.path[2]
                .as_i64()
                .or_else(|| self.path[2].as_str().and_then(|s| s.parse().ok()))
                .unwrap_or(-1)
        } else {
            -1
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct UpstreamErrorEntry {
    #[serde(default = "unknown_error_message")]
    pub message: String,
}

fn unknown_error_message() -> String {
    "Unknown Error".to_string()
}

impl UpstreamErrorEntry {
    /// Heuristic for session/token failures buried in result errors.
    pub fn looks_like_auth_failure(&self) -> bool {
        let lower = self.message.to_lowercase();
        self.message.contains("Recaptcha")
            || self.message.contains("Authentication")
            || lower.contains("token")
    }
}

#[derive(Deserialize, Debug)]
pub struct UpstreamData {
    #[serde(default)]
    pub candidates: Vec<UpstreamCandidate>,
}

#[derive(Deserialize, Debug)]
pub struct UpstreamCandidate {
    pub content: Option<UpstreamContent>,
    #[serde(rename = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct UpstreamContent {
    #[serde(default)]
    pub parts: Vec<UpstreamPart>,
}

#[derive(Deserialize, Debug)]
pub struct UpstreamPart {
    pub text: Option<String>,
    #[serde(default)]
    pub thought: bool,
    #[serde(rename = "inlineData")]
    pub inline_data: Option<UpstreamInlineData>,
    pub uri: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct UpstreamInlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub data: Option<String>,
}

/// --- OUTPUT PROTOCOL TYPES ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<OutputChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChoice {
    pub index: u32,
    pub delta: OutputDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_index_extraction() {
        let result: UpstreamResult =
            serde_json::from_str(r#"{"path": [null, "x", 7], "data": null}"#)
                .expect("valid result");
        assert_eq!(result.path_index(), 7);

        let no_path: UpstreamResult = serde_json::from_str(r#"{"data": null}"#).expect("valid");
        assert_eq!(no_path.path_index(), -1);

        let short_path: UpstreamResult =
            serde_json::from_str(r#"{"path": [1], "data": null}"#).expect("valid");
        assert_eq!(short_path.path_index(), -1);
    }

    #[test]
    fn test_auth_failure_heuristic() {
        let entry = UpstreamErrorEntry {
            message: "Recaptcha challenge required".into(),
        };
        assert!(entry.looks_like_auth_failure());

        let entry = UpstreamErrorEntry {
            message: "Session TOKEN expired".into(),
        };
        assert!(entry.looks_like_auth_failure());

        let entry = UpstreamErrorEntry {
            message: "Quota exceeded for project".into(),
        };
        assert!(!entry.looks_like_auth_failure());
    }

    #[test]
    fn test_envelope_tolerates_missing_fields() {
        let envelope: UpstreamEnvelope = serde_json::from_str(
            r#"{"results": [{"path": [0, 0, 1], "data": {"candidates": [{"content": {"parts": [{"text": "hi"}]}}]}}]}"#,
        )
        .expect("valid envelope");
        assert_eq!(envelope.results.len(), 1);
        let candidate = &envelope.results[0].data.as_ref().unwrap().candidates[0];
        assert!(candidate.finish_reason.is_none());
        assert_eq!(
            candidate.content.as_ref().unwrap().parts[0].text.as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn test_delta_serialization_skips_absent_fields() {
        let delta = OutputDelta {
            role: None,
            content: Some("x".into()),
            reasoning_content: None,
        };
        let json = serde_json::to_string(&delta).expect("serializable");
        assert_eq!(json, r#"{"content":"x"}"#);
    }
}
