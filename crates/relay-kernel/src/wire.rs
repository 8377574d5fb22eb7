//! Line-oriented JSON wire codec.
//!
//! Both directions carry exactly one JSON object per line:
//!
//! ```text
//! Request:  {"request_id": "<uuid>", "action": "<domain>.<operation>", "data": { ... }}
//! Response: {"request_id": "<uuid>", "success": true|false, "data": { ... } | "error": "<message>"}
//! ```
//!
//! Decoding validates the envelope fields only; `data` is passed through
//! untouched.

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Line terminator for every frame.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Errors produced while encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    /// Well-formed JSON whose envelope fields are missing or mistyped.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("frame could not be encoded: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        use serde_json::error::Category;
        match err.classify() {
            Category::Data => ProtocolError::InvalidEnvelope(err.to_string()),
            Category::Syntax | Category::Eof | Category::Io => {
                ProtocolError::InvalidJson(err.to_string())
            }
        }
    }
}

/// A request sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Correlation id echoed back by the worker.
    pub request_id: String,
    /// Namespaced action, e.g. `model.load_model`.
    pub action: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
}

impl Command {
    /// Create a command with a fresh correlation id.
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            action: action.into(),
            data,
        }
    }

    /// Encode as a single newline-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    /// Decode a request line. Used by worker-side code and test doubles.
    pub fn decode(line: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(line)
    }
}

/// A worker's reply to one [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub success: bool,
    /// Payload; `Null` when the worker sent none.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Error message; only meaningful when `success` is false.
    #[serde(
        default,
        deserialize_with = "message_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            data: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Decode one response line.
    ///
    /// Fails if the line is not a JSON object or lacks `request_id` / `success`.
    pub fn decode(line: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(line)
    }

    /// Encode as a single newline-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    /// Payload on success, worker error message otherwise.
    pub fn into_result(self) -> Result<Value, String> {
        if self.success {
            Ok(self.data)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "worker reported failure without a message".to_string()))
        }
    }
}

/// Workers sometimes report structured errors; keep them as JSON text.
fn message_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    // Compact JSON escapes control characters, so the frame never contains
    // a raw newline before the delimiter.
    let mut line = serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    line.push(FRAME_DELIMITER);
    Ok(line)
}

fn decode_frame<T: DeserializeOwned>(line: &[u8]) -> Result<T, ProtocolError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    // Derived struct impls also accept JSON arrays; frames must be objects.
    if !trimmed.starts_with(b"{") {
        return Err(match serde_json::from_slice::<IgnoredAny>(trimmed) {
            Ok(_) => ProtocolError::NotAnObject,
            Err(e) => e.into(),
        });
    }
    Ok(serde_json::from_slice(trimmed)?)
}
