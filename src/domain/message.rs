//! Standard messages and normalisation of backend error shapes.
//!
//! Backends report errors in several shapes. OData v2 style:
//!
//! ```text
//! {"error": {"code": "F5/301",
//!            "message": {"lang": "en", "value": "An error occurred"},
//!            "innererror": {"errordetails": [{"code": "AA/344", "message": "Asset class missing", "severity": "error"}]}}}
//! ```
//!
//! plus flat `{"error": {"message": "..."}}`, `{"message": "..."}`, bare JSON
//! strings, plain text bodies and engine-side errors. All of them end up as a
//! `(message, code)` pair in a [`StandardMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BroadsideError;

/// Top-level messages that say nothing about what actually went wrong.
const GENERIC_MESSAGES: &[&str] = &[
    "an error occurred",
    "an exception was raised",
    "an exception occurred",
    "error",
    "internal server error",
    "bad request",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Success,
    Error,
    Warning,
    Info,
}

impl MessageType {
    /// Map a backend severity string ("error", "warning", "info", "success").
    pub fn from_severity(severity: &str) -> Option<Self> {
        match severity.to_ascii_lowercase().as_str() {
            "error" | "abort" => Some(MessageType::Error),
            "warning" => Some(MessageType::Warning),
            "info" | "information" => Some(MessageType::Info),
            "success" => Some(MessageType::Success),
            _ => None,
        }
    }
}

/// Normalised, transport-agnostic record of one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub code: Option<String>,
    pub message: String,
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
    /// Which business module produced the submission
    pub source: String,
    /// The record identity this message is about
    pub entity_id: Option<String>,
    pub batch_index: Option<usize>,
}

/// Message and code extracted from an error payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedError {
    pub message: String,
    pub code: Option<String>,
}

/// Extract the most specific message and code from a JSON error document.
pub fn normalize_error_value(value: &Value) -> NormalizedError {
    match value {
        Value::String(s) => NormalizedError {
            message: s.clone(),
            code: None,
        },
        Value::Object(map) => {
            let error = map.get("error").unwrap_or(value);

            let top_message = error.get("message").and_then(message_text);
            let code = error
                .get("code")
                .and_then(scalar_text)
                .or_else(|| map.get("code").and_then(scalar_text));

            let detail = error
                .get("innererror")
                .and_then(|inner| inner.get("errordetails"))
                .and_then(Value::as_array)
                .and_then(|details| most_specific_detail(details));

            match (top_message, detail) {
                (Some(top), Some((detail_message, detail_code))) if is_generic(&top) => {
                    NormalizedError {
                        message: detail_message,
                        code: detail_code.or(code),
                    }
                }
                (Some(top), _) => NormalizedError { message: top, code },
                (None, Some((detail_message, detail_code))) => NormalizedError {
                    message: detail_message,
                    code: detail_code.or(code),
                },
                (None, None) => NormalizedError {
                    message: value.to_string(),
                    code,
                },
            }
        }
        other => NormalizedError {
            message: other.to_string(),
            code: None,
        },
    }
}

/// Normalise a raw response body, JSON or not.
pub fn normalize_error_body(body: &str) -> NormalizedError {
    let trimmed = body.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => normalize_error_value(&value),
        Err(_) if trimmed.is_empty() => NormalizedError {
            message: "Empty response body".to_string(),
            code: None,
        },
        Err(_) => NormalizedError {
            message: trimmed.to_string(),
            code: None,
        },
    }
}

/// Normalise an engine-side error (network failure, malformed response, ...).
pub fn normalize_engine_error(error: &BroadsideError) -> NormalizedError {
    match error {
        BroadsideError::HttpStatus { body, .. } => {
            let mut normalized = normalize_error_body(body);
            if normalized.code.is_none() {
                normalized.code = Some(error.code().to_string());
            }
            normalized
        }
        other => NormalizedError {
            message: other.to_string(),
            code: Some(other.code().to_string()),
        },
    }
}

fn is_generic(message: &str) -> bool {
    let normalized = message.trim().trim_end_matches(['.', '!']).to_lowercase();
    GENERIC_MESSAGES.contains(&normalized.as_str())
}

/// `message` may be a plain string or an `{ "lang", "value" }` object.
fn message_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(obj) => obj.get("value").and_then(message_text),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-generic error-severity detail, falling back to any non-generic detail.
fn most_specific_detail(details: &[Value]) -> Option<(String, Option<String>)> {
    let candidates: Vec<(String, Option<String>, Option<String>)> = details
        .iter()
        .filter_map(|d| {
            let message = d.get("message").and_then(message_text)?;
            if is_generic(&message) {
                return None;
            }
            let code = d.get("code").and_then(scalar_text);
            let severity = d
                .get("severity")
                .and_then(Value::as_str)
                .map(str::to_lowercase);
            Some((message, code, severity))
        })
        .collect();

    candidates
        .iter()
        .find(|(_, _, severity)| severity.as_deref() == Some("error"))
        .or_else(|| candidates.first())
        .map(|(message, code, _)| (message.clone(), code.clone()))
}

/// The `sap-message` header carried by successful responses: `(type, message, code)`.
pub fn parse_backend_message_header(raw: &str) -> Option<(MessageType, String, Option<String>)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let message = value.get("message").and_then(message_text)?;
    let message_type = value
        .get("severity")
        .and_then(Value::as_str)
        .and_then(MessageType::from_severity)
        .unwrap_or(MessageType::Info);
    let code = value.get("code").and_then(scalar_text);
    Some((message_type, message, code))
}
